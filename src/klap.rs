//! KLAP session protocol: the authenticated handshake used by newer Kasa
//! firmware, plus the per-session payload encryption.
//!
//! The exchange is two sequential HTTP-style POSTs over one TCP connection:
//! round 1 proves both sides know the credentials hash and yields a session
//! cookie, round 2 confirms the client-side handshake hash. Subsequent
//! commands are AES-128-CBC encrypted and signed under keys derived from the
//! two handshake seeds, with a signed 32-bit sequence number the device also
//! tracks.

use crate::codec::MAX_FRAME_LEN;
use crate::error::{KasaError, Result};
use aes::Aes128;
use cbc::{Decryptor, Encryptor};
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use log::debug;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const HANDSHAKE1_PATH: &str = "/app/handshake1";
const HANDSHAKE2_PATH: &str = "/app/handshake2";
const REQUEST_PATH: &str = "/app/request";
const SESSION_COOKIE: &str = "TP_SESSIONID";

const SEED_LEN: usize = 16;
const SHA256_LEN: usize = 32;
const SIG_LEN: usize = 28;

/// Credentials for the authenticated protocol. Devices provisioned without an
/// account accept the hash of empty credentials.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// md5(md5(username) || md5(password)), the first-generation KLAP
    /// credentials hash.
    pub fn auth_hash(&self) -> [u8; 16] {
        let user = Md5::digest(self.username.as_bytes());
        let pass = Md5::digest(self.password.as_bytes());
        let mut outer = Md5::new();
        outer.update(user);
        outer.update(pass);
        outer.finalize().into()
    }
}

fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// Hash the device must return in handshake round 1.
fn server_hash(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256_concat(&[local_seed, remote_seed, auth_hash])
}

/// Hash the client sends in handshake round 2.
fn handshake2_hash(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> [u8; 32] {
    sha256_concat(&[remote_seed, local_seed, auth_hash])
}

/// Key material and sequence state for one established KLAP session.
///
/// Encryption and decryption are symmetric: the device encrypts its response
/// under the same sequence number as the request, so a test double can drive
/// the opposite side with another instance built from the same seeds.
pub struct KlapSession {
    key: [u8; 16],
    iv_base: [u8; 12],
    sig: [u8; SIG_LEN],
    seq: i32,
}

impl KlapSession {
    /// Derive session material from the two handshake seeds and the
    /// credentials hash.
    pub fn new(local_seed: &[u8], remote_seed: &[u8], auth_hash: &[u8]) -> Self {
        let key_full = sha256_concat(&[b"lsk", local_seed, remote_seed, auth_hash]);
        let iv_full = sha256_concat(&[b"iv", local_seed, remote_seed, auth_hash]);
        let sig_full = sha256_concat(&[b"ldk", local_seed, remote_seed, auth_hash]);

        let mut key = [0u8; 16];
        key.copy_from_slice(&key_full[..16]);
        let mut iv_base = [0u8; 12];
        iv_base.copy_from_slice(&iv_full[..12]);
        let mut sig = [0u8; SIG_LEN];
        sig.copy_from_slice(&sig_full[..SIG_LEN]);
        // The last four bytes of the iv digest seed the sequence counter.
        let seq = i32::from_be_bytes([iv_full[28], iv_full[29], iv_full[30], iv_full[31]]);

        Self {
            key,
            iv_base,
            sig,
            seq,
        }
    }

    /// Sequence number of the most recent [`encrypt`](Self::encrypt).
    pub fn seq(&self) -> i32 {
        self.seq
    }

    fn iv_for(&self, seq: i32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        iv[..12].copy_from_slice(&self.iv_base);
        iv[12..].copy_from_slice(&seq.to_be_bytes());
        iv
    }

    /// Encrypt a request payload, advancing the sequence counter.
    /// Returns the wire message (32-byte signature || ciphertext) and the
    /// sequence number to place in the request query string.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> (Vec<u8>, i32) {
        self.seq = self.seq.wrapping_add(1);
        let msg = self.encrypt_with_seq(plaintext, self.seq);
        (msg, self.seq)
    }

    /// Encrypt under an explicit sequence number without touching the counter.
    /// The device side of the exchange encrypts its response this way.
    pub fn encrypt_with_seq(&self, plaintext: &[u8], seq: i32) -> Vec<u8> {
        // Manual PKCS7 padding, then CBC block encryption.
        let pad_len = 16 - plaintext.len() % 16;
        let mut padded = plaintext.to_vec();
        padded.resize(plaintext.len() + pad_len, pad_len as u8);

        let mut encryptor = Encryptor::<Aes128>::new(&self.key.into(), &self.iv_for(seq).into());
        for chunk in padded.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            encryptor.encrypt_block_mut(block);
        }

        let signature = sha256_concat(&[&self.sig, &seq.to_be_bytes(), &padded]);
        let mut msg = Vec::with_capacity(SHA256_LEN + padded.len());
        msg.extend_from_slice(&signature);
        msg.append(&mut padded);
        msg
    }

    /// Decrypt a response encrypted under the current sequence number.
    pub fn decrypt(&self, msg: &[u8]) -> Result<Vec<u8>> {
        self.decrypt_with_seq(msg, self.seq)
    }

    /// Decrypt a message encrypted under an explicit sequence number.
    pub fn decrypt_with_seq(&self, msg: &[u8], seq: i32) -> Result<Vec<u8>> {
        if msg.len() < SHA256_LEN || !(msg.len() - SHA256_LEN).is_multiple_of(16) {
            return Err(KasaError::Handshake("malformed session payload".into()));
        }
        let mut plaintext = msg[SHA256_LEN..].to_vec();

        let mut decryptor = Decryptor::<Aes128>::new(&self.key.into(), &self.iv_for(seq).into());
        for chunk in plaintext.chunks_mut(16) {
            let block = cipher::generic_array::GenericArray::from_mut_slice(chunk);
            decryptor.decrypt_block_mut(block);
        }

        // Manual PKCS7 unpadding; a bad pad means the session key no longer
        // matches the device's, i.e. the session was invalidated.
        let pad_len = *plaintext.last().unwrap_or(&0) as usize;
        if pad_len == 0 || pad_len > 16 || pad_len > plaintext.len() {
            return Err(KasaError::Handshake("session payload padding invalid".into()));
        }
        for i in 0..pad_len {
            if plaintext[plaintext.len() - 1 - i] != pad_len as u8 {
                return Err(KasaError::Handshake("session payload padding invalid".into()));
            }
        }
        plaintext.truncate(plaintext.len() - pad_len);
        Ok(plaintext)
    }
}

/// A parsed HTTP-style response from the device.
pub(crate) struct HttpResponse {
    pub status: u16,
    pub cookie: Option<String>,
    pub body: Vec<u8>,
}

/// Write a minimal HTTP/1.1 POST with a binary body.
pub(crate) async fn send_post(
    stream: &mut TcpStream,
    host: &str,
    path: &str,
    cookie: Option<&str>,
    body: &[u8],
) -> Result<()> {
    let mut req = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\n",
        path,
        host,
        body.len()
    );
    if let Some(c) = cookie {
        req.push_str(&format!("Cookie: {}={}\r\n", SESSION_COOKIE, c));
    }
    req.push_str("\r\n");

    stream.write_all(req.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}

/// Read a minimal HTTP/1.1 response. Returns `KasaError::Protocol` if the
/// peer's bytes are not HTTP at all, which is how a legacy-firmware device
/// reveals itself.
pub(crate) async fn read_response(stream: &mut TcpStream) -> Result<HttpResponse> {
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];

    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > 8192 {
            return Err(KasaError::Protocol("oversized response header".into()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(KasaError::Connection("connection closed mid-response".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or("");
    if !status_line.starts_with("HTTP/1.") {
        return Err(KasaError::Protocol("response is not HTTP".into()));
    }
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KasaError::Protocol("malformed status line".into()))?;

    let mut content_length = 0usize;
    let mut cookie = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("set-cookie")
            && let Some(rest) = value.strip_prefix(SESSION_COOKIE)
            && let Some(v) = rest.strip_prefix('=')
        {
            cookie = Some(v.split(';').next().unwrap_or("").to_string());
        }
    }

    // Same cap as the legacy frame codec: a corrupt or hostile length must
    // fail before any buffering.
    if content_length > MAX_FRAME_LEN {
        return Err(KasaError::Protocol(format!(
            "declared body length {} exceeds maximum {}",
            content_length, MAX_FRAME_LEN
        )));
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(KasaError::Connection("connection closed mid-body".into()));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Ok(HttpResponse {
        status,
        cookie,
        body,
    })
}

/// Outcome of a handshake attempt: the session plus the cookie that must
/// accompany every subsequent request.
pub struct Established {
    pub session: KlapSession,
    pub cookie: Option<String>,
}

/// Perform the two-round handshake on a fresh connection.
///
/// Returns `Ok(None)` when the peer rejects the exchange at the connection
/// level (reset, or a non-HTTP byte stream), the indicator that the device
/// speaks only the legacy protocol. A credential mismatch is
/// `KasaError::Handshake` and must not trigger a legacy fallback or retries.
pub async fn establish(
    stream: &mut TcpStream,
    host: &str,
    credentials: &Credentials,
) -> Result<Option<Established>> {
    let auth_hash = credentials.auth_hash();

    let mut local_seed = [0u8; SEED_LEN];
    rand::rng().fill_bytes(&mut local_seed);

    debug!("KLAP handshake1 with {}", host);
    if let Err(e) = send_post(stream, host, HANDSHAKE1_PATH, None, &local_seed).await {
        return not_klap_or(e);
    }
    let resp1 = match read_response(stream).await {
        Ok(r) => r,
        Err(e) => return not_klap_or(e),
    };
    if resp1.status != 200 {
        // The endpoint exists but refused us: an authentication problem,
        // not a protocol mismatch.
        return Err(KasaError::Handshake(format!(
            "handshake1 rejected with status {}",
            resp1.status
        )));
    }
    if resp1.body.len() < SEED_LEN + SHA256_LEN {
        return Err(KasaError::Handshake("handshake1 response too short".into()));
    }

    let remote_seed = &resp1.body[..SEED_LEN];
    let remote_hash = &resp1.body[SEED_LEN..SEED_LEN + SHA256_LEN];
    if server_hash(&local_seed, remote_seed, &auth_hash) != remote_hash {
        return Err(KasaError::Handshake(
            "server hash mismatch (wrong credentials)".into(),
        ));
    }

    debug!("KLAP handshake2 with {}", host);
    let payload = handshake2_hash(&local_seed, remote_seed, &auth_hash);
    send_post(
        stream,
        host,
        HANDSHAKE2_PATH,
        resp1.cookie.as_deref(),
        &payload,
    )
    .await?;
    let resp2 = read_response(stream).await?;
    if resp2.status != 200 {
        return Err(KasaError::Handshake(format!(
            "handshake2 rejected with status {}",
            resp2.status
        )));
    }

    Ok(Some(Established {
        session: KlapSession::new(&local_seed, remote_seed, &auth_hash),
        cookie: resp1.cookie,
    }))
}

/// Map connection-level rejection to `Ok(None)`; everything else propagates.
fn not_klap_or(e: KasaError) -> Result<Option<Established>> {
    match e {
        KasaError::Protocol(_) | KasaError::Connection(_) => Ok(None),
        other => Err(other),
    }
}

/// Build the request path for an encrypted command.
pub(crate) fn request_path(seq: i32) -> String {
    format!("{}?seq={}", REQUEST_PATH, seq)
}
