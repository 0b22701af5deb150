//! In-process mock devices for integration tests: a legacy-framed TCP
//! responder, a KLAP HTTP-style responder, and UDP discovery responders that
//! answer a broadcast probe from configurable source addresses.
#![allow(dead_code)]

use rustkasa::codec;
use rustkasa::klap::{Credentials, KlapSession};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Maps a decoded request document to a response document; `None` means
/// "swallow the request and never answer".
pub type Handler = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Handler answering `get_sysinfo` from shared mutable sysinfo, with relay
/// writes applied to it.
pub fn sysinfo_handler(sysinfo: Arc<Mutex<Value>>) -> Handler {
    Arc::new(move |req| {
        if req.pointer("/system/get_sysinfo").is_some() {
            let info = sysinfo.lock().unwrap().clone();
            return Some(serde_json::json!({ "system": { "get_sysinfo": info } }));
        }
        if let Some(args) = req.pointer("/system/set_relay_state") {
            let state = args.get("state").cloned().unwrap_or(0.into());
            sysinfo.lock().unwrap()["relay_state"] = state;
            return Some(serde_json::json!({
                "system": { "set_relay_state": { "err_code": 0 } }
            }));
        }
        Some(serde_json::json!({ "err_code": -2 }))
    })
}

/// Spawn a legacy-protocol device on `bind` (use port 0 for ephemeral).
/// Returns the bound address and an accept counter, so tests can observe
/// reconnects.
pub async fn spawn_legacy_device(bind: &str, handler: Handler) -> (SocketAddr, Arc<AtomicUsize>) {
    init_logging();
    let listener = TcpListener::bind(bind).await.expect("bind legacy mock");
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_task = accepts.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepts_task.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move { serve_legacy_conn(stream, handler).await });
        }
    });

    (addr, accepts)
}

async fn serve_legacy_conn(mut stream: TcpStream, handler: Handler) {
    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        // A KLAP handshake attempt against legacy firmware: the connection
        // is simply dropped, which is the fallback indicator.
        if &header == b"POST" {
            return;
        }
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }
        let Ok(request) = serde_json::from_slice::<Value>(&codec::deobfuscate(&body)) else {
            return;
        };
        match handler(&request) {
            Some(response) => {
                let payload = serde_json::to_vec(&response).unwrap();
                if stream.write_all(&codec::encode(&payload)).await.is_err() {
                    return;
                }
            }
            // Swallow the request; the client is expected to time out.
            None => continue,
        }
    }
}

fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

struct MockHttpRequest {
    path: String,
    seq: Option<i32>,
    body: Vec<u8>,
}

async fn read_http_request(stream: &mut TcpStream) -> Option<MockHttpRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    let header_end = loop {
        if let Some(p) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break p;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.lines();
    let target = lines.next()?.split_whitespace().nth(1)?.to_string();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target, None),
    };
    let seq = query
        .as_deref()
        .and_then(|q| q.strip_prefix("seq="))
        .and_then(|s| s.parse().ok());

    let mut content_length = 0usize;
    for line in lines {
        if let Some((name, value)) = line.split_once(':')
            && name.eq_ignore_ascii_case("content-length")
        {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(MockHttpRequest { path, seq, body })
}

async fn write_http_response(
    stream: &mut TcpStream,
    status: u16,
    cookie: Option<&str>,
    body: &[u8],
) -> std::io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {} OK\r\nContent-Length: {}\r\n",
        status,
        body.len()
    );
    if let Some(c) = cookie {
        head.push_str(&format!("Set-Cookie: TP_SESSIONID={};TIMEOUT=86400\r\n", c));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await
}

/// Spawn a KLAP-protocol device on `bind`. Performs the full two-round
/// handshake (verifying the client's round-2 hash) and serves encrypted
/// requests through `handler`.
pub async fn spawn_klap_device(
    bind: &str,
    credentials: Credentials,
    handler: Handler,
) -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_klap_device_inner(bind, credentials, handler, false).await
}

/// KLAP device whose first encrypted-request response is a garbled byte
/// burst with trailing stray bytes; every later exchange is well formed.
pub async fn spawn_klap_device_glitched(
    bind: &str,
    credentials: Credentials,
    handler: Handler,
) -> (SocketAddr, Arc<AtomicUsize>) {
    spawn_klap_device_inner(bind, credentials, handler, true).await
}

async fn spawn_klap_device_inner(
    bind: &str,
    credentials: Credentials,
    handler: Handler,
    glitch_first: bool,
) -> (SocketAddr, Arc<AtomicUsize>) {
    init_logging();
    let listener = TcpListener::bind(bind).await.expect("bind klap mock");
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicUsize::new(0));
    let accepts_task = accepts.clone();
    let glitch = Arc::new(AtomicBool::new(glitch_first));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            accepts_task.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            let auth_hash = credentials.auth_hash();
            let glitch = glitch.clone();
            tokio::spawn(
                async move { serve_klap_conn(stream, auth_hash, handler, glitch).await },
            );
        }
    });

    (addr, accepts)
}

async fn serve_klap_conn(
    mut stream: TcpStream,
    auth_hash: [u8; 16],
    handler: Handler,
    glitch: Arc<AtomicBool>,
) {
    let mut seeds: Option<(Vec<u8>, [u8; 16])> = None;
    let mut session: Option<KlapSession> = None;

    while let Some(req) = read_http_request(&mut stream).await {
        match req.path.as_str() {
            "/app/handshake1" => {
                let local_seed = req.body.clone();
                let remote_seed = [7u8; 16];
                let server_hash = sha256_parts(&[&local_seed, &remote_seed, &auth_hash]);
                let mut body = remote_seed.to_vec();
                body.extend_from_slice(&server_hash);
                seeds = Some((local_seed, remote_seed));
                if write_http_response(&mut stream, 200, Some("MOCKSESSION"), &body)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            "/app/handshake2" => {
                let Some((local_seed, remote_seed)) = seeds.as_ref() else {
                    return;
                };
                let expected = sha256_parts(&[remote_seed, local_seed, &auth_hash]);
                let status = if req.body == expected { 200 } else { 403 };
                if status == 200 {
                    session = Some(KlapSession::new(local_seed, remote_seed, &auth_hash));
                }
                if write_http_response(&mut stream, status, None, b"").await.is_err() {
                    return;
                }
            }
            "/app/request" => {
                if glitch.swap(false, Ordering::SeqCst) {
                    if stream.write_all(b"GARBLED\r\n\r\n\x00\x00").await.is_err() {
                        return;
                    }
                    continue;
                }
                let (Some(sess), Some(seq)) = (session.as_ref(), req.seq) else {
                    return;
                };
                let Ok(plain) = sess.decrypt_with_seq(&req.body, seq) else {
                    let _ = write_http_response(&mut stream, 403, None, b"").await;
                    continue;
                };
                let Ok(request) = serde_json::from_slice::<Value>(&plain) else {
                    return;
                };
                match handler(&request) {
                    Some(response) => {
                        let payload = serde_json::to_vec(&response).unwrap();
                        let msg = sess.encrypt_with_seq(&payload, seq);
                        if write_http_response(&mut stream, 200, None, &msg).await.is_err() {
                            return;
                        }
                    }
                    None => continue,
                }
            }
            _ => return,
        }
    }
}

/// One scripted discovery responder: the datagram it sends and the source
/// address it sends from.
#[derive(Clone)]
pub struct UdpResponder {
    pub source: SocketAddr,
    pub datagram: Vec<u8>,
}

impl UdpResponder {
    /// A well-formed responder wrapping `sysinfo` in the mirrored probe shape.
    pub fn well_formed(source: &str, sysinfo: Value) -> Self {
        let doc = serde_json::json!({ "system": { "get_sysinfo": sysinfo } });
        Self {
            source: source.parse().unwrap(),
            datagram: codec::obfuscate(&serde_json::to_vec(&doc).unwrap()),
        }
    }

    /// A responder emitting bytes no codec or parser accepts.
    pub fn corrupted(source: &str) -> Self {
        Self {
            source: source.parse().unwrap(),
            datagram: vec![0xde, 0xad, 0xbe, 0xef, 0x00],
        }
    }
}

/// Spawn a probe target that, on every received datagram, answers from each
/// configured responder's source address. The responder set can be swapped
/// between discovery runs.
pub async fn spawn_discovery_responders(
    responders: Vec<UdpResponder>,
) -> (SocketAddr, Arc<Mutex<Vec<UdpResponder>>>) {
    init_logging();
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind probe target");
    let addr = socket.local_addr().unwrap();
    let shared = Arc::new(Mutex::new(responders));
    let shared_task = shared.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let Ok((_, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let current = shared_task.lock().unwrap().clone();
            for responder in current {
                if let Ok(reply) = UdpSocket::bind(responder.source).await {
                    let _ = reply.send_to(&responder.datagram, from).await;
                }
            }
        }
    });

    (addr, shared)
}

/// Sysinfo for a basic legacy plug (no metering, to keep mocks single-module).
pub fn plug_sysinfo(id: &str, relay_on: bool) -> Value {
    serde_json::json!({
        "sw_ver": "1.5.6", "model": "HS100(EU)", "deviceId": id,
        "alias": "mock-plug", "type": "IOT.SMARTPLUGSWITCH",
        "relay_state": i32::from(relay_on), "on_time": 10,
        "led_off": 0, "err_code": 0
    })
}

/// Sysinfo advertising the KLAP scheme on `http_port`.
pub fn klap_plug_sysinfo(id: &str, relay_on: bool, http_port: u16) -> Value {
    let mut info = plug_sysinfo(id, relay_on);
    info["model"] = "KP125(US)".into();
    info["mgt_encrypt_schm"] = serde_json::json!({
        "is_support_https": false, "encrypt_type": "KLAP", "http_port": http_port
    });
    info
}
