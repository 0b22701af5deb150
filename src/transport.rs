//! Per-device command transport.
//! Owns one TCP connection, negotiates the protocol variant on first contact,
//! and runs the strict request/response exchange with a per-call deadline.

use crate::codec;
use crate::error::{KasaError, Result};
use crate::klap::{self, Credentials, KlapSession};
use log::{debug, info, warn};
use serde_json::Value;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock as StdRwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

/// Default TCP/UDP port of legacy-firmware devices.
pub const LEGACY_PORT: u16 = 9999;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network location of one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl Endpoint {
    pub fn new(host: IpAddr, tcp_port: u16) -> Self {
        Self {
            host,
            tcp_port,
            udp_port: LEGACY_PORT,
        }
    }

    /// Endpoint with the legacy default ports.
    pub fn legacy(host: IpAddr) -> Self {
        Self::new(host, LEGACY_PORT)
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.tcp_port)
    }
}

/// The two wire-protocol generations. Fixed per firmware; determined at first
/// successful contact (or from the discovery summary) and cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    /// Length-prefixed autokey-XOR frames, no handshake.
    Legacy,
    /// KLAP: authenticated handshake, encrypted HTTP-style exchanges.
    Klap,
}

/// Live connection state. Exclusively owned by one transport; recreated after
/// any failure, never shared.
enum Session {
    Legacy(TcpStream),
    Klap {
        stream: TcpStream,
        session: KlapSession,
        cookie: Option<String>,
    },
}

/// One TCP command channel to one device.
///
/// The connection is opened lazily on first call and reused while healthy.
/// Requests are strictly sequential: the session lives behind a mutex, so a
/// second concurrent call queues behind the first and responses can never
/// interleave. The transport never retries on its own: a timed-out call's
/// device-side effect is unknown, and blind retry against a physical relay is
/// a caller decision.
pub struct Transport {
    endpoint: StdRwLock<Endpoint>,
    credentials: Credentials,
    timeout: Duration,
    variant: StdRwLock<Option<ProtocolVariant>>,
    session: Mutex<Option<Session>>,
}

impl Transport {
    pub fn new(endpoint: Endpoint, credentials: Credentials) -> Self {
        Self {
            endpoint: StdRwLock::new(endpoint),
            credentials,
            timeout: DEFAULT_TIMEOUT,
            variant: StdRwLock::new(None),
            session: Mutex::new(None),
        }
    }

    /// Set the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pre-set the protocol variant (e.g. classified during discovery),
    /// skipping negotiation on first contact.
    pub fn with_variant(self, variant: ProtocolVariant) -> Self {
        *self.variant.write().expect("variant lock poisoned") = Some(variant);
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        *self.endpoint.read().expect("endpoint lock poisoned")
    }

    /// The negotiated variant, if first contact has happened.
    pub fn variant(&self) -> Option<ProtocolVariant> {
        *self.variant.read().expect("variant lock poisoned")
    }

    /// Move the transport to a new endpoint (the device's address changed).
    /// Drops any open connection so the next call reconnects.
    pub async fn set_endpoint(&self, endpoint: Endpoint) {
        let mut guard = self.session.lock().await;
        *guard = None;
        *self.endpoint.write().expect("endpoint lock poisoned") = endpoint;
    }

    /// Close the connection. The next call transparently reconnects.
    pub async fn close(&self) {
        *self.session.lock().await = None;
    }

    /// Issue one command document and return the mirrored response document.
    ///
    /// Bounded by the configured per-call timeout; on expiry the connection is
    /// discarded (the protocol cannot cancel an in-flight device operation,
    /// so a reused connection could serve a stale response) and
    /// `KasaError::Timeout` is surfaced.
    pub async fn call(&self, request: &Value) -> Result<Value> {
        self.call_with_timeout(request, self.timeout).await
    }

    /// [`call`](Self::call) with an explicit deadline.
    pub async fn call_with_timeout(&self, request: &Value, deadline: Duration) -> Result<Value> {
        let mut guard = self.session.lock().await;

        let result = match timeout(deadline, self.call_locked(&mut guard, request)).await {
            Ok(r) => r,
            Err(_) => Err(KasaError::Timeout),
        };

        if let Err(e) = &result
            && e.discards_connection()
        {
            debug!(
                "Discarding connection to {} after error: {}",
                self.endpoint().tcp_addr(),
                e
            );
            *guard = None;
        }
        result
    }

    async fn call_locked(&self, guard: &mut Option<Session>, request: &Value) -> Result<Value> {
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let session = guard
            .as_mut()
            .ok_or_else(|| KasaError::Connection("no session".into()))?;

        match self.exchange(session, request).await {
            Err(e @ KasaError::Handshake(_)) => {
                // The device invalidated the session (e.g. sequence regression).
                // Tear it down; the next call performs a fresh handshake.
                *guard = None;
                Err(e)
            }
            other => other,
        }
    }

    /// Open a connection, negotiating the variant on first contact: the
    /// authenticated handshake is attempted first, and a connection-level
    /// rejection (not command trial-and-error) selects the legacy framing.
    async fn connect(&self) -> Result<Session> {
        let endpoint = self.endpoint();
        let addr = endpoint.tcp_addr();
        let host = endpoint.host.to_string();

        match self.variant() {
            Some(ProtocolVariant::Legacy) => {
                debug!("Connecting to {} (legacy)", addr);
                Ok(Session::Legacy(TcpStream::connect(addr).await?))
            }
            Some(ProtocolVariant::Klap) => {
                debug!("Connecting to {} (klap)", addr);
                let mut stream = TcpStream::connect(addr).await?;
                match klap::establish(&mut stream, &host, &self.credentials).await? {
                    Some(est) => Ok(Session::Klap {
                        stream,
                        session: est.session,
                        cookie: est.cookie,
                    }),
                    // The variant never changes without a factory reset, so a
                    // refusal here is a connection problem, not a downgrade.
                    None => Err(KasaError::Connection(
                        "device refused the authenticated handshake".into(),
                    )),
                }
            }
            None => {
                debug!("Negotiating protocol variant with {}", addr);
                let mut stream = TcpStream::connect(addr).await?;
                match klap::establish(&mut stream, &host, &self.credentials).await? {
                    Some(est) => {
                        info!("Device {} speaks the authenticated protocol", addr);
                        self.cache_variant(ProtocolVariant::Klap);
                        Ok(Session::Klap {
                            stream,
                            session: est.session,
                            cookie: est.cookie,
                        })
                    }
                    None => {
                        info!("Device {} fell back to the legacy protocol", addr);
                        self.cache_variant(ProtocolVariant::Legacy);
                        // The probed connection is unusable for framed traffic.
                        Ok(Session::Legacy(TcpStream::connect(addr).await?))
                    }
                }
            }
        }
    }

    fn cache_variant(&self, variant: ProtocolVariant) {
        *self.variant.write().expect("variant lock poisoned") = Some(variant);
    }

    async fn exchange(&self, session: &mut Session, request: &Value) -> Result<Value> {
        let payload = serde_json::to_vec(request)?;
        debug!("-> {}", String::from_utf8_lossy(&payload));

        let raw = match session {
            Session::Legacy(stream) => Self::exchange_legacy(stream, &payload).await?,
            Session::Klap {
                stream,
                session,
                cookie,
            } => {
                let host = self.endpoint().host.to_string();
                Self::exchange_klap(stream, session, cookie.as_deref(), &host, &payload).await?
            }
        };

        debug!("<- {}", String::from_utf8_lossy(&raw));
        serde_json::from_slice(&raw).map_err(|e| {
            warn!("Undecodable response payload: {}", hex::encode(&raw));
            KasaError::Json(e.to_string())
        })
    }

    async fn exchange_legacy(stream: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>> {
        stream.write_all(&codec::encode(payload)).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.map_err(eof_as_framing)?;
        let len = codec::declared_len(header)?;

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.map_err(eof_as_framing)?;
        Ok(codec::deobfuscate(&body))
    }

    async fn exchange_klap(
        stream: &mut TcpStream,
        session: &mut KlapSession,
        cookie: Option<&str>,
        host: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let (msg, seq) = session.encrypt(payload);
        klap::send_post(stream, host, &klap::request_path(seq), cookie, &msg).await?;

        let resp = klap::read_response(stream).await?;
        if resp.status != 200 {
            return Err(KasaError::Handshake(format!(
                "session rejected with status {}",
                resp.status
            )));
        }
        session.decrypt(&resp.body)
    }
}

/// A peer that closes mid-frame delivered fewer bytes than declared.
fn eof_as_framing(e: std::io::Error) -> KasaError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        KasaError::Framing("connection closed mid-frame".into())
    } else {
        e.into()
    }
}
