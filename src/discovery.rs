//! UDP broadcast discovery.
//! Sends the legacy-framed probe, collects responses for a bounded window,
//! and classifies each responder by protocol generation and device family.

use crate::codec;
use crate::device::DeviceDescriptor;
use crate::error::Result;
use crate::transport::{Endpoint, LEGACY_PORT, ProtocolVariant};
use futures_core::stream::Stream;
use log::{debug, info, warn};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// The probe every Kasa device answers, datagram-framed with the legacy codec.
const DISCOVERY_PROBE: &[u8] = br#"{"system":{"get_sysinfo":{}}}"#;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const KLAP_DEFAULT_HTTP_PORT: u16 = 80;

/// One responder: where it is, which protocol generation it speaks, and the
/// decoded identity summary.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub endpoint: Endpoint,
    pub variant: ProtocolVariant,
    pub descriptor: DeviceDescriptor,
}

/// Discovers Kasa devices on the local network using UDP broadcast.
///
/// Each discovery run is independent: one probe datagram, then a listen
/// window of the configured timeout. No state is shared across runs.
pub struct Discovery {
    /// Listen window duration.
    pub timeout: Duration,
    /// Local address to bind to.
    pub bind_addr: IpAddr,
    /// Probe destination (subnet broadcast overridable for routed setups).
    pub broadcast_addr: SocketAddr,
}

impl Default for Discovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            broadcast_addr: SocketAddr::from(([255, 255, 255, 255], LEGACY_PORT)),
        }
    }

    /// Set the listen window.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the broadcast destination.
    pub fn with_broadcast_addr(mut self, addr: SocketAddr) -> Self {
        self.broadcast_addr = addr;
        self
    }

    /// Override the local bind address.
    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a broadcast-capable UDP socket on an ephemeral port.
    fn create_socket(&self) -> Result<UdpSocket> {
        let addr: SocketAddr = SocketAddr::new(self.bind_addr, 0);
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Send the probe and spawn the listen task feeding the returned channel.
    /// The task exits when the window elapses or the token is cancelled.
    async fn start(&self) -> Result<(mpsc::Receiver<DiscoveredDevice>, CancellationToken)> {
        let socket = self.create_socket()?;
        let probe = codec::obfuscate(DISCOVERY_PROBE);

        info!("Broadcasting discovery probe to {}", self.broadcast_addr);
        socket.send_to(&probe, self.broadcast_addr).await?;

        let (tx, rx) = mpsc::channel::<DiscoveredDevice>(32);
        let cancel_token = CancellationToken::new();
        let ct = cancel_token.clone();
        let deadline = Instant::now() + self.timeout;

        tokio::spawn(async move {
            let mut seen: HashSet<IpAddr> = HashSet::new();
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = sleep_until(deadline) => {
                        debug!("Discovery window elapsed ({} responder(s))", seen.len());
                        break;
                    }
                    res = socket.recv_from(&mut buf) => {
                        let (len, addr) = match res {
                            Ok(r) => r,
                            Err(e) => {
                                warn!("Discovery socket error: {}", e);
                                break;
                            }
                        };
                        // Deduplicate by source address. Only a decodable
                        // datagram claims the slot, so a corrupted one does
                        // not suppress a later announcement from the same
                        // device within the window.
                        if seen.contains(&addr.ip()) {
                            continue;
                        }
                        match parse_datagram(&buf[..len], addr) {
                            Some(found) => {
                                seen.insert(addr.ip());
                                debug!(
                                    "Discovered {} ({:?}) at {}",
                                    found.descriptor.device_id, found.variant, addr
                                );
                                if tx.send(found).await.is_err() {
                                    break;
                                }
                            }
                            // One broken responder must not end the run.
                            None => warn!("Skipping undecodable discovery response from {}", addr),
                        }
                    }
                }
            }
        });

        Ok((rx, cancel_token))
    }

    /// Run one discovery pass and collect every distinct responder.
    pub async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let (mut rx, _cancel) = self.start().await?;
        let mut found = Vec::new();
        while let Some(d) = rx.recv().await {
            found.push(d);
        }
        info!("Discovery finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Lazily yield responders as their datagrams arrive. Dropping the stream
    /// cancels the listen task.
    pub async fn stream(&self) -> Result<impl Stream<Item = DiscoveredDevice> + Send + 'static> {
        let (mut rx, cancel) = self.start().await?;
        Ok(async_stream::stream! {
            let _guard = cancel.drop_guard();
            while let Some(d) = rx.recv().await {
                yield d;
            }
        })
    }
}

/// Decode one response datagram into a discovered device, or `None` if it is
/// malformed in any way.
fn parse_datagram(data: &[u8], addr: SocketAddr) -> Option<DiscoveredDevice> {
    let plain = codec::deobfuscate(data);
    let doc: Value = match serde_json::from_slice(&plain) {
        Ok(v) => v,
        Err(e) => {
            debug!("Response from {} is not JSON: {}", addr, e);
            return None;
        }
    };

    // Responses mirror the probe shape; tolerate a bare sysinfo object too.
    let sysinfo = doc
        .pointer("/system/get_sysinfo")
        .unwrap_or(&doc);

    let descriptor = match DeviceDescriptor::from_sysinfo(sysinfo) {
        Ok(d) => d,
        Err(e) => {
            debug!("Response from {} has no usable sysinfo: {}", addr, e);
            return None;
        }
    };

    let (variant, tcp_port) = classify(sysinfo);
    Some(DiscoveredDevice {
        endpoint: Endpoint {
            host: addr.ip(),
            tcp_port,
            udp_port: addr.port(),
        },
        variant,
        descriptor,
    })
}

/// Classify the protocol generation from the summary document. Devices on the
/// newer firmware answer the same broadcast but advertise their encryption
/// scheme; the handshake itself is deferred to first transport use.
fn classify(sysinfo: &Value) -> (ProtocolVariant, u16) {
    if let Some(schm) = sysinfo.get("mgt_encrypt_schm")
        && schm.get("encrypt_type").and_then(Value::as_str) == Some("KLAP")
    {
        let port = schm
            .get("http_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .unwrap_or(KLAP_DEFAULT_HTTP_PORT);
        return (ProtocolVariant::Klap, port);
    }
    (ProtocolVariant::Legacy, LEGACY_PORT)
}
