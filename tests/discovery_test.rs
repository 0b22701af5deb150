mod common;

use common::{UdpResponder, spawn_discovery_responders};
use rustkasa::{Discovery, ProtocolVariant};
use tokio::time::Duration;

fn local_discovery(target: std::net::SocketAddr) -> Discovery {
    Discovery::new()
        .with_timeout(Duration::from_millis(500))
        .with_bind_addr("127.0.0.1".parse().unwrap())
        .with_broadcast_addr(target)
}

#[tokio::test]
async fn corrupt_responder_does_not_end_the_run() {
    let responders = vec![
        UdpResponder::well_formed("127.0.0.7:9999", common::plug_sysinfo("8006DISC01", true)),
        UdpResponder::corrupted("127.0.0.8:9999"),
    ];
    let (target, _) = spawn_discovery_responders(responders).await;

    let found = local_discovery(target).discover().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].descriptor.device_id, "8006DISC01");
    assert_eq!(found[0].variant, ProtocolVariant::Legacy);
    assert_eq!(found[0].endpoint.host, "127.0.0.7".parse::<std::net::IpAddr>().unwrap());
    assert_eq!(found[0].endpoint.tcp_port, 9999);
}

#[tokio::test]
async fn corrupt_datagram_does_not_suppress_a_later_announcement() {
    // Same source: one garbled burst, then the real announcement, then a
    // duplicate that the per-source dedup must still drop.
    let responders = vec![
        UdpResponder::corrupted("127.0.0.10:9999"),
        UdpResponder::well_formed("127.0.0.10:9999", common::plug_sysinfo("8006DISC03", true)),
        UdpResponder::well_formed("127.0.0.10:9999", common::plug_sysinfo("8006DISC03", true)),
    ];
    let (target, _) = spawn_discovery_responders(responders).await;

    let found = local_discovery(target).discover().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].descriptor.device_id, "8006DISC03");
}

#[tokio::test]
async fn silent_network_yields_an_empty_set() {
    let (target, _) = spawn_discovery_responders(Vec::new()).await;
    let found = local_discovery(target).discover().await.unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn stream_yields_responders_as_they_answer() {
    use futures_util::StreamExt;

    let responders = vec![UdpResponder::well_formed(
        "127.0.0.9:9999",
        common::plug_sysinfo("8006DISC02", false),
    )];
    let (target, _) = spawn_discovery_responders(responders).await;

    let discovery = local_discovery(target);
    let stream = discovery.stream().await.unwrap();
    tokio::pin!(stream);
    // The first responder arrives well before the window closes.
    let first = stream.next().await.unwrap();
    assert_eq!(first.descriptor.device_id, "8006DISC02");
}
