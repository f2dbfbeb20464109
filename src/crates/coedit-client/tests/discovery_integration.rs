//! Integration tests for LAN discovery.
//!
//! A `DiscoveryListener` is bound to an ephemeral loopback port.  Announces
//! are either hand-encoded and sent from a plain `UdpSocket`, or produced by
//! the real server announcer pointed at the listener.  The tests consume the
//! registry's event channel the way a UI would.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coedit_client::application::server_browser::{RegistryEvent, ServerRegistry};
use coedit_client::infrastructure::network::discovery::{listen_on, DiscoveryListener};
use coedit_core::{Announce, ConnectionRequest};
use coedit_server::application::collaboration::{CollaborationHub, HubConfig};
use coedit_server::infrastructure::network::discovery::{start_announcer, AnnounceSettings};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use uuid::Uuid;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const EVENT_TIMEOUT: Duration = Duration::from_secs(3);

// ── Helpers ───────────────────────────────────────────────────────────────────

fn start_listener(
    staleness: Duration,
) -> (
    DiscoveryListener,
    Arc<ServerRegistry>,
    UnboundedReceiver<RegistryEvent>,
    Arc<AtomicBool>,
) {
    let (registry, events) = ServerRegistry::new(staleness);
    let registry = Arc::new(registry);
    let running = Arc::new(AtomicBool::new(true));
    let listener = listen_on(
        SocketAddr::from((LOCALHOST, 0)),
        Arc::clone(&registry),
        Arc::clone(&running),
    )
    .expect("bind discovery listener");
    (listener, registry, events, running)
}

fn stop(listener: DiscoveryListener, running: &AtomicBool) {
    running.store(false, Ordering::SeqCst);
    listener.thread.join().expect("listener thread");
}

async fn next_event(events: &mut UnboundedReceiver<RegistryEvent>) -> RegistryEvent {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

fn announce(id: Uuid, client_count: u16) -> Announce {
    Announce::new(id, "design review", 6000, false, client_count, 8).unwrap()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// A repeated announce is silent; a changed client count raises exactly one
/// update; silence raises Inactive once followed by Removed.
#[tokio::test]
async fn test_announce_lifecycle_events() {
    // Arrange
    let (listener, registry, mut events, running) = start_listener(Duration::from_millis(300));
    let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let id = Uuid::new_v4();

    // Act
    sender.send_to(&announce(id, 0).encode(), listener.local_addr).unwrap();
    sender.send_to(&announce(id, 0).encode(), listener.local_addr).unwrap();
    sender.send_to(&announce(id, 1).encode(), listener.local_addr).unwrap();

    // Assert
    let RegistryEvent::Added(added) = next_event(&mut events).await else {
        panic!("expected Added first");
    };
    assert_eq!(added.id(), id);
    assert_eq!(added.endpoint(), LOCALHOST);
    assert_eq!(added.client_count(), 0);

    let RegistryEvent::Updated(updated) = next_event(&mut events).await else {
        panic!("expected one Updated for the 0 -> 1 change");
    };
    assert_eq!(updated.client_count(), 1);

    let key = updated.key();
    assert_eq!(next_event(&mut events).await, RegistryEvent::Inactive(key));
    assert_eq!(next_event(&mut events).await, RegistryEvent::Removed(key));
    assert!(registry.is_empty());

    stop(listener, &running);
    assert!(events.try_recv().is_err(), "no further events after removal");
}

#[tokio::test]
async fn test_foreign_datagrams_are_ignored() {
    // Arrange
    let (listener, registry, mut events, running) = start_listener(Duration::from_secs(5));
    let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let id = Uuid::new_v4();

    // Act
    sender.send_to(b"M-SEARCH * HTTP/1.1", listener.local_addr).unwrap();
    sender.send_to(&[0u8; 600], listener.local_addr).unwrap();
    sender.send_to(&announce(id, 2).encode(), listener.local_addr).unwrap();

    // Assert
    let RegistryEvent::Added(added) = next_event(&mut events).await else {
        panic!("expected Added");
    };
    assert_eq!(added.id(), id);
    assert_eq!(registry.len(), 1);

    stop(listener, &running);
}

#[tokio::test]
async fn test_same_id_from_another_port_is_a_separate_server() {
    // Arrange
    let (listener, registry, mut events, running) = start_listener(Duration::from_secs(5));
    let sender = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let id = Uuid::new_v4();
    let other_port = Announce::new(id, "design review", 6001, false, 0, 8).unwrap();

    // Act
    sender.send_to(&announce(id, 0).encode(), listener.local_addr).unwrap();
    sender.send_to(&other_port.encode(), listener.local_addr).unwrap();

    // Assert
    assert!(matches!(next_event(&mut events).await, RegistryEvent::Added(_)));
    assert!(matches!(next_event(&mut events).await, RegistryEvent::Added(_)));
    let ports: Vec<u16> = registry.snapshot().iter().map(|s| s.port()).collect();
    assert_eq!(ports, vec![6000, 6001]);

    stop(listener, &running);
}

/// The server's announcer reaches the listener and reports the hub's
/// live client count.
#[tokio::test]
async fn test_server_announcer_feeds_registry() {
    // Arrange
    let (listener, _registry, mut events, running) = start_listener(Duration::from_secs(5));
    let hub = Arc::new(
        CollaborationHub::new(HubConfig {
            file_path: "notes.md".to_string(),
            password: Some("pw".to_string()),
            max_clients: 3,
        })
        .unwrap(),
    );
    let server_id = Uuid::new_v4();
    let settings = AnnounceSettings {
        server_id,
        name: "team notes".to_string(),
        port: 7000,
        target: listener.local_addr,
        interval: Duration::from_millis(50),
    };
    let announcer_running = Arc::new(AtomicBool::new(true));

    // Act
    let announcer =
        start_announcer(settings, Arc::clone(&hub), Arc::clone(&announcer_running)).unwrap();

    // Assert
    let RegistryEvent::Added(added) = next_event(&mut events).await else {
        panic!("expected Added");
    };
    assert_eq!(added.id(), server_id);
    assert_eq!(added.name(), "team notes");
    assert!(added.requires_password());
    assert_eq!((added.client_count(), added.max_clients()), (0, 3));

    let request = ConnectionRequest::new(Some("pw".to_string()), None).unwrap();
    let response = hub.evaluate_handshake(Uuid::new_v4(), &request).unwrap();
    assert!(response.is_approved());

    let RegistryEvent::Updated(updated) = next_event(&mut events).await else {
        panic!("expected Updated after a client joined");
    };
    assert_eq!(updated.client_count(), 1);

    announcer_running.store(false, Ordering::SeqCst);
    announcer.join().unwrap();
    stop(listener, &running);
}
