//! ServerRegistry: the live list of servers heard on the LAN.
//!
//! The registry owns every [`ServerDescription`] and is the only place that
//! emits change notifications.  Entries themselves stay passive.
//!
//! # Entry lifecycle
//!
//! ```text
//! Announce (new key)   ──► insert          ──► RegistryEvent::Added
//! Announce (known key) ──► apply_announce  ──► RegistryEvent::Updated  (only if a field changed)
//! silence > staleness  ──► mark_inactive   ──► RegistryEvent::Inactive (exactly once)
//!                      ──► remove          ──► RegistryEvent::Removed
//! ```
//!
//! # Concurrency
//!
//! Datagrams are applied from the listener thread while a UI or CLI reads
//! the list from elsewhere.  All mutation goes through one mutex, and readers
//! get a cloned [`ServerRegistry::snapshot`] rather than a view into the map.
//! Events are sent on an unbounded `tokio::sync::mpsc` channel, which never
//! blocks the sender, so every event is emitted before the mutex is released
//! and the channel order matches the order of mutations.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use coedit_core::{Announce, DiscoveryError, ServerDescription, ServerKey};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A change to the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// First announce from this key.
    Added(ServerDescription),
    /// A later announce changed at least one field.
    Updated(ServerDescription),
    /// The server fell silent for longer than the staleness window.
    Inactive(ServerKey),
    /// The entry was discarded.
    Removed(ServerKey),
}

/// Registry of discovered servers.
#[derive(Debug)]
pub struct ServerRegistry {
    entries: Mutex<HashMap<ServerKey, ServerDescription>>,
    staleness: Duration,
    events: mpsc::UnboundedSender<RegistryEvent>,
}

impl ServerRegistry {
    /// Creates an empty registry and the receiver for its events.
    pub fn new(staleness: Duration) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            entries: Mutex::new(HashMap::new()),
            staleness,
            events: tx,
        };
        (registry, rx)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServerKey, ServerDescription>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RegistryEvent) {
        // A dropped receiver means nobody is listening any more.
        let _ = self.events.send(event);
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Applies an announce received from `endpoint` now.
    pub fn observe(&self, announce: &Announce, endpoint: IpAddr) -> Result<(), DiscoveryError> {
        self.observe_at(announce, endpoint, Instant::now())
    }

    /// Applies an announce received from `endpoint` at `now`.
    ///
    /// # Errors
    ///
    /// Propagates [`DiscoveryError`] from [`ServerDescription::apply_announce`].
    pub fn observe_at(
        &self,
        announce: &Announce,
        endpoint: IpAddr,
        now: Instant,
    ) -> Result<(), DiscoveryError> {
        let key = ServerDescription::key_for(announce, endpoint);
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(existing) => {
                if existing.apply_announce(announce, endpoint, now)? {
                    debug!("server {key} updated");
                    self.emit(RegistryEvent::Updated(existing.clone()));
                }
            }
            None => {
                let description = ServerDescription::from_announce(announce, endpoint, now);
                info!("discovered server '{}' at {key}", description.name());
                entries.insert(key, description.clone());
                self.emit(RegistryEvent::Added(description));
            }
        }
        Ok(())
    }

    /// Sweeps entries silent for longer than the staleness window now.
    pub fn expire_stale(&self) -> Vec<ServerKey> {
        self.expire_stale_at(Instant::now())
    }

    /// Marks every entry silent at `now` for longer than the staleness window
    /// inactive, then removes it.  Returns the expired keys.
    pub fn expire_stale_at(&self, now: Instant) -> Vec<ServerKey> {
        let mut expired = Vec::new();
        let mut entries = self.lock();
        entries.retain(|key, description| {
            if !description.is_stale(now, self.staleness) {
                return true;
            }
            if description.mark_inactive() {
                expired.push(*key);
            }
            false
        });
        for key in &expired {
            info!("server {key} went silent");
            self.emit(RegistryEvent::Inactive(*key));
            self.emit(RegistryEvent::Removed(*key));
        }
        drop(entries);
        expired
    }

    /// Discards an entry regardless of its state.
    pub fn remove(&self, key: &ServerKey) -> Option<ServerDescription> {
        let mut entries = self.lock();
        let removed = entries.remove(key);
        if removed.is_some() {
            self.emit(RegistryEvent::Removed(*key));
        }
        removed
    }

    /// Records a round-trip measurement.  Returns `false` for unknown keys.
    pub fn record_ping(&self, key: &ServerKey, ping: Duration) -> bool {
        match self.lock().get_mut(key) {
            Some(description) => {
                description.set_ping(ping);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, key: &ServerKey) -> Option<ServerDescription> {
        self.lock().get(key).cloned()
    }

    /// A consistent copy of every live entry, sorted by name.
    pub fn snapshot(&self) -> Vec<ServerDescription> {
        let mut list: Vec<ServerDescription> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()).then(a.port().cmp(&b.port())));
        list
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn lan() -> IpAddr {
        "192.168.1.20".parse().unwrap()
    }

    fn announce(id: Uuid, client_count: u16) -> Announce {
        Announce::new(id, "Doc A", 55555, false, client_count, 8).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RegistryEvent>) -> Vec<RegistryEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_first_announce_adds_entry() {
        // Arrange
        let (registry, mut rx) = ServerRegistry::new(Duration::from_secs(5));
        let id = Uuid::new_v4();

        // Act
        registry.observe(&announce(id, 0), lan()).unwrap();

        // Assert
        assert_eq!(registry.len(), 1);
        let events = drain(&mut rx);
        assert!(matches!(&events[..], [RegistryEvent::Added(d)] if d.id() == id));
    }

    #[test]
    fn test_identical_announce_raises_no_event() {
        let (registry, mut rx) = ServerRegistry::new(Duration::from_secs(5));
        let id = Uuid::new_v4();
        registry.observe(&announce(id, 0), lan()).unwrap();
        drain(&mut rx);

        registry.observe(&announce(id, 0), lan()).unwrap();

        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_client_count_change_raises_one_update() {
        let (registry, mut rx) = ServerRegistry::new(Duration::from_secs(5));
        let id = Uuid::new_v4();
        registry.observe(&announce(id, 0), lan()).unwrap();
        drain(&mut rx);

        registry.observe(&announce(id, 1), lan()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RegistryEvent::Updated(d) if d.client_count() == 1));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_id_from_other_endpoint_is_separate_server() {
        let (registry, _rx) = ServerRegistry::new(Duration::from_secs(5));
        let id = Uuid::new_v4();

        registry.observe(&announce(id, 0), lan()).unwrap();
        registry
            .observe(&announce(id, 0), "10.0.0.7".parse().unwrap())
            .unwrap();

        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_silent_server_goes_inactive_exactly_once() {
        // Arrange
        let staleness = Duration::from_secs(5);
        let (registry, mut rx) = ServerRegistry::new(staleness);
        let start = Instant::now();
        let a = announce(Uuid::new_v4(), 0);
        registry.observe_at(&a, lan(), start).unwrap();
        drain(&mut rx);

        // Act
        let early = registry.expire_stale_at(start + Duration::from_secs(4));
        let late = registry.expire_stale_at(start + Duration::from_secs(6));
        let again = registry.expire_stale_at(start + Duration::from_secs(7));

        // Assert
        assert!(early.is_empty());
        assert_eq!(late.len(), 1);
        assert!(again.is_empty());
        let key = ServerDescription::key_for(&a, lan());
        assert_eq!(
            drain(&mut rx),
            vec![RegistryEvent::Inactive(key), RegistryEvent::Removed(key)]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_reannounce_after_expiry_is_added_again() {
        // Arrange
        let staleness = Duration::from_secs(5);
        let (registry, mut rx) = ServerRegistry::new(staleness);
        let start = Instant::now();
        let a = announce(Uuid::new_v4(), 0);
        let key = ServerDescription::key_for(&a, lan());
        registry.observe_at(&a, lan(), start).unwrap();
        drain(&mut rx);

        // Act
        registry.expire_stale_at(start + Duration::from_secs(6));
        registry
            .observe_at(&a, lan(), start + Duration::from_secs(6))
            .unwrap();

        // Assert
        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], RegistryEvent::Inactive(key));
        assert_eq!(events[1], RegistryEvent::Removed(key));
        assert!(matches!(&events[2], RegistryEvent::Added(d) if d.key() == key));
    }

    /// Announces racing a sweep must still produce a well-formed lifecycle
    /// for the key: Added first, Updated only while present, and Removed
    /// only straight after Inactive.
    #[test]
    fn test_concurrent_announces_and_sweeps_keep_event_order() {
        // Arrange
        let staleness = Duration::from_secs(5);
        let (registry, mut rx) = ServerRegistry::new(staleness);
        let registry = std::sync::Arc::new(registry);
        let start = Instant::now();
        let id = Uuid::new_v4();
        let key = ServerDescription::key_for(&announce(id, 0), lan());

        // Act
        let mut workers = Vec::new();
        for worker in 0..4u16 {
            let registry = std::sync::Arc::clone(&registry);
            workers.push(std::thread::spawn(move || {
                for round in 0..500u16 {
                    let count = (worker + round) % 3;
                    registry.observe_at(&announce(id, count), lan(), start).unwrap();
                }
            }));
        }
        let sweeper = {
            let registry = std::sync::Arc::clone(&registry);
            std::thread::spawn(move || {
                for _ in 0..500 {
                    registry.expire_stale_at(start + Duration::from_secs(6));
                }
            })
        };
        for worker in workers {
            worker.join().unwrap();
        }
        sweeper.join().unwrap();

        // Assert
        let mut present = false;
        let mut inactive = false;
        for event in drain(&mut rx) {
            match event {
                RegistryEvent::Added(d) => {
                    assert_eq!(d.key(), key);
                    assert!(!present, "Added while already present");
                    present = true;
                }
                RegistryEvent::Updated(_) => assert!(present, "Updated before Added"),
                RegistryEvent::Inactive(k) => {
                    assert_eq!(k, key);
                    assert!(present && !inactive, "Inactive out of order");
                    inactive = true;
                }
                RegistryEvent::Removed(k) => {
                    assert_eq!(k, key);
                    assert!(inactive, "Removed without Inactive");
                    present = false;
                    inactive = false;
                }
            }
        }
        assert_eq!(present, registry.get(&key).is_some());
    }

    #[test]
    fn test_announce_resets_staleness_timer() {
        let staleness = Duration::from_secs(5);
        let (registry, _rx) = ServerRegistry::new(staleness);
        let start = Instant::now();
        let a = announce(Uuid::new_v4(), 0);
        registry.observe_at(&a, lan(), start).unwrap();

        registry
            .observe_at(&a, lan(), start + Duration::from_secs(4))
            .unwrap();

        assert!(registry
            .expire_stale_at(start + Duration::from_secs(8))
            .is_empty());
    }

    #[test]
    fn test_record_ping_and_snapshot() {
        let (registry, _rx) = ServerRegistry::new(Duration::from_secs(5));
        let a = announce(Uuid::new_v4(), 0);
        registry.observe(&a, lan()).unwrap();
        let key = ServerDescription::key_for(&a, lan());

        assert!(registry.record_ping(&key, Duration::from_millis(3)));
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].ping(), Some(Duration::from_millis(3)));
    }

    #[test]
    fn test_remove_emits_removed() {
        let (registry, mut rx) = ServerRegistry::new(Duration::from_secs(5));
        let a = announce(Uuid::new_v4(), 0);
        registry.observe(&a, lan()).unwrap();
        drain(&mut rx);
        let key = ServerDescription::key_for(&a, lan());

        assert!(registry.remove(&key).is_some());
        assert!(registry.remove(&key).is_none());
        assert_eq!(drain(&mut rx), vec![RegistryEvent::Removed(key)]);
    }
}
