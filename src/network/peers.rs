//! Client-side peer table: who is reachable, how, and how fresh.
//!
//! The table is one mutual-exclusion domain. The send path, the receive path
//! and the maintenance loop all mutate it through short critical sections;
//! methods here take `now` and return plain data so callers can do their
//! socket work after unlocking.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::types::UserEntry;

/// Client lifecycle. Lives inside the peer-table critical section so state
/// transitions are atomic with the table mutations they gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
            Lifecycle::Stopped => "stopped",
        };
        write!(f, "{name}")
    }
}

/// One known remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub endpoint: SocketAddr,
    /// Refreshed by received traffic only; outbound pings must not keep a
    /// dead peer alive.
    pub last_seen_at: Instant,
    pub join_sent: bool,
}

/// Where a chat datagram should go, resolved inside one critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatRoute {
    pub endpoint: SocketAddr,
    /// A Join must precede the chat datagram.
    pub needs_join: bool,
    /// The record was created from the advertised cache just now.
    pub discovered: bool,
}

/// Result of one maintenance pass.
#[derive(Debug, Default)]
pub struct Sweep {
    pub evicted: Vec<String>,
    pub ping: Vec<(String, SocketAddr)>,
}

/// Whether the "peer set changed" notification fires now, later, or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    /// Emit this set now.
    Publish(Vec<String>),
    /// A change landed inside the debounce window; check again after this.
    Defer(Duration),
    Skip,
}

pub struct PeerTable {
    records: HashMap<String, PeerRecord>,
    /// Endpoints from the last server push, the send-path fallback. Survives
    /// record eviction until the next push replaces it.
    advertised: HashMap<String, SocketAddr>,
    last_published: Vec<String>,
    published_at: Option<Instant>,
    /// A deferred publish check is already scheduled.
    publish_pending: bool,
    pub lifecycle: Lifecycle,
    debounce: Duration,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(debounce: Duration, timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            advertised: HashMap::new(),
            last_published: Vec::new(),
            published_at: None,
            publish_pending: false,
            lifecycle: Lifecycle::Idle,
            debounce,
            timeout,
        }
    }

    /// Apply a server list push: replace the advertised cache, refresh known
    /// endpoints and discover new peers. Returns the peers owed a Join.
    /// Pushes never remove records; only Leave, timeout or disconnect do.
    pub fn observe_list(
        &mut self,
        own_name: &str,
        users: &[UserEntry],
        now: Instant,
    ) -> Vec<(String, SocketAddr)> {
        self.advertised = users
            .iter()
            .filter(|user| user.username != own_name)
            .map(|user| (user.username.clone(), user.endpoint))
            .collect();

        let mut to_join = Vec::new();
        for user in users {
            if user.username == own_name {
                continue;
            }
            match self.records.get_mut(&user.username) {
                Some(record) => record.endpoint = user.endpoint,
                None => {
                    self.records.insert(
                        user.username.clone(),
                        PeerRecord {
                            endpoint: user.endpoint,
                            last_seen_at: now,
                            join_sent: true,
                        },
                    );
                    to_join.push((user.username.clone(), user.endpoint));
                }
            }
        }
        to_join
    }

    /// Record inbound traffic from a peer. Returns true when the peer was
    /// not previously known (discovery through the datagram itself).
    pub fn touch(&mut self, username: &str, endpoint: SocketAddr, now: Instant) -> bool {
        match self.records.get_mut(username) {
            Some(record) => {
                record.endpoint = endpoint;
                record.last_seen_at = now;
                false
            }
            None => {
                self.records.insert(
                    username.to_string(),
                    PeerRecord {
                        endpoint,
                        last_seen_at: now,
                        join_sent: false,
                    },
                );
                true
            }
        }
    }

    /// A single endpoint learned from a lookup reply.
    pub fn learn_advertised(&mut self, username: &str, endpoint: SocketAddr) {
        self.advertised.insert(username.to_string(), endpoint);
    }

    /// Resolve where to send a chat. Prefers a live record, falls back to
    /// the advertised cache (re-entry at discovery), and marks the Join as
    /// issued so it is sent at most once per record.
    pub fn route_chat(&mut self, username: &str, now: Instant) -> Option<ChatRoute> {
        if let Some(record) = self.records.get_mut(username) {
            let needs_join = !record.join_sent;
            record.join_sent = true;
            return Some(ChatRoute {
                endpoint: record.endpoint,
                needs_join,
                discovered: false,
            });
        }
        let endpoint = *self.advertised.get(username)?;
        self.records.insert(
            username.to_string(),
            PeerRecord {
                endpoint,
                last_seen_at: now,
                join_sent: true,
            },
        );
        Some(ChatRoute {
            endpoint,
            needs_join: true,
            discovered: true,
        })
    }

    pub fn remove(&mut self, username: &str) -> Option<PeerRecord> {
        self.records.remove(username)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.records.contains_key(username)
    }

    /// Take every record for the disconnect fan-out and clear the table.
    pub fn drain_records(&mut self) -> Vec<(String, SocketAddr)> {
        self.advertised.clear();
        self.records
            .drain()
            .map(|(name, record)| (name, record.endpoint))
            .collect()
    }

    /// One maintenance pass: evict peers silent for longer than the timeout,
    /// list the survivors to ping. Removal happens here, under the caller's
    /// lock, so an eviction is observed exactly once.
    pub fn sweep(&mut self, now: Instant) -> Sweep {
        let timeout = self.timeout;
        let mut sweep = Sweep::default();
        self.records.retain(|name, record| {
            if now.duration_since(record.last_seen_at) > timeout {
                sweep.evicted.push(name.clone());
                false
            } else {
                true
            }
        });
        sweep.ping = self
            .records
            .iter()
            .map(|(name, record)| (name.clone(), record.endpoint))
            .collect();
        sweep
    }

    /// Debounced publication check, to run in the same critical section as
    /// the mutation that may have changed the set.
    pub fn publish_decision(&mut self, now: Instant) -> PublishDecision {
        let current = self.current_set();
        if current == self.last_published {
            return PublishDecision::Skip;
        }
        match self.published_at {
            None => {
                self.commit(current.clone(), now);
                PublishDecision::Publish(current)
            }
            Some(at) => {
                let elapsed = now.duration_since(at);
                if elapsed >= self.debounce {
                    self.commit(current.clone(), now);
                    PublishDecision::Publish(current)
                } else if self.publish_pending {
                    PublishDecision::Skip
                } else {
                    self.publish_pending = true;
                    PublishDecision::Defer(self.debounce - elapsed)
                }
            }
        }
    }

    /// The deferred check at window close. Publishes the set as it is now,
    /// not as it was when the change was first seen.
    pub fn resolve_deferred(&mut self, now: Instant) -> Option<Vec<String>> {
        self.publish_pending = false;
        let current = self.current_set();
        if current == self.last_published {
            return None;
        }
        self.commit(current.clone(), now);
        Some(current)
    }

    fn current_set(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn commit(&mut self, names: Vec<String>, now: Instant) {
        self.last_published = names;
        self.published_at = Some(now);
    }
}
