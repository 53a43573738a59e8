//! Rendezvous server: the authoritative registry of online users.
//!
//! Serves login, logout, list and lookup over UDP datagrams. After login all
//! chat flows peer-to-peer; the server only pushes registry changes.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;

use crate::common::envelope::{
    self, Envelope, LookupPayload, MessageKind, Payload, UserListPayload, now_ts,
};
use crate::common::types::UserEntry;
use crate::network::MAX_DATAGRAM;

pub const DEFAULT_PORT: u16 = 8080;

/// Server tunables. Defaults match the protocol; tests shrink them.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Pause between the login reply and the private list push, giving the
    /// fresh client time to arm its receive loop.
    pub login_settle: Duration,
    /// Pause between the private push and the broadcast to everyone else,
    /// preserving "the new client hears first" ordering.
    pub broadcast_settle: Duration,
    /// Best-effort window for the shutdown notice fan-out.
    pub shutdown_notify_wait: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            login_settle: Duration::from_millis(100),
            broadcast_settle: Duration::from_millis(50),
            shutdown_notify_wait: Duration::from_secs(3),
        }
    }
}

/// Server-side view of one logged-in user.
#[derive(Debug, Clone)]
pub struct RegisteredUser {
    pub username: String,
    /// Source address of the login datagram; server pushes go here.
    pub rendezvous_addr: SocketAddr,
    /// Address the user advertises for direct peer traffic.
    pub p2p_endpoint: SocketAddr,
    pub online: bool,
    /// Unix seconds of the last datagram seen from this user.
    pub last_seen: i64,
}

/// The online-user registry. Every check-then-mutate runs as one critical
/// section behind the mutex; nothing is removed except by explicit logout.
#[derive(Default)]
pub struct Registry {
    users: Mutex<HashMap<String, RegisteredUser>>,
}

impl Registry {
    /// Insert the user unless the name is empty or already taken.
    pub async fn login(
        &self,
        username: &str,
        rendezvous_addr: SocketAddr,
        p2p_endpoint: SocketAddr,
    ) -> bool {
        if username.is_empty() {
            return false;
        }
        let mut users = self.users.lock().await;
        if users.contains_key(username) {
            return false;
        }
        users.insert(
            username.to_string(),
            RegisteredUser {
                username: username.to_string(),
                rendezvous_addr,
                p2p_endpoint,
                online: true,
                last_seen: now_ts(),
            },
        );
        true
    }

    /// Remove the user. Idempotent; returns whether anything was removed.
    pub async fn logout(&self, username: &str) -> bool {
        self.users.lock().await.remove(username).is_some()
    }

    /// Refresh `last_seen` for a registered sender.
    pub async fn touch(&self, username: &str) {
        if let Some(user) = self.users.lock().await.get_mut(username) {
            user.last_seen = now_ts();
        }
    }

    pub async fn lookup(&self, username: &str) -> Option<UserEntry> {
        self.users
            .lock()
            .await
            .get(username)
            .filter(|user| user.online)
            .map(|user| UserEntry {
                username: user.username.clone(),
                endpoint: user.p2p_endpoint,
            })
    }

    /// The current online set, sorted by username.
    pub async fn snapshot(&self) -> Vec<UserEntry> {
        let users = self.users.lock().await;
        let mut entries: Vec<UserEntry> = users
            .values()
            .filter(|user| user.online)
            .map(|user| UserEntry {
                username: user.username.clone(),
                endpoint: user.p2p_endpoint,
            })
            .collect();
        entries.sort_by(|a, b| a.username.cmp(&b.username));
        entries
    }

    /// Rendezvous addresses to push server-originated envelopes to.
    pub async fn push_targets(&self, except: Option<&str>) -> Vec<SocketAddr> {
        self.users
            .lock()
            .await
            .values()
            .filter(|user| Some(user.username.as_str()) != except)
            .map(|user| user.rendezvous_addr)
            .collect()
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.users.lock().await.contains_key(username)
    }

    pub async fn len(&self) -> usize {
        self.users.lock().await.len()
    }
}

/// UDP rendezvous server. Cheap to clone; clones share the socket, the
/// registry and the shutdown signal.
#[derive(Clone)]
pub struct RendezvousServer {
    socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    config: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RendezvousServer {
    pub async fn bind(config: ServerConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.port)).await?;
        log::info!("rendezvous server listening on {}", socket.local_addr()?);
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            socket: Arc::new(socket),
            registry: Arc::new(Registry::default()),
            config,
            shutdown_tx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Ask the run loop to stop and broadcast the shutdown notice.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve datagrams until [`shutdown`](Self::shutdown), then notify every
    /// registered client within the bounded wait and return. The socket
    /// closes when the last handle drops.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut handlers: JoinSet<()> = JoinSet::new();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, src)) => match Envelope::decode(&buf[..len]) {
                        Ok(env) => {
                            let server = self.clone();
                            handlers.spawn(async move {
                                server.handle_datagram(env, src).await;
                            });
                        }
                        Err(err) => {
                            log::debug!("dropping undecodable datagram from {src}: {err}");
                        }
                    },
                    Err(err) => log::warn!("receive error: {err}"),
                },
            }
        }
        // Let in-flight handlers finish (bounded); leftovers are aborted
        // when the JoinSet drops.
        let drain = async {
            while handlers.join_next().await.is_some() {}
        };
        let _ = tokio::time::timeout(self.config.shutdown_notify_wait, drain).await;
        self.notify_shutdown().await;
        log::info!("rendezvous server stopped");
    }

    async fn handle_datagram(&self, env: Envelope, src: SocketAddr) {
        self.registry.touch(&env.sender).await;
        match env.kind {
            MessageKind::Login => self.handle_login(env, src).await,
            MessageKind::Logout => self.handle_logout(env).await,
            MessageKind::UserList => self.send_user_list(src, "user list").await,
            MessageKind::P2PRequest => self.handle_lookup(env, src).await,
            other => log::debug!("ignoring {other:?} datagram from {src}"),
        }
    }

    async fn handle_login(&self, env: Envelope, src: SocketAddr) {
        let username = env.sender;
        let p2p_port = match env.payload {
            Payload::Login(payload) => payload.p2p_port,
            _ => 0,
        };
        let p2p_endpoint = SocketAddr::new(src.ip(), p2p_port);

        if !self.registry.login(&username, src, p2p_endpoint).await {
            log::warn!("refused login for {username:?} from {src}");
            let reply = Envelope {
                content: envelope::LOGIN_REJECTED.to_string(),
                ..Envelope::new(MessageKind::Login, "")
            };
            self.send_to(src, &reply).await;
            return;
        }
        log::info!("{username} logged in, peer endpoint {p2p_endpoint}");
        let reply = Envelope {
            content: envelope::LOGIN_ACCEPTED.to_string(),
            ..Envelope::new(MessageKind::Login, "")
        };
        self.send_to(src, &reply).await;

        // The new client hears its own list before the others hear about it.
        tokio::time::sleep(self.config.login_settle).await;
        self.send_user_list(src, "user list").await;
        tokio::time::sleep(self.config.broadcast_settle).await;
        self.broadcast_user_list(Some(&username)).await;
    }

    async fn handle_logout(&self, env: Envelope) {
        let username = env.sender;
        if self.registry.logout(&username).await {
            log::info!("{username} logged out");
            self.broadcast_user_list(None).await;
        }
    }

    async fn handle_lookup(&self, env: Envelope, src: SocketAddr) {
        let target = env.receiver;
        let reply = match self.registry.lookup(&target).await {
            Some(entry) => Envelope {
                content: envelope::LOOKUP_FOUND.to_string(),
                payload: Payload::Lookup(LookupPayload {
                    username: entry.username,
                    endpoint: entry.endpoint,
                }),
                ..Envelope::new(MessageKind::P2PResponse, "")
            },
            None => {
                log::debug!("lookup miss for {target:?}");
                Envelope {
                    content: envelope::LOOKUP_NOT_FOUND.to_string(),
                    ..Envelope::new(MessageKind::P2PResponse, "")
                }
            }
        };
        self.send_to(src, &reply).await;
    }

    async fn send_user_list(&self, dest: SocketAddr, content: &str) {
        let users = self.registry.snapshot().await;
        let env = Envelope {
            content: content.to_string(),
            payload: Payload::UserList(UserListPayload { users }),
            ..Envelope::new(MessageKind::UserList, "")
        };
        self.send_to(dest, &env).await;
    }

    /// Push the current list to every user except `except`. One recipient's
    /// failure never delays or fails the others.
    async fn broadcast_user_list(&self, except: Option<&str>) {
        let users = self.registry.snapshot().await;
        let targets = self.registry.push_targets(except).await;
        let env = Envelope {
            content: "user list updated".to_string(),
            payload: Payload::UserList(UserListPayload { users }),
            ..Envelope::new(MessageKind::UserList, "")
        };
        self.fan_out(&env, &targets).await;
    }

    async fn notify_shutdown(&self) {
        let targets = self.registry.push_targets(None).await;
        log::info!("notifying {} clients of shutdown", targets.len());
        let env = Envelope {
            content: "server is shutting down".to_string(),
            ..Envelope::new(MessageKind::ServerShutdown, "")
        };
        let notify = self.fan_out(&env, &targets);
        if tokio::time::timeout(self.config.shutdown_notify_wait, notify)
            .await
            .is_err()
        {
            log::warn!("shutdown notice timed out");
        }
    }

    async fn fan_out(&self, env: &Envelope, targets: &[SocketAddr]) {
        let bytes = match env.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("could not encode {:?} envelope: {err}", env.kind);
                return;
            }
        };
        let sends = targets.iter().map(|dest| {
            let bytes = &bytes;
            async move {
                if let Err(err) = self.socket.send_to(bytes, *dest).await {
                    log::debug!("push to {dest} failed: {err}");
                }
            }
        });
        join_all(sends).await;
    }

    async fn send_to(&self, dest: SocketAddr, env: &Envelope) {
        match env.encode() {
            Ok(bytes) => {
                if let Err(err) = self.socket.send_to(&bytes, dest).await {
                    log::debug!("send to {dest} failed: {err}");
                }
            }
            Err(err) => log::warn!("could not encode {:?} envelope: {err}", env.kind),
        }
    }
}
