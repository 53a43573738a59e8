//! The chat client: rendezvous login, peer session management, routing.
//!
//! Two sockets with distinct jobs: the rendezvous socket (ephemeral port)
//! carries login, list requests and server pushes; the peer socket (the
//! advertised port) carries every direct peer datagram, so a datagram's
//! source address is the sender's advertised endpoint.
//!
//! Construct with [`ChatClient::connect`], then drive with
//! [`ChatClient::run`] until a `Disconnect` command arrives.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{interval, timeout};

use crate::common::commands::ClientCommand;
use crate::common::envelope::{self, Envelope, LoginPayload, MessageKind, Payload};
use crate::common::events::ClientEvent;
use crate::common::types::{PresenceKind, UserEntry};
use crate::network::MAX_DATAGRAM;
use crate::network::peers::{Lifecycle, PeerTable, PublishDecision};

const PEER_PORT_FIRST: u16 = 9000;
const PEER_PORT_LAST: u16 = 9999;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("no free peer port in {PEER_PORT_FIRST}..={PEER_PORT_LAST}")]
    NoPeerPort,
    #[error("server refused the login")]
    LoginRejected,
    #[error("no login reply within {0:?}")]
    ConnectTimeout(Duration),
    #[error("unknown peer {0:?}")]
    PeerUnknown(String),
    #[error("client is not running")]
    NotRunning,
}

/// Client tunables. Defaults match the protocol; tests shrink them.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub server_addr: SocketAddr,
    /// Fixed peer port; `None` scans the default range, `Some(0)` lets the
    /// OS pick (the advertised port is read back from the socket).
    pub peer_port: Option<u16>,
    /// How often the maintenance loop pings every known peer.
    pub ping_interval: Duration,
    /// Peers silent for longer than this are evicted.
    pub peer_timeout: Duration,
    /// Minimum spacing between two list-changed notifications.
    pub publish_debounce: Duration,
    /// How long to wait for the login reply.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(username: impl Into<String>, server_addr: SocketAddr) -> Self {
        Self {
            username: username.into(),
            server_addr,
            peer_port: None,
            ping_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(15),
            publish_debounce: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

struct Shared {
    username: String,
    server_addr: SocketAddr,
    /// Rendezvous leg: login, list requests, server pushes.
    server_socket: UdpSocket,
    /// Peer leg: all direct traffic, in and out.
    peer_socket: UdpSocket,
    table: Mutex<PeerTable>,
    events: mpsc::Sender<ClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    config: ClientConfig,
}

impl Shared {
    async fn emit(&self, event: ClientEvent) {
        if self.events.send(event).await.is_err() {
            log::debug!("event receiver dropped");
        }
    }

    async fn send_server(&self, env: &Envelope) -> Result<(), ClientError> {
        let bytes = env.encode()?;
        self.server_socket.send_to(&bytes, self.server_addr).await?;
        Ok(())
    }

    async fn send_peer(&self, dest: SocketAddr, env: &Envelope) -> Result<(), ClientError> {
        let bytes = env.encode()?;
        self.peer_socket.send_to(&bytes, dest).await?;
        Ok(())
    }

    async fn send_presence(
        &self,
        verb: PresenceKind,
        to: &str,
        endpoint: SocketAddr,
    ) -> Result<(), ClientError> {
        let env = Envelope::presence(verb, &self.username, to);
        self.send_peer(endpoint, &env).await
    }
}

/// Rendezvous-backed peer-to-peer chat client.
pub struct ChatClient {
    shared: Arc<Shared>,
    commands: mpsc::Receiver<ClientCommand>,
}

impl ChatClient {
    /// Bind both sockets, log in and wait for the server's verdict. Only a
    /// successfully connected client gets constructed.
    pub async fn connect(
        config: ClientConfig,
        events: mpsc::Sender<ClientEvent>,
        commands: mpsc::Receiver<ClientCommand>,
    ) -> Result<Self, ClientError> {
        let server_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let peer_socket = bind_peer_socket(config.peer_port).await?;
        let peer_port = peer_socket.local_addr()?.port();

        let login = Envelope {
            payload: Payload::Login(LoginPayload { p2p_port: peer_port }),
            ..Envelope::new(MessageKind::Login, &config.username)
        };
        server_socket
            .send_to(&login.encode()?, config.server_addr)
            .await?;

        let reply = timeout(config.connect_timeout, async {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, _) = server_socket.recv_from(&mut buf).await?;
                match Envelope::decode(&buf[..len]) {
                    Ok(env) if env.kind == MessageKind::Login => break Ok(env),
                    Ok(env) => log::debug!("ignoring {:?} before the login reply", env.kind),
                    Err(err) => log::debug!("dropping undecodable datagram: {err}"),
                }
            }
        })
        .await
        .map_err(|_| ClientError::ConnectTimeout(config.connect_timeout))?
        .map_err(ClientError::Io)?;

        if reply.content != envelope::LOGIN_ACCEPTED {
            return Err(ClientError::LoginRejected);
        }
        log::info!(
            "logged in to {} as {}, peer port {peer_port}",
            config.server_addr,
            config.username
        );

        let (shutdown_tx, _) = watch::channel(false);
        let table = PeerTable::new(config.publish_debounce, config.peer_timeout);
        Ok(Self {
            shared: Arc::new(Shared {
                username: config.username.clone(),
                server_addr: config.server_addr,
                server_socket,
                peer_socket,
                table: Mutex::new(table),
                events,
                shutdown_tx,
                config,
            }),
            commands,
        })
    }

    pub fn username(&self) -> &str {
        &self.shared.username
    }

    /// The bound peer endpoint (useful when the port was OS-assigned).
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.shared.peer_socket.local_addr()
    }

    /// Drive the client until `Disconnect` arrives or the command channel
    /// closes, then leave all peers, log out and join every loop.
    pub async fn run(mut self) -> Result<(), ClientError> {
        {
            let mut table = self.shared.table.lock().await;
            table.lifecycle = Lifecycle::Running;
        }
        let server_loop = tokio::spawn(server_recv_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));
        let peer_loop = tokio::spawn(peer_recv_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));
        let maintenance = tokio::spawn(maintenance_loop(
            Arc::clone(&self.shared),
            self.shared.shutdown_tx.subscribe(),
        ));

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(ClientCommand::SendChat { to, text }) => {
                        if let Err(err) = send_chat(&self.shared, &to, &text).await {
                            log::warn!("chat to {to} failed: {err}");
                        }
                    }
                    Some(ClientCommand::RequestUserList) => {
                        if let Err(err) = request_user_list(&self.shared).await {
                            log::warn!("user list request failed: {err}");
                        }
                    }
                    Some(ClientCommand::Disconnect) | None => break,
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        disconnect(&self.shared).await;
        let _ = tokio::join!(server_loop, peer_loop, maintenance);
        {
            let mut table = self.shared.table.lock().await;
            table.lifecycle = Lifecycle::Stopped;
        }
        log::info!("client {} stopped", self.shared.username);
        Ok(())
    }
}

/// Route and deliver one chat message, lazily establishing the session.
async fn send_chat(shared: &Arc<Shared>, to: &str, text: &str) -> Result<(), ClientError> {
    let now = Instant::now();
    let (route, decision) = {
        let mut table = shared.table.lock().await;
        if table.lifecycle != Lifecycle::Running {
            return Err(ClientError::NotRunning);
        }
        let route = table.route_chat(to, now);
        let decision = match &route {
            Some(route) if route.discovered => Some(table.publish_decision(now)),
            _ => None,
        };
        (route, decision)
    };

    let Some(route) = route else {
        // Legacy fallback: ask the server so a later retry can resolve.
        log::debug!("no endpoint for {to}, asking the server");
        let lookup = Envelope {
            receiver: to.to_string(),
            ..Envelope::new(MessageKind::P2PRequest, &shared.username)
        };
        if let Err(err) = shared.send_server(&lookup).await {
            log::debug!("lookup for {to} failed: {err}");
        }
        return Err(ClientError::PeerUnknown(to.to_string()));
    };
    if let Some(decision) = decision {
        apply_publish(shared, decision).await;
    }

    let delivery: Result<(), ClientError> = async {
        if route.needs_join {
            shared
                .send_presence(PresenceKind::Join, to, route.endpoint)
                .await?;
        }
        shared
            .send_peer(route.endpoint, &Envelope::chat(&shared.username, to, text))
            .await
    }
    .await;

    if let Err(err) = delivery {
        // Stale session: drop the record so the next send re-resolves from
        // scratch instead of retrying a known-bad endpoint.
        let decision = {
            let mut table = shared.table.lock().await;
            table.remove(to);
            table.publish_decision(Instant::now())
        };
        apply_publish(shared, decision).await;
        return Err(err);
    }
    Ok(())
}

async fn request_user_list(shared: &Shared) -> Result<(), ClientError> {
    shared
        .send_server(&Envelope::new(MessageKind::UserList, &shared.username))
        .await
}

/// Leave every peer, log out, then signal all loops to stop.
async fn disconnect(shared: &Shared) {
    let peers = {
        let mut table = shared.table.lock().await;
        table.lifecycle = Lifecycle::Stopping;
        table.drain_records()
    };
    log::info!("disconnecting, notifying {} peers", peers.len());
    let leaves = peers.iter().map(|(name, endpoint)| async move {
        if let Err(err) = shared
            .send_presence(PresenceKind::Leave, name, *endpoint)
            .await
        {
            log::debug!("leave to {name} failed: {err}");
        }
    });
    join_all(leaves).await;

    let logout = Envelope::new(MessageKind::Logout, &shared.username);
    if let Err(err) = shared.send_server(&logout).await {
        log::debug!("logout send failed: {err}");
    }
    let _ = shared.shutdown_tx.send(true);
}

async fn server_recv_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            recv = shared.server_socket.recv_from(&mut buf) => match recv {
                Ok((len, src)) => match Envelope::decode(&buf[..len]) {
                    Ok(env) => handle_server_envelope(&shared, env).await,
                    Err(err) => log::debug!("dropping undecodable datagram from {src}: {err}"),
                },
                Err(err) => log::warn!("rendezvous socket receive error: {err}"),
            },
        }
    }
}

async fn peer_recv_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            recv = shared.peer_socket.recv_from(&mut buf) => match recv {
                Ok((len, src)) => match Envelope::decode(&buf[..len]) {
                    Ok(env) => handle_peer_envelope(&shared, env, src).await,
                    Err(err) => log::debug!("dropping undecodable datagram from {src}: {err}"),
                },
                Err(err) => log::warn!("peer socket receive error: {err}"),
            },
        }
    }
}

/// Ping every live peer and evict the silent, once per tick.
async fn maintenance_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(shared.config.ping_interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => maintenance_tick(&shared).await,
        }
    }
}

async fn maintenance_tick(shared: &Arc<Shared>) {
    let now = Instant::now();
    let (sweep, decision) = {
        let mut table = shared.table.lock().await;
        if table.lifecycle != Lifecycle::Running {
            return;
        }
        let sweep = table.sweep(now);
        let decision = if sweep.evicted.is_empty() {
            None
        } else {
            Some(table.publish_decision(now))
        };
        (sweep, decision)
    };

    for name in &sweep.evicted {
        log::info!("{name} timed out");
        shared.emit(ClientEvent::UserDisconnected(name.clone())).await;
    }
    let pings = sweep.ping.iter().map(|(name, endpoint)| async move {
        if let Err(err) = shared
            .send_presence(PresenceKind::Ping, name, *endpoint)
            .await
        {
            log::debug!("ping to {name} failed: {err}");
        }
    });
    join_all(pings).await;

    if let Some(decision) = decision {
        apply_publish(shared, decision).await;
    }
}

async fn handle_server_envelope(shared: &Arc<Shared>, env: Envelope) {
    match env.kind {
        MessageKind::UserList => {
            if let Payload::UserList(list) = env.payload {
                apply_user_list(shared, list.users).await;
            }
        }
        MessageKind::P2PResponse => {
            if let Payload::Lookup(hit) = env.payload {
                if hit.username == shared.username {
                    log::debug!("ignoring lookup reply naming ourselves");
                    return;
                }
                log::debug!("server resolved {} to {}", hit.username, hit.endpoint);
                let mut table = shared.table.lock().await;
                table.learn_advertised(&hit.username, hit.endpoint);
            } else {
                log::debug!("server lookup: {}", env.content);
            }
        }
        MessageKind::ServerShutdown => {
            log::info!("rendezvous server is shutting down; peer chat continues");
            shared.emit(ClientEvent::ServerShutdown).await;
        }
        MessageKind::Login => log::debug!("stray login reply"),
        other => log::debug!("ignoring {other:?} from the server"),
    }
}

/// A list push refreshes the advertised cache, discovers new peers and owes
/// each newly discovered peer a Join.
async fn apply_user_list(shared: &Arc<Shared>, users: Vec<UserEntry>) {
    let now = Instant::now();
    let (to_join, decision) = {
        let mut table = shared.table.lock().await;
        if table.lifecycle != Lifecycle::Running {
            return;
        }
        let to_join = table.observe_list(&shared.username, &users, now);
        let decision = table.publish_decision(now);
        (to_join, decision)
    };

    let joins = to_join.iter().map(|(name, endpoint)| async move {
        log::debug!("joining {name} at {endpoint}");
        if let Err(err) = shared
            .send_presence(PresenceKind::Join, name, *endpoint)
            .await
        {
            log::debug!("join to {name} failed: {err}");
        }
    });
    join_all(joins).await;

    apply_publish(shared, decision).await;
}

async fn handle_peer_envelope(shared: &Arc<Shared>, env: Envelope, src: SocketAddr) {
    if env.sender.is_empty() {
        log::debug!("dropping peer datagram with no sender from {src}");
        return;
    }
    let now = Instant::now();
    match env.kind {
        MessageKind::Chat => {
            let decision = {
                let mut table = shared.table.lock().await;
                if table.lifecycle != Lifecycle::Running {
                    return;
                }
                if table.touch(&env.sender, src, now) {
                    Some(table.publish_decision(now))
                } else {
                    None
                }
            };
            if let Some(decision) = decision {
                apply_publish(shared, decision).await;
            }
            shared
                .emit(ClientEvent::ChatReceived {
                    from: env.sender,
                    content: env.content,
                })
                .await;
        }
        MessageKind::Presence => match PresenceKind::parse(&env.content) {
            Some(verb) => handle_presence(shared, verb, env.sender, src, now).await,
            None => {
                log::debug!("unknown presence verb {:?} from {}", env.content, env.sender);
                // Still traffic from that peer, still refreshes liveness.
                let mut table = shared.table.lock().await;
                if table.lifecycle == Lifecycle::Running {
                    table.touch(&env.sender, src, now);
                }
            }
        },
        other => log::debug!("ignoring {other:?} datagram from {src}"),
    }
}

async fn handle_presence(
    shared: &Arc<Shared>,
    verb: PresenceKind,
    sender: String,
    src: SocketAddr,
    now: Instant,
) {
    match verb {
        PresenceKind::Join | PresenceKind::Ping | PresenceKind::Ack => {
            let decision = {
                let mut table = shared.table.lock().await;
                if table.lifecycle != Lifecycle::Running {
                    return;
                }
                if table.touch(&sender, src, now) {
                    log::debug!("discovered {sender} at {src}");
                    Some(table.publish_decision(now))
                } else {
                    None
                }
            };
            if let Some(decision) = decision {
                apply_publish(shared, decision).await;
            }
            // Ack answers Join only; ping traffic itself keeps both sides
            // fresh without an ack storm.
            if verb == PresenceKind::Join {
                if let Err(err) = shared.send_presence(PresenceKind::Ack, &sender, src).await {
                    log::debug!("ack to {sender} failed: {err}");
                }
            }
        }
        PresenceKind::Leave => {
            let (removed, decision) = {
                let mut table = shared.table.lock().await;
                if table.lifecycle != Lifecycle::Running {
                    return;
                }
                let removed = table.remove(&sender).is_some();
                let decision = removed.then(|| table.publish_decision(now));
                (removed, decision)
            };
            if removed {
                log::info!("{sender} left");
                shared.emit(ClientEvent::UserDisconnected(sender)).await;
            }
            if let Some(decision) = decision {
                apply_publish(shared, decision).await;
            }
        }
    }
}

async fn apply_publish(shared: &Arc<Shared>, decision: PublishDecision) {
    match decision {
        PublishDecision::Publish(names) => {
            shared.emit(ClientEvent::UserListUpdated(names)).await;
        }
        PublishDecision::Defer(delay) => schedule_deferred_publish(shared, delay),
        PublishDecision::Skip => {}
    }
}

/// One task per debounce window. At window close it publishes the set as it
/// is then, or nothing if the churn cancelled out.
fn schedule_deferred_publish(shared: &Arc<Shared>, delay: Duration) {
    let shared = Arc::clone(shared);
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
        let published = {
            let mut table = shared.table.lock().await;
            if table.lifecycle != Lifecycle::Running {
                return;
            }
            table.resolve_deferred(Instant::now())
        };
        if let Some(names) = published {
            shared.emit(ClientEvent::UserListUpdated(names)).await;
        }
    });
}

/// Bind the peer socket: a fixed port, or the first free port of the
/// default range.
async fn bind_peer_socket(peer_port: Option<u16>) -> Result<UdpSocket, ClientError> {
    match peer_port {
        Some(port) => Ok(UdpSocket::bind(("0.0.0.0", port)).await?),
        None => {
            for port in PEER_PORT_FIRST..=PEER_PORT_LAST {
                match UdpSocket::bind(("0.0.0.0", port)).await {
                    Ok(socket) => return Ok(socket),
                    Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
                    Err(err) => return Err(err.into()),
                }
            }
            Err(ClientError::NoPeerPort)
        }
    }
}
