//! End-to-end tests running the rendezvous server and real clients in one
//! process over loopback UDP.
//!
//! Proves:
//! 1. Login hands each side the other's presence (private push, then
//!    broadcast), with the login reply strictly first.
//! 2. Duplicate logins are rejected without touching the registry.
//! 3. Chat datagrams flow peer to peer and keep flowing after the server
//!    shuts down.
//! 4. Leave notices and silence-based eviction each surface exactly one
//!    disconnect notification.
//!
//! All timings are shrunk; every await is bounded by [`WAIT`].

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use rendezchat::common::envelope::{
    self, Envelope, LoginPayload, LookupPayload, MessageKind, Payload,
};
use rendezchat::common::{ClientCommand, ClientEvent, PresenceKind};
use rendezchat::network::{ChatClient, ClientConfig, RendezvousServer, ServerConfig};

const WAIT: Duration = Duration::from_secs(5);

// ── Server / client harness ─────────────────────────────────

/// Bind a server on an ephemeral port with test timings.
async fn start_server() -> (RendezvousServer, JoinHandle<()>) {
    let server = RendezvousServer::bind(ServerConfig {
        port: 0,
        login_settle: Duration::from_millis(10),
        broadcast_settle: Duration::from_millis(5),
        shutdown_notify_wait: Duration::from_secs(1),
    })
    .await
    .expect("server bind failed");
    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    (server, runner)
}

/// The server's reachable loopback address.
fn server_target(server: &RendezvousServer) -> SocketAddr {
    let port = server.local_addr().expect("server addr").port();
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn quick_config(name: &str, server_addr: SocketAddr) -> ClientConfig {
    let mut config = ClientConfig::new(name, server_addr);
    // OS-assigned peer port keeps parallel tests off each other's ports.
    config.peer_port = Some(0);
    config.ping_interval = Duration::from_millis(100);
    config.peer_timeout = Duration::from_secs(10);
    config.publish_debounce = Duration::from_millis(50);
    config
}

struct TestClient {
    commands: mpsc::Sender<ClientCommand>,
    events: mpsc::Receiver<ClientEvent>,
    peer_addr: SocketAddr,
    runner: JoinHandle<Result<(), rendezchat::network::ClientError>>,
}

async fn connect_client(config: ClientConfig) -> TestClient {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (event_tx, event_rx) = mpsc::channel(64);
    let client = timeout(WAIT, ChatClient::connect(config, event_tx, cmd_rx))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    // The socket binds the wildcard address; reach it over loopback.
    let peer_port = client.peer_addr().expect("peer addr").port();
    let peer_addr = SocketAddr::from(([127, 0, 0, 1], peer_port));
    let runner = tokio::spawn(client.run());
    TestClient {
        commands: cmd_tx,
        events: event_rx,
        peer_addr,
        runner,
    }
}

async fn stop_client(client: TestClient) {
    let _ = client.commands.send(ClientCommand::Disconnect).await;
    timeout(WAIT, client.runner)
        .await
        .expect("client did not stop")
        .expect("client task panicked")
        .expect("client run failed");
}

async fn stop_server(server: RendezvousServer, runner: JoinHandle<()>) {
    server.shutdown();
    timeout(WAIT, runner)
        .await
        .expect("server did not stop")
        .expect("server task panicked");
}

// ── Event helpers ───────────────────────────────────────────

async fn next_event(client: &mut TestClient) -> ClientEvent {
    timeout(WAIT, client.events.recv())
        .await
        .expect("no event within the wait budget")
        .expect("event channel closed")
}

/// Wait for an event the picker accepts, skipping the rest.
async fn wait_for<T>(
    client: &mut TestClient,
    mut pick: impl FnMut(ClientEvent) -> Option<T>,
) -> T {
    loop {
        if let Some(found) = pick(next_event(client).await) {
            return found;
        }
    }
}

/// Wait until a list update naming exactly `expected` arrives. Intermediate
/// updates are legal under debouncing and are skipped.
async fn wait_for_list(client: &mut TestClient, expected: &[&str]) {
    let expected: Vec<String> = expected.iter().map(|name| name.to_string()).collect();
    wait_for(client, |event| match event {
        ClientEvent::UserListUpdated(users) if users == expected => Some(()),
        _ => None,
    })
    .await;
}

async fn wait_for_chat(client: &mut TestClient) -> (String, String) {
    wait_for(client, |event| match event {
        ClientEvent::ChatReceived { from, content } => Some((from, content)),
        _ => None,
    })
    .await
}

// ── Raw datagram actor ──────────────────────────────────────

/// Stands in for a remote client at the wire level: two sockets, no logic.
struct FakePeer {
    rendezvous: UdpSocket,
    peer: UdpSocket,
}

impl FakePeer {
    async fn bind() -> Self {
        Self {
            rendezvous: UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind"),
            peer: UdpSocket::bind(("127.0.0.1", 0)).await.expect("bind"),
        }
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer.local_addr().expect("peer addr")
    }

    /// Send a Login advertising the peer socket; return the server's reply.
    async fn login(&self, name: &str, server_addr: SocketAddr) -> Envelope {
        let login = Envelope {
            payload: Payload::Login(LoginPayload {
                p2p_port: self.peer_addr().port(),
            }),
            ..Envelope::new(MessageKind::Login, name)
        };
        self.send_rendezvous(server_addr, &login).await;
        self.recv_rendezvous().await
    }

    async fn send_rendezvous(&self, dest: SocketAddr, env: &Envelope) {
        self.rendezvous
            .send_to(&env.encode().expect("encode"), dest)
            .await
            .expect("send");
    }

    async fn send_peer(&self, dest: SocketAddr, env: &Envelope) {
        self.peer
            .send_to(&env.encode().expect("encode"), dest)
            .await
            .expect("send");
    }

    async fn recv_rendezvous(&self) -> Envelope {
        let mut buf = vec![0u8; 4096];
        let (len, _) = timeout(WAIT, self.rendezvous.recv_from(&mut buf))
            .await
            .expect("no rendezvous datagram within the wait budget")
            .expect("recv");
        Envelope::decode(&buf[..len]).expect("decode")
    }

    /// Next rendezvous datagram of `kind`, skipping unrelated pushes.
    async fn recv_rendezvous_kind(&self, kind: MessageKind) -> Envelope {
        loop {
            let env = self.recv_rendezvous().await;
            if env.kind == kind {
                return env;
            }
        }
    }

    async fn recv_peer(&self) -> (Envelope, SocketAddr) {
        let mut buf = vec![0u8; 4096];
        let (len, src) = timeout(WAIT, self.peer.recv_from(&mut buf))
            .await
            .expect("no peer datagram within the wait budget")
            .expect("recv");
        (Envelope::decode(&buf[..len]).expect("decode"), src)
    }
}

// ── Login & registry ────────────────────────────────────────

#[tokio::test]
async fn login_flow_pushes_lists_to_both_sides() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let mut bob = connect_client(quick_config("bob", target)).await;

    // Bob hears about alice from his private push; alice hears about bob
    // from the follow-up broadcast.
    wait_for_list(&mut bob, &["alice"]).await;
    wait_for_list(&mut alice, &["bob"]).await;

    assert_eq!(server.registry().len().await, 2);

    stop_client(alice).await;
    stop_client(bob).await;
    stop_server(server, runner).await;
}

#[tokio::test]
async fn login_reply_precedes_first_list_push() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let fake = FakePeer::bind().await;
    let reply = fake.login("erin", target).await;
    assert_eq!(reply.kind, MessageKind::Login);
    assert_eq!(reply.content, envelope::LOGIN_ACCEPTED);

    // Strictly after the reply: the private list, already containing erin.
    let push = fake.recv_rendezvous().await;
    assert_eq!(push.kind, MessageKind::UserList);
    assert_eq!(push.content, "user list");
    match push.payload {
        Payload::UserList(list) => {
            assert_eq!(list.users.len(), 1);
            assert_eq!(list.users[0].username, "erin");
            assert_eq!(list.users[0].endpoint, fake.peer_addr());
        }
        other => panic!("expected a user list payload, got {other:?}"),
    }

    stop_server(server, runner).await;
}

#[tokio::test]
async fn duplicate_login_is_rejected_and_registry_unchanged() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let first = FakePeer::bind().await;
    let accepted = first.login("dana", target).await;
    assert_eq!(accepted.content, envelope::LOGIN_ACCEPTED);

    let second = FakePeer::bind().await;
    let rejected = second.login("dana", target).await;
    assert_eq!(rejected.kind, MessageKind::Login);
    assert_eq!(rejected.content, envelope::LOGIN_REJECTED);

    // Still the first dana, at the first endpoint.
    assert_eq!(server.registry().len().await, 1);
    let entry = server.registry().lookup("dana").await.expect("dana online");
    assert_eq!(entry.endpoint, first.peer_addr());

    stop_server(server, runner).await;
}

#[tokio::test]
async fn lookup_answers_found_and_not_found() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let fake = FakePeer::bind().await;
    fake.login("finder", target).await;

    let request = Envelope {
        receiver: "nobody".to_string(),
        ..Envelope::new(MessageKind::P2PRequest, "finder")
    };
    fake.send_rendezvous(target, &request).await;
    let miss = fake.recv_rendezvous_kind(MessageKind::P2PResponse).await;
    assert_eq!(miss.content, envelope::LOOKUP_NOT_FOUND);
    assert_eq!(miss.payload, Payload::None);

    let request = Envelope {
        receiver: "finder".to_string(),
        ..Envelope::new(MessageKind::P2PRequest, "finder")
    };
    fake.send_rendezvous(target, &request).await;
    let hit = fake.recv_rendezvous_kind(MessageKind::P2PResponse).await;
    assert_eq!(hit.content, envelope::LOOKUP_FOUND);
    assert_eq!(
        hit.payload,
        Payload::Lookup(LookupPayload {
            username: "finder".to_string(),
            endpoint: fake.peer_addr(),
        })
    );

    stop_server(server, runner).await;
}

// ── Peer-to-peer chat ───────────────────────────────────────

#[tokio::test]
async fn chat_flows_directly_between_peers() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let mut bob = connect_client(quick_config("bob", target)).await;
    wait_for_list(&mut alice, &["bob"]).await;
    wait_for_list(&mut bob, &["alice"]).await;

    alice
        .commands
        .send(ClientCommand::SendChat {
            to: "bob".to_string(),
            text: "hello bob".to_string(),
        })
        .await
        .expect("command channel");

    let (from, content) = wait_for_chat(&mut bob).await;
    assert_eq!(from, "alice");
    assert_eq!(content, "hello bob");

    // Delivered exactly once.
    assert!(
        timeout(Duration::from_millis(300), bob.events.recv())
            .await
            .is_err(),
        "unexpected extra event after the chat"
    );

    stop_client(alice).await;
    stop_client(bob).await;
    stop_server(server, runner).await;
}

#[tokio::test]
async fn chat_to_unknown_user_leaves_client_usable() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    alice
        .commands
        .send(ClientCommand::SendChat {
            to: "nobody".to_string(),
            text: "anyone there?".to_string(),
        })
        .await
        .expect("command channel");

    // The failed send produces no event and no crash.
    assert!(
        timeout(Duration::from_millis(300), alice.events.recv())
            .await
            .is_err()
    );

    // The client still works: a real peer logs in and chat goes through.
    let mut bob = connect_client(quick_config("bob", target)).await;
    wait_for_list(&mut alice, &["bob"]).await;
    alice
        .commands
        .send(ClientCommand::SendChat {
            to: "bob".to_string(),
            text: "there you are".to_string(),
        })
        .await
        .expect("command channel");
    let (from, content) = wait_for_chat(&mut bob).await;
    assert_eq!(from, "alice");
    assert_eq!(content, "there you are");

    stop_client(alice).await;
    stop_client(bob).await;
    stop_server(server, runner).await;
}

#[tokio::test]
async fn list_discovery_triggers_join_handshake() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let ghost = FakePeer::bind().await;
    ghost.login("ghost", target).await;

    // The broadcast tells alice about ghost; she owes ghost a Join at his
    // advertised endpoint, from her peer socket.
    let (join, src) = ghost.recv_peer().await;
    assert_eq!(join.kind, MessageKind::Presence);
    assert_eq!(join.content, "Join");
    assert_eq!(join.sender, "alice");
    assert_eq!(src, alice.peer_addr);

    wait_for_list(&mut alice, &["ghost"]).await;

    stop_client(alice).await;
    stop_server(server, runner).await;
}

#[tokio::test]
async fn empty_sender_datagram_is_ignored() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let ghost = FakePeer::bind().await;

    let anonymous = Envelope::chat("", "alice", "boo");
    ghost.send_peer(alice.peer_addr, &anonymous).await;
    assert!(
        timeout(Duration::from_millis(300), alice.events.recv())
            .await
            .is_err(),
        "anonymous datagram must not surface"
    );

    // A named Join from the same socket is honored.
    let join = Envelope::presence(PresenceKind::Join, "ghost", "alice");
    ghost.send_peer(alice.peer_addr, &join).await;
    wait_for_list(&mut alice, &["ghost"]).await;

    stop_client(alice).await;
    stop_server(server, runner).await;
}

// ── Disconnect paths ────────────────────────────────────────

#[tokio::test]
async fn leave_notice_fires_once_and_fast() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let bob = connect_client(quick_config("bob", target)).await;
    wait_for_list(&mut alice, &["bob"]).await;

    stop_client(bob).await;

    // The explicit Leave beats any timeout by an order of magnitude.
    let name = wait_for(&mut alice, |event| match event {
        ClientEvent::UserDisconnected(name) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(name, "bob");
    wait_for_list(&mut alice, &[]).await;

    // Exactly one disconnect notification, no echoes.
    assert!(
        timeout(Duration::from_millis(300), alice.events.recv())
            .await
            .is_err()
    );

    stop_client(alice).await;
    stop_server(server, runner).await;
}

#[tokio::test]
async fn silent_peer_is_evicted_after_timeout() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut config = quick_config("alice", target);
    config.ping_interval = Duration::from_millis(50);
    config.peer_timeout = Duration::from_millis(250);
    config.publish_debounce = Duration::from_millis(20);
    let mut alice = connect_client(config).await;

    let ghost = FakePeer::bind().await;
    ghost.login("ghost", target).await;
    let push = ghost.recv_rendezvous_kind(MessageKind::UserList).await;
    let alice_endpoint = match push.payload {
        Payload::UserList(list) => {
            list.users
                .iter()
                .find(|user| user.username == "alice")
                .expect("alice in the push")
                .endpoint
        }
        other => panic!("expected a user list payload, got {other:?}"),
    };

    // One Join, then silence. Alice keeps pinging; pings are outbound and
    // must not keep ghost alive.
    let join = Envelope::presence(PresenceKind::Join, "ghost", "alice");
    ghost.send_peer(alice_endpoint, &join).await;
    wait_for_list(&mut alice, &["ghost"]).await;

    let name = wait_for(&mut alice, |event| match event {
        ClientEvent::UserDisconnected(name) => Some(name),
        _ => None,
    })
    .await;
    assert_eq!(name, "ghost");
    wait_for_list(&mut alice, &[]).await;

    stop_client(alice).await;
    stop_server(server, runner).await;
}

// ── Server shutdown ─────────────────────────────────────────

#[tokio::test]
async fn server_shutdown_does_not_break_established_chat() {
    let (server, runner) = start_server().await;
    let target = server_target(&server);

    let mut alice = connect_client(quick_config("alice", target)).await;
    let mut bob = connect_client(quick_config("bob", target)).await;
    wait_for_list(&mut alice, &["bob"]).await;
    wait_for_list(&mut bob, &["alice"]).await;

    stop_server(server, runner).await;

    // Both sides hear the shutdown notice.
    wait_for(&mut alice, |event| {
        matches!(event, ClientEvent::ServerShutdown).then_some(())
    })
    .await;
    wait_for(&mut bob, |event| {
        matches!(event, ClientEvent::ServerShutdown).then_some(())
    })
    .await;

    // The rendezvous is gone; the session is not.
    bob.commands
        .send(ClientCommand::SendChat {
            to: "alice".to_string(),
            text: "still here".to_string(),
        })
        .await
        .expect("command channel");
    let (from, content) = wait_for_chat(&mut alice).await;
    assert_eq!(from, "bob");
    assert_eq!(content, "still here");

    stop_client(alice).await;
    stop_client(bob).await;
}
