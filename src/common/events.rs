/// Events the chat client surfaces to whatever front end drains them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The reachable peer set changed. Usernames, sorted, self excluded.
    UserListUpdated(Vec<String>),
    /// A peer left or timed out. Fires exactly once per eviction.
    UserDisconnected(String),
    ChatReceived { from: String, content: String },
    /// The rendezvous server announced shutdown. Peer sessions keep working.
    ServerShutdown,
}
