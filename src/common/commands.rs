/// Commands the front end sends down to the chat client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    /// Send `text` directly to the named peer.
    SendChat { to: String, text: String },
    /// Ask the rendezvous server for the current online set.
    RequestUserList,
    /// Leave all peers, log out of the server, stop the client.
    Disconnect,
}
