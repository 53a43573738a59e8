use std::error::Error;

use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use rendezchat::common::{ClientCommand, ClientEvent};
use rendezchat::config;
use rendezchat::network::{ChatClient, ClientConfig, RendezvousServer, ServerConfig};

#[derive(Parser)]
#[command(name = "rendezchat", version, about = "Rendezvous-based P2P chat")]
struct Cli {
    /// Path to JSON config file
    #[arg(long, default_value = config::DEFAULT_CONFIG_PATH, value_name = "FILE")]
    config: String,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run the rendezvous server
    Server {
        /// UDP port to listen on (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Log in and chat interactively
    Client {
        /// Username to register with the server
        #[arg(long)]
        username: String,
        /// Server address as host:port (overrides the config file)
        #[arg(long)]
        server: Option<String>,
        /// Fixed peer port (overrides the config file)
        #[arg(long)]
        peer_port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let app_config = config::load_config(&cli.config);

    match cli.mode {
        Mode::Server { port } => run_server(port.unwrap_or(app_config.server_port)).await,
        Mode::Client {
            username,
            server,
            peer_port,
        } => {
            let target = server.unwrap_or_else(|| app_config.server_target());
            run_client(username, target, peer_port.or(app_config.peer_port)).await
        }
    }
}

async fn run_server(port: u16) -> Result<(), Box<dyn Error>> {
    let server = RendezvousServer::bind(ServerConfig {
        port,
        ..ServerConfig::default()
    })
    .await?;

    let runner = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Ctrl+C received, shutting down");
    server.shutdown();
    runner.await?;
    Ok(())
}

async fn run_client(
    username: String,
    target: String,
    peer_port: Option<u16>,
) -> Result<(), Box<dyn Error>> {
    let server_addr = tokio::net::lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| format!("could not resolve {target}"))?;

    // REPL -> client commands, client -> REPL events.
    let (cmd_tx, cmd_rx) = mpsc::channel(100);
    let (event_tx, mut event_rx) = mpsc::channel(100);

    let mut client_config = ClientConfig::new(username, server_addr);
    client_config.peer_port = peer_port;
    let client = ChatClient::connect(client_config, event_tx, cmd_rx).await?;
    println!(
        "Connected to {} as {} (peer endpoint {})",
        server_addr,
        client.username(),
        client.peer_addr()?
    );
    println!("Commands: /chat <user> <text>, /users, /quit, /help");

    let runner = tokio::spawn(client.run());

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => print_event(event),
                None => break,
            },
            result = lines.next_line() => match result {
                Ok(Some(line)) => {
                    if handle_line(&line, &cmd_tx).await == LineResult::Quit {
                        break;
                    }
                }
                // EOF (stdin closed).
                Ok(None) => break,
                Err(err) => {
                    log::error!("Failed to read input: {err}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let _ = cmd_tx.send(ClientCommand::Disconnect).await;
    runner.await??;
    println!("Goodbye.");
    Ok(())
}

#[derive(PartialEq)]
enum LineResult {
    Continue,
    Quit,
}

async fn handle_line(line: &str, commands: &mpsc::Sender<ClientCommand>) -> LineResult {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineResult::Continue;
    }
    let (cmd, rest) = match trimmed.split_once(' ') {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (trimmed, ""),
    };

    match cmd {
        "/quit" | "/exit" | "/q" => return LineResult::Quit,
        "/users" => {
            if commands.send(ClientCommand::RequestUserList).await.is_err() {
                return LineResult::Quit;
            }
        }
        "/chat" => match rest.split_once(' ') {
            Some((to, text)) if !text.trim().is_empty() => {
                let command = ClientCommand::SendChat {
                    to: to.to_string(),
                    text: text.trim().to_string(),
                };
                if commands.send(command).await.is_err() {
                    return LineResult::Quit;
                }
            }
            _ => println!("usage: /chat <user> <text>"),
        },
        "/help" => {
            println!("  /chat <user> <text>   send a direct message");
            println!("  /users                request the user list");
            println!("  /quit                 disconnect and exit");
        }
        other => println!("unknown command '{other}', type /help"),
    }
    LineResult::Continue
}

fn print_event(event: ClientEvent) {
    match event {
        ClientEvent::ChatReceived { from, content } => println!("[{from}] {content}"),
        ClientEvent::UserListUpdated(users) => {
            if users.is_empty() {
                println!("* nobody else is online");
            } else {
                println!("* online: {}", users.join(", "));
            }
        }
        ClientEvent::UserDisconnected(name) => println!("* {name} disconnected"),
        ClientEvent::ServerShutdown => {
            println!("* server is shutting down; existing chats keep working");
        }
    }
}
