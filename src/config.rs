use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::network::server::DEFAULT_PORT;

pub const DEFAULT_CONFIG_PATH: &str = "config/rendezchat.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Host the client logs in to.
    pub server_host: String,
    /// UDP port the rendezvous server listens on.
    pub server_port: u16,
    /// Fixed peer port; absent means scan the default range.
    pub peer_port: Option<u16>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: DEFAULT_PORT,
            peer_port: None,
        }
    }
}

impl AppConfig {
    /// The rendezvous target as `host:port`, ready for resolution.
    pub fn server_target(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}
