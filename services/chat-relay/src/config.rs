//! Configuration types and loading
//!
//! The file path comes from `--config`, then `CONFIG_PATH`, then
//! `chat-relay.toml`. Every setting is read from that file, falling back to
//! its default.
//! Upstream API keys are never read from the TOML body. They come from the
//! numbered `UPSTREAM_API_KEY_<n>` env slots, the single `UPSTREAM_API_KEY`
//! fallback, or a `keys_file`, in that order.

use common::Secret;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Highest numbered key slot scanned (`UPSTREAM_API_KEY_1` ..= `UPSTREAM_API_KEY_32`).
pub const MAX_KEY_SLOTS: usize = 32;

const KEY_ENV_PREFIX: &str = "UPSTREAM_API_KEY";

/// Directive prepended to every conversation sent upstream.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and \
concisely, and use Markdown formatting where it improves readability.";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Upstream completion provider settings
#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    /// Chat completions endpoint, e.g. `https://openrouter.ai/api/v1/chat/completions`
    pub url: String,
    pub model: String,
    /// How long a key stays out of rotation after a 429.
    #[serde(default = "default_penalty_secs")]
    pub penalty_secs: u64,
    /// Bounds connection establishment only; streamed bodies are not timed out.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// File with one key per line, used when no key env var is set.
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    #[serde(skip)]
    pub api_keys: Vec<Secret<String>>,
}

/// Chat request shaping
#[derive(Debug, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_penalty_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_message_chars() -> usize {
    32_000
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve API keys.
    ///
    /// An empty key pool is not an error here: the service still starts and
    /// the chat endpoint reports the misconfiguration per request.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.upstream.api_keys = resolve_api_keys(config.upstream.keys_file.as_deref())?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.upstream.url.starts_with("http://") && !self.upstream.url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "upstream.url must start with http:// or https://, got: {}",
                self.upstream.url
            )));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(common::Error::Config(
                "upstream.model must not be empty".into(),
            ));
        }
        if self.upstream.penalty_secs == 0 {
            return Err(common::Error::Config(
                "upstream.penalty_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "server.max_connections must be greater than 0".into(),
            ));
        }
        if self.server.max_body_bytes == 0 {
            return Err(common::Error::Config(
                "server.max_body_bytes must be greater than 0".into(),
            ));
        }
        if self.chat.max_message_chars == 0 {
            return Err(common::Error::Config(
                "chat.max_message_chars must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-relay.toml")
    }
}

/// Collect the ordered key list from env slots, the single-key fallback, or a file.
fn resolve_api_keys(keys_file: Option<&Path>) -> common::Result<Vec<Secret<String>>> {
    let mut raw: Vec<String> = (1..=MAX_KEY_SLOTS)
        .filter_map(|slot| std::env::var(format!("{KEY_ENV_PREFIX}_{slot}")).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .collect();

    if raw.is_empty()
        && let Ok(single) = std::env::var(KEY_ENV_PREFIX)
    {
        let single = single.trim();
        if !single.is_empty() {
            raw.push(single.to_owned());
        }
    }

    if raw.is_empty()
        && let Some(path) = keys_file
    {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!("failed to read keys_file {}: {e}", path.display()))
        })?;
        raw.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_owned),
        );
    }

    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(raw.len());
    for (position, value) in raw.into_iter().enumerate() {
        if seen.contains(&value) {
            warn!(position, "dropping duplicate upstream API key");
            continue;
        }
        seen.insert(value.clone());
        keys.push(Secret::new(value));
    }
    Ok(keys)
}
