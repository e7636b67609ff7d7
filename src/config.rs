//! Layered configuration: defaults, optional file, `CHATGATE_`-prefixed
//! environment variables, then CLI overrides.

use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a concise, friendly assistant. Answer briefly and stay on topic.";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Global concurrent upstream call limit
    #[arg(long, env = "GATE_CAPACITY")]
    pub capacity: Option<usize>,

    /// Bounded admission wait-queue size
    #[arg(long, env = "GATE_MAX_QUEUE")]
    pub max_queue: Option<usize>,

    /// Turns retained and surfaced per session
    #[arg(long, env = "MEMORY_WINDOW")]
    pub memory_window: Option<usize>,

    /// Upstream model identifier
    #[arg(long, env = "LLM_MODEL")]
    pub model: Option<String>,

    /// Echo internal error detail to callers
    #[arg(long, env = "DEBUG_ERRORS")]
    pub debug_errors: Option<bool>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gate: GateConfig,
    pub chat: ChatConfig,
    pub upstream: UpstreamConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GateConfig {
    pub capacity: usize,
    pub max_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    pub memory_window: usize,
    pub system_prompt: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub jitter_ms: u64,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    /// Shared secret for the admin endpoints. When unset, those endpoints
    /// always answer 401.
    #[serde(default)]
    pub admin_token: Option<String>,
    pub debug_errors: bool,
}

impl AppConfig {
    /// Load configuration from process arguments and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error when a source fails to parse or a value fails
    /// validation.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_args(std::env::args())
    }

    /// Load configuration from an explicit argument list (testable form of
    /// [`AppConfig::load`]).
    ///
    /// # Errors
    ///
    /// Returns an error when a source fails to parse or a value fails
    /// validation.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000)?
            .set_default("gate.capacity", 2)?
            .set_default("gate.max_queue", 8)?
            .set_default("chat.memory_window", 20)?
            .set_default("chat.system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("upstream.base_url", "https://api.openai.com")?
            .set_default("upstream.model", "gpt-4o")?
            .set_default("upstream.max_retries", 3)?
            .set_default("upstream.base_delay_ms", 400)?
            .set_default("upstream.jitter_ms", 200)?
            .set_default("security.debug_errors", false)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        }

        // Environment variables prefixed with CHATGATE_, e.g.
        // CHATGATE_GATE__CAPACITY=4.
        builder = builder.add_source(
            Environment::with_prefix("CHATGATE")
                .separator("__")
                .try_parsing(true),
        );

        // Convenience env vars matching the upstream provider's conventions.
        if let Ok(val) = env::var("LLM_BASE_URL") {
            if !val.trim().is_empty() {
                builder = builder.set_override("upstream.base_url", val)?;
            }
        }
        if let Ok(val) = env::var("LLM_API_KEY") {
            if !val.trim().is_empty() {
                builder = builder.set_override("upstream.api_key", val)?;
            }
        }
        if let Ok(val) = env::var("ADMIN_TOKEN") {
            if !val.trim().is_empty() {
                builder = builder.set_override("security.admin_token", val)?;
            }
        }

        // CLI flags (and their env fallbacks handled by clap) win last.
        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(capacity) = cli.capacity {
            builder = builder.set_override("gate.capacity", capacity as u64)?;
        }
        if let Some(max_queue) = cli.max_queue {
            builder = builder.set_override("gate.max_queue", max_queue as u64)?;
        }
        if let Some(window) = cli.memory_window {
            builder = builder.set_override("chat.memory_window", window as u64)?;
        }
        if let Some(model) = cli.model {
            builder = builder.set_override("upstream.model", model)?;
        }
        if let Some(debug) = cli.debug_errors {
            builder = builder.set_override("security.debug_errors", debug)?;
        }

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gate.capacity == 0 {
            return Err(ConfigError::Message(
                "gate.capacity must be at least 1".to_owned(),
            ));
        }
        if self.chat.memory_window == 0 {
            return Err(ConfigError::Message(
                "chat.memory_window must be at least 1".to_owned(),
            ));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "upstream.base_url must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}
