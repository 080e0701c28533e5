//! Centralized server configuration.
//!
//! Loaded via the `config` crate from environment variables, with `__`
//! separating nested keys (`LLM__MODEL`, `CONVERSATION__SUMMARY_THRESHOLD`).

use chatledger_ai::LlmBackendConfig;
use chatledger_conversation::ConversationConfig;
use serde::Deserialize;

/// Server configuration composed from library configs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// SQLite database connection URL.
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Address the HTTP listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Completion backend configuration.
    #[serde(default)]
    pub llm: LlmBackendConfig,

    /// Session and compaction configuration.
    #[serde(default)]
    pub conversation: ConversationConfig,
}

fn default_database_url() -> String {
    "sqlite://chatbot_sessions.sqlite?mode=rwc".to_string()
}

fn default_bind_addr() -> String {
    "127.0.0.1:8000".to_string()
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_environment(config::Environment::default())
    }

    fn from_environment(environment: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(environment.separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}
