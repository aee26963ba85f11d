use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Errors that can occur while driving a lean-gym process.
///
/// Tactic failures are not errors: a tactic the prover rejects comes back as
/// an ordinary [`GymReply`](crate::GymReply) whose `error` field is set.
#[derive(Debug, thiserror::Error)]
pub enum LeanGymError {
    /// The pipe to the lean-gym process is closed. The instance is unusable
    /// and must be killed and rebuilt.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No reply arrived within the read budget.
    #[error("Command timed out after {elapsed:?}: {command}")]
    Timeout { elapsed: Duration, command: String },

    /// Malformed JSON or an unexpected reply shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// `clear_search` finished with an error. The session has already been
    /// dropped from the store when this is returned.
    #[error("Teardown of search {search_id} failed: {message}")]
    Teardown { search_id: SearchId, message: String },

    /// No active session with this id.
    #[error("Unknown search: {0}")]
    UnknownSearch(SearchId),

    /// The session exists but has no state with this id.
    #[error("Unknown state {state_id} in search {search_id}")]
    UnknownState { search_id: SearchId, state_id: StateId },

    /// Batch arguments violate the batching contract.
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// The instance was killed; no further commands may be issued.
    #[error("Lean instance has been killed")]
    Killed,

    /// The RL environment was used out of order (e.g. `step` before `reset`).
    #[error("Environment error: {0}")]
    Environment(String),

    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// IO error from process management.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Accepts an identifier as either JSON text or a JSON number.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl RawId {
    fn into_token(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
        }
    }
}

macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw token.
            pub fn new(token: impl Into<String>) -> Self {
                Self(token.into())
            }

            /// The token exactly as it goes on the wire.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Integer view of the token, for callers that need numeric
            /// correlation with an external system.
            pub fn as_u64(&self) -> Option<u64> {
                self.0.parse().ok()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_token()))
            }
        }
    };
}

opaque_id!(
    /// Identifier lean-gym assigns to a proof search at `init_search` time.
    SearchId
);

opaque_id!(
    /// Identifier of a proof state, unique within its search.
    StateId
);

/// Configuration for a single lean-gym instance.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct LeanGymConfig {
    /// Path to the lean-gym checkout. Used as the working directory.
    pub lean_gym_path: PathBuf,

    /// Executable to launch.
    #[serde(default = "default_command")]
    pub command: PathBuf,

    /// Arguments passed to `command`.
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Read timeout in seconds for a single reply.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Read timeout in seconds for each reply drained during `clear_search`.
    #[serde(default = "default_clear_timeout")]
    pub clear_timeout_secs: u64,

    /// Upper bound on replies drained during `clear_search`.
    #[serde(default = "default_max_teardown_messages")]
    pub max_teardown_messages: usize,

    /// Milliseconds to wait after the graceful stop before killing the process.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// 0 keeps wire traffic at trace level, 1 logs it at debug, 2+ at info.
    #[serde(default)]
    pub verbose: u8,
}

impl LeanGymConfig {
    /// Config with defaults for everything but the checkout path.
    pub fn new(lean_gym_path: impl Into<PathBuf>) -> Self {
        Self {
            lean_gym_path: lean_gym_path.into(),
            command: default_command(),
            args: default_args(),
            timeout_secs: default_timeout(),
            clear_timeout_secs: default_clear_timeout(),
            max_teardown_messages: default_max_teardown_messages(),
            kill_grace_ms: default_kill_grace_ms(),
            verbose: 0,
        }
    }

    /// Parse a config from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, LeanGymError> {
        toml::from_str(contents).map_err(|e| LeanGymError::Config(e.to_string()))
    }

    /// Load a config from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self, LeanGymError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LeanGymError::Config(format!("{}: {e}", path.display())))?;
        let config = Self::from_toml_str(&contents)?;
        tracing::info!(path = %path.display(), "Loaded lean-gym config");
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn clear_timeout(&self) -> Duration {
        Duration::from_secs(self.clear_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

fn default_command() -> PathBuf {
    PathBuf::from("lean")
}
fn default_args() -> Vec<String> {
    vec!["--run".to_string(), "src/repl.lean".to_string()]
}
fn default_timeout() -> u64 {
    300
}
fn default_clear_timeout() -> u64 {
    10
}
fn default_max_teardown_messages() -> usize {
    4096
}
fn default_kill_grace_ms() -> u64 {
    500
}
