use serde::{Deserialize, Deserializer, Serialize};

use crate::types::{LeanGymError, SearchId, StateId};

/// Goal text lean-gym reports once a proof is finished.
pub const NO_GOALS: &str = "no goals";

/// A command sent to lean-gym as one JSON line.
///
/// lean-gym expects `["<name>", [<args>...]]`, with every identifier
/// sent as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GymRequest {
    /// Open a new proof search for a declaration.
    InitSearch { declaration: String },
    /// Apply a tactic to a state of an open search.
    RunTac {
        search_id: SearchId,
        state_id: StateId,
        tactic: String,
    },
    /// Close a search and free its states inside lean-gym.
    ClearSearch { search_id: SearchId },
}

/// Wire format for the outer `[name, args]` envelope.
#[derive(Serialize)]
struct CommandWire<'a, A>(&'static str, &'a A);

impl GymRequest {
    /// Command name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            GymRequest::InitSearch { .. } => "init_search",
            GymRequest::RunTac { .. } => "run_tac",
            GymRequest::ClearSearch { .. } => "clear_search",
        }
    }

    /// Serialize this request to a JSON line (without the trailing newline).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            GymRequest::InitSearch { declaration } => {
                serde_json::to_string(&CommandWire(self.name(), &(declaration.as_str(), "")))
            }
            GymRequest::RunTac {
                search_id,
                state_id,
                tactic,
            } => serde_json::to_string(&CommandWire(
                self.name(),
                &(search_id.as_str(), state_id.as_str(), tactic.as_str()),
            )),
            GymRequest::ClearSearch { search_id } => {
                serde_json::to_string(&CommandWire(self.name(), &(search_id.as_str(),)))
            }
        }
    }
}

/// A reply line from lean-gym.
///
/// Identifiers may arrive as strings or numbers; both normalize to the same
/// opaque token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GymReply {
    /// `None` on success, otherwise the error lean-gym reported.
    #[serde(default, deserialize_with = "error_text")]
    pub error: Option<String>,
    #[serde(default)]
    pub search_id: Option<SearchId>,
    #[serde(default)]
    pub tactic_state_id: Option<StateId>,
    #[serde(default)]
    pub tactic_state: Option<String>,
    /// Present on `init_search` replies; kept verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof_steps: Option<serde_json::Value>,
}

/// lean-gym usually reports errors as strings, but anything non-null counts.
fn error_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl GymReply {
    /// Parse one reply line.
    pub fn parse(line: &str) -> Result<Self, LeanGymError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| LeanGymError::Protocol(format!("Invalid JSON: {e}. Raw: {line}")))?;

        if !value.is_object() {
            return Err(LeanGymError::Protocol(format!(
                "Expected a JSON object. Raw: {line}"
            )));
        }

        serde_json::from_value(value).map_err(|e| {
            LeanGymError::Protocol(format!("Failed to parse reply: {e}. Raw: {line}"))
        })
    }

    /// A success reply built from the local search tree instead of the wire.
    pub fn cached(search_id: SearchId, state_id: StateId, tactic_state: String) -> Self {
        Self {
            error: None,
            search_id: Some(search_id),
            tactic_state_id: Some(state_id),
            tactic_state: Some(tactic_state),
            proof_steps: None,
        }
    }

    /// A failure reply built locally.
    pub fn failure(search_id: SearchId, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            search_id: Some(search_id),
            tactic_state_id: None,
            tactic_state: None,
            proof_steps: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether this reply ends a `clear_search` exchange: it carries no state.
    pub fn is_terminal(&self) -> bool {
        self.tactic_state.is_none() && self.tactic_state_id.is_none()
    }

    /// Whether the reply closes the proof.
    pub fn is_done(&self) -> bool {
        !self.is_error() && self.tactic_state.as_deref() == Some(NO_GOALS)
    }

    /// 1.0 for a finished proof, 0.0 otherwise.
    pub fn reward(&self) -> f64 {
        if self.is_done() {
            1.0
        } else {
            0.0
        }
    }

    /// The resulting state of a successful reply.
    ///
    /// A success reply missing either field is a protocol violation.
    pub fn success_state(&self) -> Result<(&StateId, &str), LeanGymError> {
        match (&self.tactic_state_id, &self.tactic_state) {
            (Some(id), Some(text)) => Ok((id, text.as_str())),
            _ => Err(LeanGymError::Protocol(format!(
                "Success reply without tactic state: {self:?}"
            ))),
        }
    }
}
