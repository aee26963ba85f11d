//! reset/step/close view of one proof search, for RL-style callers.

use crate::instance::LeanInstance;
use crate::protocol::GymReply;
use crate::types::{LeanGymError, SearchId, StateId};

/// What the agent sees of a proof state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub state_id: StateId,
    pub text: String,
}

impl Observation {
    fn from_reply(reply: &GymReply) -> Option<Self> {
        if reply.is_error() {
            return None;
        }
        Some(Self {
            state_id: reply.tactic_state_id.clone()?,
            text: reply.tactic_state.clone()?,
        })
    }
}

/// A tactic to apply at a given state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub state_id: StateId,
    pub tactic: String,
}

impl Action {
    pub fn new(state_id: impl Into<StateId>, tactic: impl Into<String>) -> Self {
        Self {
            state_id: state_id.into(),
            tactic: tactic.into(),
        }
    }
}

/// Outcome of one [`LeanEnv::step`].
#[derive(Debug, Clone)]
pub struct Step {
    /// `None` when the tactic failed.
    pub observation: Option<Observation>,
    /// 1.0 when the proof is finished, else 0.0.
    pub reward: f64,
    pub done: bool,
    /// The raw reply.
    pub info: GymReply,
}

/// One declaration proved over one [`LeanInstance`].
pub struct LeanEnv {
    instance: LeanInstance,
    declaration: Option<String>,
    search_id: Option<SearchId>,
    initial: Option<(Option<Observation>, GymReply)>,
}

impl LeanEnv {
    pub fn new(instance: LeanInstance, declaration: Option<String>) -> Self {
        Self {
            instance,
            declaration,
            search_id: None,
            initial: None,
        }
    }

    pub fn instance(&self) -> &LeanInstance {
        &self.instance
    }

    pub fn instance_mut(&mut self) -> &mut LeanInstance {
        &mut self.instance
    }

    pub fn declaration(&self) -> Option<&str> {
        self.declaration.as_deref()
    }

    pub fn search_id(&self) -> Option<&SearchId> {
        self.search_id.as_ref()
    }

    /// Initial observation for the current declaration, opening the search
    /// on first use.
    ///
    /// Passing a declaration switches to it. Resetting again without one
    /// returns the same initial observation without contacting lean-gym.
    pub async fn reset(
        &mut self,
        declaration: Option<&str>,
    ) -> Result<(Option<Observation>, GymReply), LeanGymError> {
        if let Some(declaration) = declaration {
            self.forget_search();
            self.declaration = Some(declaration.to_string());
        }
        let declaration = self
            .declaration
            .clone()
            .ok_or_else(|| LeanGymError::Environment("declaration name is not provided".into()))?;

        if self.search_id.is_some() {
            if let Some(initial) = &self.initial {
                return Ok(initial.clone());
            }
        }

        let reply = self.instance.init_search(&declaration).await?;
        let observation = Observation::from_reply(&reply);
        if observation.is_some() {
            self.search_id = reply.search_id.clone();
        }
        self.initial = Some((observation.clone(), reply.clone()));
        Ok((observation, reply))
    }

    /// Apply the action's tactic in the current search.
    pub async fn step(&mut self, action: &Action) -> Result<Step, LeanGymError> {
        let search_id = self
            .search_id
            .clone()
            .ok_or_else(|| LeanGymError::Environment("no open search; call reset first".into()))?;

        let info = self
            .instance
            .run_stmt(&search_id, &action.state_id, &action.tactic)
            .await?;
        Ok(Step {
            observation: Observation::from_reply(&info),
            reward: info.reward(),
            done: info.is_done(),
            info,
        })
    }

    /// Close the current search, keeping the declaration for the next reset.
    pub async fn clear(&mut self) -> Result<Option<GymReply>, LeanGymError> {
        let Some(search_id) = self.search_id.clone() else {
            return Ok(None);
        };
        self.forget_search();
        self.instance.clear_search(&search_id).await.map(Some)
    }

    /// Kill the underlying instance.
    pub async fn close(&mut self) {
        self.forget_search();
        self.declaration = None;
        self.instance.kill().await;
    }

    fn forget_search(&mut self) {
        self.search_id = None;
        self.initial = None;
    }
}
