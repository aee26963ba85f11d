//! Scripted stand-in for a lean-gym process, for testing without Lean.
//!
//! [`FakeLeanGym`] speaks the lean-gym wire protocol over an in-memory
//! duplex pipe. Goals and tactic outcomes are looked up in tables keyed by
//! goal text; state ids are handed out fresh for every successful
//! application, as lean-gym does.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use crate::instance::LeanInstance;
use crate::types::LeanGymConfig;

#[derive(Debug, Clone)]
enum Outcome {
    Next(String),
    Fail(String),
    Raw(String),
    Silent,
}

#[derive(Debug, Default)]
struct FakeSearch {
    states: HashMap<String, String>,
    next_state: u64,
}

/// A fake lean-gym. Configure it with the builder methods, then
/// [`connect`](Self::connect) a [`LeanInstance`] to it.
#[derive(Debug, Default)]
pub struct FakeLeanGym {
    theorems: HashMap<String, String>,
    outcomes: HashMap<(String, String), Outcome>,
    any_goal: HashMap<String, Outcome>,
    delays: HashMap<String, Duration>,
    pending_delay: Option<Duration>,
    init_warnings: usize,
    reply_window: usize,
    teardown_noise: usize,
    teardown_error: Option<String>,
    numeric_ids: bool,
    tag_errors: bool,
    searches: HashMap<String, FakeSearch>,
    next_search: u64,
}

impl FakeLeanGym {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `declaration` known, with `goal` as its initial state.
    pub fn theorem(mut self, declaration: &str, goal: &str) -> Self {
        self.theorems
            .insert(declaration.to_string(), goal.to_string());
        self
    }

    /// Running `tactic` on a state whose text is `goal` succeeds with `next`.
    pub fn tactic(mut self, goal: &str, tactic: &str, next: &str) -> Self {
        self.outcomes.insert(
            (goal.to_string(), tactic.to_string()),
            Outcome::Next(next.to_string()),
        );
        self
    }

    /// Running `tactic` on `goal` fails with `error`.
    pub fn failing_tactic(mut self, goal: &str, tactic: &str, error: &str) -> Self {
        self.outcomes.insert(
            (goal.to_string(), tactic.to_string()),
            Outcome::Fail(error.to_string()),
        );
        self
    }

    /// `tactic` is answered with `line` verbatim, from any state.
    pub fn raw_reply(mut self, tactic: &str, line: &str) -> Self {
        self.any_goal
            .insert(tactic.to_string(), Outcome::Raw(line.to_string()));
        self
    }

    /// `tactic` is never answered, from any state.
    pub fn silent_tactic(mut self, tactic: &str) -> Self {
        self.any_goal.insert(tactic.to_string(), Outcome::Silent);
        self
    }

    /// Answer `tactic` only after `delay`, from any state.
    pub fn slow_tactic(mut self, tactic: &str, delay: Duration) -> Self {
        self.delays.insert(tactic.to_string(), delay);
        self
    }

    /// Print `n` warning lines before every `init_search` reply.
    pub fn with_init_warnings(mut self, n: usize) -> Self {
        self.init_warnings = n;
        self
    }

    /// Hold `run_tac` replies until `window` of them are buffered, then
    /// flush them in reverse order.
    pub fn with_reversed_replies(mut self, window: usize) -> Self {
        self.reply_window = window;
        self
    }

    /// Emit `n` stale state replies before the one ending a `clear_search`.
    pub fn with_teardown_noise(mut self, n: usize) -> Self {
        self.teardown_noise = n;
        self
    }

    /// End every `clear_search` with this error.
    pub fn with_teardown_error(mut self, error: &str) -> Self {
        self.teardown_error = Some(error.to_string());
        self
    }

    /// Send ids as JSON numbers instead of strings.
    pub fn with_numeric_ids(mut self) -> Self {
        self.numeric_ids = true;
        self
    }

    /// Include the `search_id` in tactic error replies. lean-gym leaves it null.
    pub fn with_tagged_errors(mut self) -> Self {
        self.tag_errors = true;
        self
    }

    /// Start serving and return an instance wired to this fake.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(self, config: LeanGymConfig) -> (LeanInstance, FakeGymHandle) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let instance = LeanInstance::from_io(client_read, client_write, config);

        let commands = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(self.serve(server, Arc::clone(&commands)));
        (instance, FakeGymHandle { commands, task })
    }

    async fn serve(mut self, stream: DuplexStream, commands: Arc<Mutex<Vec<String>>>) {
        let (read, mut write) = tokio::io::split(stream);
        let mut lines = BufReader::new(read).lines();
        let mut held: Vec<String> = Vec::new();

        while let Ok(Some(line)) = lines.next_line().await {
            commands
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(line.clone());

            let (is_tactic, replies) = self.respond(&line);
            let outgoing = if is_tactic && self.reply_window > 1 {
                held.extend(replies);
                if held.len() < self.reply_window {
                    continue;
                }
                held.drain(..).rev().collect()
            } else {
                replies
            };

            if let Some(delay) = self.pending_delay.take() {
                tokio::time::sleep(delay).await;
            }
            for reply in outgoing {
                let sent = async {
                    write.write_all(reply.as_bytes()).await?;
                    write.write_all(b"\n").await?;
                    write.flush().await
                }
                .await;
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    fn id(&self, n: impl ToString) -> Value {
        let text = n.to_string();
        match (self.numeric_ids, text.parse::<u64>()) {
            (true, Ok(num)) => json!(num),
            _ => json!(text),
        }
    }

    fn reply(&self, error: Option<&str>, search: Option<&str>, state: Option<(&str, &str)>) -> String {
        json!({
            "error": error,
            "proof_steps": [],
            "search_id": search.map(|s| self.id(s)),
            "tactic_state": state.map(|(_, text)| text),
            "tactic_state_id": state.map(|(id, _)| self.id(id)),
        })
        .to_string()
    }

    /// Replies for one command line, and whether it was a `run_tac`.
    fn respond(&mut self, line: &str) -> (bool, Vec<String>) {
        let parsed: Option<(String, Vec<String>)> = serde_json::from_str(line).ok();
        let Some((name, args)) = parsed else {
            return (false, vec![self.reply(Some("failed to parse command"), None, None)]);
        };

        match (name.as_str(), args.as_slice()) {
            ("init_search", [declaration, _]) => (false, self.init_search(declaration)),
            ("run_tac", [search_id, state_id, tactic]) => {
                (true, self.run_tac(search_id, state_id, tactic))
            }
            ("clear_search", [search_id]) => (false, self.clear_search(search_id)),
            _ => (false, vec![self.reply(Some("unknown command"), None, None)]),
        }
    }

    fn init_search(&mut self, declaration: &str) -> Vec<String> {
        let mut out: Vec<String> = (0..self.init_warnings)
            .map(|i| format!("src/repl.lean:{}:0: warning: declaration uses 'sorry'", i + 1))
            .collect();

        let Some(goal) = self.theorems.get(declaration).cloned() else {
            let error = format!("unknown_declaration {declaration}");
            out.push(self.reply(Some(error.as_str()), None, None));
            return out;
        };

        let search_id = self.next_search.to_string();
        self.next_search += 1;
        let mut search = FakeSearch {
            next_state: 1,
            ..FakeSearch::default()
        };
        search.states.insert("0".to_string(), goal.clone());
        self.searches.insert(search_id.clone(), search);

        out.push(self.reply(None, Some(search_id.as_str()), Some(("0", goal.as_str()))));
        out
    }

    fn run_tac(&mut self, search_id: &str, state_id: &str, tactic: &str) -> Vec<String> {
        self.pending_delay = self.delays.get(tactic).copied();
        let tagged = self.tag_errors.then_some(search_id);
        let Some(goal) = self
            .searches
            .get(search_id)
            .and_then(|s| s.states.get(state_id))
            .cloned()
        else {
            return vec![self.reply(Some("unknown search_id or tactic_state_id"), tagged, None)];
        };

        let outcome = self
            .any_goal
            .get(tactic)
            .or_else(|| self.outcomes.get(&(goal, tactic.to_string())))
            .cloned()
            .unwrap_or_else(|| Outcome::Fail(format!("unknown tactic '{tactic}'")));

        match outcome {
            Outcome::Next(next) => {
                let Some(search) = self.searches.get_mut(search_id) else {
                    return Vec::new();
                };
                let next_id = search.next_state.to_string();
                search.next_state += 1;
                search.states.insert(next_id.clone(), next.clone());
                vec![self.reply(None, Some(search_id), Some((next_id.as_str(), next.as_str())))]
            }
            Outcome::Fail(error) => {
                let error = format!("gen_tac_and_capture_res_failed: msg={error}");
                vec![self.reply(Some(error.as_str()), tagged, None)]
            }
            Outcome::Raw(line) => vec![line],
            Outcome::Silent => Vec::new(),
        }
    }

    fn clear_search(&mut self, search_id: &str) -> Vec<String> {
        let mut out: Vec<String> = (0..self.teardown_noise)
            .map(|i| self.reply(None, Some(search_id), Some((i.to_string().as_str(), "⊢ stale"))))
            .collect();

        let error = match (&self.teardown_error, self.searches.remove(search_id)) {
            (Some(error), _) => Some(error.clone()),
            (None, None) => Some(format!("unknown search_id {search_id}")),
            (None, Some(_)) => None,
        };
        out.push(self.reply(error.as_deref(), None, None));
        out
    }
}

/// Test-side view of a running [`FakeLeanGym`].
pub struct FakeGymHandle {
    commands: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeGymHandle {
    /// Every command line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of received commands with the given name.
    pub fn count(&self, name: &str) -> usize {
        let prefix = format!("[\"{name}\"");
        self.commands()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Stop the fake, closing its end of the pipe as if the process died.
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
