use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheStats, TacticCache};
use crate::channel::{LineChannel, MessagePump};
use crate::process::GymProcess;
use crate::protocol::{GymReply, GymRequest};
use crate::search::{ProofSearch, ProofStateNode, SearchStore};
use crate::types::{LeanGymConfig, LeanGymError, SearchId, StateId};

/// Output lean-gym still owes for a read that gave up waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owed {
    /// One reply, possibly after warning lines.
    Reply,
    /// The rest of a `clear_search` exchange, up to its terminal reply.
    Teardown,
}

/// A lean-gym process plus the client-side model of every search open on it.
///
/// Commands go out on the caller's task; replies come from a background
/// pump through a queue. All methods take `&mut self`: an instance has a
/// single logical owner, and callers sharing one across tasks must wrap it
/// in a mutex.
///
/// Once [`kill`](Self::kill) has run, or a write to the process has failed,
/// every command returns an error.
///
/// lean-gym answers commands strictly in order. When a read times out, the
/// output it was waiting for is remembered and discarded as it shows up, so a
/// late reply is never taken for the answer to a later command.
pub struct LeanInstance {
    config: LeanGymConfig,
    channel: LineChannel,
    messages: UnboundedReceiver<String>,
    pump: Option<MessagePump>,
    process: Option<GymProcess>,
    store: SearchStore,
    cache: TacticCache,
    last_command: String,
    backlog: VecDeque<Owed>,
    killed: bool,
}

impl LeanInstance {
    /// Launch lean-gym and start pumping its output.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(config: LeanGymConfig) -> Result<Self, LeanGymError> {
        let (process, stdin, stdout) = GymProcess::spawn(&config)?;
        let mut instance = Self::from_io(stdout, stdin, config);
        instance.process = Some(process);
        tracing::info!(
            pid = instance.process.as_ref().and_then(GymProcess::id),
            "lean-gym instance started"
        );
        Ok(instance)
    }

    /// Build an instance over arbitrary byte streams instead of a child process.
    ///
    /// `reader` carries lean-gym's replies, `writer` receives commands.
    /// Must be called from within a Tokio runtime.
    pub fn from_io<R, W>(reader: R, writer: W, config: LeanGymConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (pump, messages) = MessagePump::start(reader, CancellationToken::new());
        Self {
            config,
            channel: LineChannel::new(writer),
            messages,
            pump: Some(pump),
            process: None,
            store: SearchStore::new(),
            cache: TacticCache::new(),
            last_command: String::new(),
            backlog: VecDeque::new(),
            killed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Open a proof search for `declaration`.
    ///
    /// lean-gym may print diagnostic warnings before the reply; those lines
    /// are skipped. A reply with an error is returned as-is and opens nothing.
    pub async fn init_search(&mut self, declaration: &str) -> Result<GymReply, LeanGymError> {
        self.send(&GymRequest::InitSearch {
            declaration: declaration.to_string(),
        })
        .await?;

        let mut line = self.get_message(None, Owed::Reply).await?;
        while line.contains("warning:") {
            tracing::debug!(declaration, line = line.trim_end(), "Skipping lean-gym warning");
            line = self.get_message(None, Owed::Reply).await?;
        }
        self.log_traffic("recv", &line);
        let reply = GymReply::parse(line.trim())?;

        if let Some(error) = &reply.error {
            tracing::info!(declaration, error = error.as_str(), "init_search failed");
            return Ok(reply);
        }

        let search_id = reply.search_id.clone().ok_or_else(|| {
            LeanGymError::Protocol(format!("init_search reply without search_id: {reply:?}"))
        })?;
        let (root, text) = reply.success_state()?;
        self.store.insert(ProofSearch::new(
            search_id.clone(),
            declaration,
            root.clone(),
            text,
        ))?;

        tracing::info!(%search_id, root = %root, declaration, "Opened proof search");
        Ok(reply)
    }

    /// Apply `tactic` to `state_id` of an open search.
    ///
    /// An edge explored before is answered from the local graph without
    /// contacting lean-gym. A tactic lean-gym rejects is not an error: the
    /// reply carries it in `error`.
    pub async fn run_stmt(
        &mut self,
        search_id: &SearchId,
        state_id: &StateId,
        tactic: &str,
    ) -> Result<GymReply, LeanGymError> {
        self.ensure_usable()?;
        self.store.require_state(search_id, state_id)?;

        let search = self.store.require(search_id)?;
        if let Some(reply) = self.cache.lookup(search, state_id, tactic) {
            return Ok(reply);
        }

        self.send(&GymRequest::RunTac {
            search_id: search_id.clone(),
            state_id: state_id.clone(),
            tactic: tactic.to_string(),
        })
        .await?;
        let reply = self.get_result(None).await?;

        if let Some(replied) = &reply.search_id {
            if replied != search_id {
                return Err(LeanGymError::Protocol(format!(
                    "run_tac for search {search_id} answered for search {replied}"
                )));
            }
        }

        self.store
            .update_proof_search(search_id, state_id, tactic, &reply)?;
        Ok(reply)
    }

    /// Apply one tactic in each of several distinct searches.
    ///
    /// Commands are written back to back without waiting, then the replies
    /// are matched to their search by the `search_id` they carry, in
    /// whatever order they arrive. Cached edges are answered locally.
    /// A search whose reply never turns up counts as a failed application.
    pub async fn run_batch(
        &mut self,
        search_ids: &[SearchId],
        state_ids: &[StateId],
        tactics: &[String],
    ) -> Result<HashMap<SearchId, GymReply>, LeanGymError> {
        self.ensure_usable()?;
        if search_ids.len() != state_ids.len() || search_ids.len() != tactics.len() {
            return Err(LeanGymError::InvalidBatch(format!(
                "got {} search ids, {} state ids and {} tactics",
                search_ids.len(),
                state_ids.len(),
                tactics.len()
            )));
        }
        let mut seen = HashSet::with_capacity(search_ids.len());
        for search_id in search_ids {
            if !seen.insert(search_id) {
                return Err(LeanGymError::InvalidBatch(format!(
                    "search {search_id} appears more than once; a search cannot run tactics concurrently"
                )));
            }
        }
        for (search_id, state_id) in search_ids.iter().zip(state_ids) {
            self.store.require_state(search_id, state_id)?;
        }

        let mut output = HashMap::with_capacity(search_ids.len());
        let mut pending: HashMap<SearchId, (StateId, String)> = HashMap::new();
        let mut requests = Vec::new();
        for ((search_id, state_id), tactic) in search_ids.iter().zip(state_ids).zip(tactics) {
            let search = self.store.require(search_id)?;
            if let Some(reply) = self.cache.lookup(search, state_id, tactic) {
                output.insert(search_id.clone(), reply);
                continue;
            }
            pending.insert(search_id.clone(), (state_id.clone(), tactic.clone()));
            requests.push(GymRequest::RunTac {
                search_id: search_id.clone(),
                state_id: state_id.clone(),
                tactic: tactic.clone(),
            });
        }

        for request in &requests {
            self.send(request).await?;
        }

        let mut uncorrelated = Vec::new();
        for _ in 0..requests.len() {
            let reply = self.get_result(None).await?;
            let Some(search_id) = reply.search_id.clone() else {
                tracing::debug!(error = ?reply.error, "Batch reply without search_id");
                uncorrelated.push(reply);
                continue;
            };
            let (state_id, tactic) = pending.remove(&search_id).ok_or_else(|| {
                LeanGymError::Protocol(format!(
                    "batch reply for search {search_id} which has no pending command"
                ))
            })?;
            self.store
                .update_proof_search(&search_id, &state_id, &tactic, &reply)?;
            output.insert(search_id, reply);
        }

        // N commands produce N replies, so a single leftover reply can only
        // belong to a single leftover search.
        if pending.len() == 1 && uncorrelated.len() == 1 && uncorrelated[0].is_error() {
            if let (Some((search_id, (state_id, tactic))), Some(reply)) =
                (pending.drain().next(), uncorrelated.pop())
            {
                let reply = GymReply {
                    search_id: Some(search_id.clone()),
                    ..reply
                };
                self.store
                    .update_proof_search(&search_id, &state_id, &tactic, &reply)?;
                output.insert(search_id, reply);
            }
        }

        for reply in &uncorrelated {
            tracing::warn!(
                error = reply.error.as_deref().unwrap_or("<none>"),
                "Discarding batch reply that matches no search"
            );
        }
        for (search_id, (state_id, tactic)) in pending {
            tracing::warn!(
                %search_id,
                %state_id,
                tactic = tactic.as_str(),
                "No batch reply matched search"
            );
            let message = "no reply correlated with this search";
            self.store.record_unanswered(&search_id, &tactic, message)?;
            output.insert(search_id.clone(), GymReply::failure(search_id, message));
        }

        Ok(output)
    }

    /// Close a search in lean-gym and drop it from the store.
    ///
    /// lean-gym may emit any number of stale replies before the one that ends
    /// the exchange; those are drained. If the final reply carries an error,
    /// the search is still dropped and the error is returned.
    pub async fn clear_search(&mut self, search_id: &SearchId) -> Result<GymReply, LeanGymError> {
        self.ensure_usable()?;
        self.store.require(search_id)?;

        self.send(&GymRequest::ClearSearch {
            search_id: search_id.clone(),
        })
        .await?;

        let reply = match self.drain_teardown(search_id).await {
            Ok(reply) => reply,
            Err(e @ LeanGymError::Protocol(_)) => {
                self.store.remove(search_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        self.store.remove(search_id);

        if let Some(message) = reply.error.clone() {
            tracing::warn!(%search_id, error = message.as_str(), "clear_search failed");
            return Err(LeanGymError::Teardown {
                search_id: search_id.clone(),
                message,
            });
        }

        tracing::info!(%search_id, open_searches = self.store.len(), "Cleared proof search");
        Ok(reply)
    }

    /// Read replies until one without any state arrives.
    ///
    /// Whether that shape is the only way lean-gym ends a teardown is not
    /// documented, so draining is bounded by `max_teardown_messages`.
    async fn drain_teardown(&mut self, search_id: &SearchId) -> Result<GymReply, LeanGymError> {
        let mut reply = self.read_reply(None, Owed::Teardown).await?;
        let mut drained = 0usize;

        while !reply.is_terminal() {
            match &reply.search_id {
                Some(other) if other != search_id => tracing::warn!(
                    %search_id,
                    other = %other,
                    "Skipping reply for another search during clear_search"
                ),
                _ => tracing::trace!(%search_id, "Skipping non-terminal clear_search reply"),
            }

            drained += 1;
            if drained > self.config.max_teardown_messages {
                // The rest of this exchange is skipped ahead of the next reply.
                self.backlog.push_back(Owed::Teardown);
                return Err(LeanGymError::Protocol(format!(
                    "clear_search for {search_id} produced more than {} replies without a terminal one",
                    self.config.max_teardown_messages
                )));
            }
            let budget = self.config.clear_timeout();
            reply = self.read_reply(Some(budget), Owed::Teardown).await?;
        }

        if drained > 0 {
            tracing::debug!(%search_id, drained, "Drained clear_search replies");
        }
        Ok(reply)
    }

    /// Stop lean-gym and the pump. Idempotent; no command succeeds afterwards.
    pub async fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        self.channel.shutdown().await;
        if let Some(mut process) = self.process.take() {
            process.terminate(self.config.kill_grace()).await;
        }
        if let Some(pump) = self.pump.take() {
            pump.stop().await;
        }
        tracing::info!(open_searches = self.store.len(), "lean-gym instance killed");
    }

    // -----------------------------------------------------------------------
    // Wire
    // -----------------------------------------------------------------------

    /// Read the next reply, waiting at most `timeout` (the configured read
    /// timeout when `None`).
    ///
    /// Output still owed for earlier timed-out reads is skipped first.
    pub async fn get_result(&mut self, timeout: Option<Duration>) -> Result<GymReply, LeanGymError> {
        self.read_reply(timeout, Owed::Reply).await
    }

    async fn read_reply(
        &mut self,
        timeout: Option<Duration>,
        owed: Owed,
    ) -> Result<GymReply, LeanGymError> {
        let line = self.get_message(timeout, owed).await?;
        self.log_traffic("recv", &line);
        GymReply::parse(line.trim())
    }

    /// Next line meant for the current command.
    ///
    /// On timeout, `owed` is queued on the backlog so the output that was
    /// waited for is discarded once it arrives.
    async fn get_message(
        &mut self,
        timeout: Option<Duration>,
        owed: Owed,
    ) -> Result<String, LeanGymError> {
        if self.killed {
            return Err(LeanGymError::Killed);
        }
        let budget = timeout.unwrap_or_else(|| self.config.timeout());
        let deadline = Instant::now() + budget;

        loop {
            let line = match tokio::time::timeout_at(deadline, self.messages.recv()).await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(LeanGymError::Transport("lean-gym output stream closed".into()))
                }
                Err(_) => {
                    self.backlog.push_back(owed);
                    tracing::warn!(
                        timeout_ms = budget.as_millis() as u64,
                        command = self.last_command.as_str(),
                        backlog = self.backlog.len(),
                        "lean-gym command timed out"
                    );
                    return Err(LeanGymError::Timeout {
                        elapsed: budget,
                        command: self.last_command.clone(),
                    });
                }
            };

            match self.backlog.front().copied() {
                None => return Ok(line),
                Some(stale) => self.discard_stale(stale, &line),
            }
        }
    }

    /// Consume one line of output owed to an earlier command.
    fn discard_stale(&mut self, stale: Owed, line: &str) {
        let settled = match stale {
            Owed::Reply => !line.contains("warning:"),
            Owed::Teardown => GymReply::parse(line.trim()).is_ok_and(|r| r.is_terminal()),
        };
        if settled {
            self.backlog.pop_front();
        }
        tracing::debug!(
            ?stale,
            settled,
            line = line.trim_end(),
            "Discarding late lean-gym output"
        );
    }

    async fn send(&mut self, request: &GymRequest) -> Result<(), LeanGymError> {
        self.ensure_usable()?;
        let json = request
            .to_json()
            .map_err(|e| LeanGymError::Protocol(format!("Serialization error: {e}")))?;
        self.log_traffic("send", &json);
        self.last_command = json;
        self.channel.write_line(&self.last_command).await
    }

    fn ensure_usable(&self) -> Result<(), LeanGymError> {
        if self.killed {
            return Err(LeanGymError::Killed);
        }
        if self.channel.is_closed() {
            return Err(LeanGymError::Transport(
                "lean-gym input is closed; rebuild the instance".into(),
            ));
        }
        Ok(())
    }

    fn log_traffic(&self, direction: &'static str, line: &str) {
        let line = line.trim_end();
        match self.config.verbose {
            0 => tracing::trace!(direction, line, "lean-gym traffic"),
            1 => tracing::debug!(direction, line, "lean-gym traffic"),
            _ => tracing::info!(direction, line, "lean-gym traffic"),
        }
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    /// A state node of an open search.
    pub fn get_state(
        &self,
        search_id: &SearchId,
        state_id: &StateId,
    ) -> Result<&ProofStateNode, LeanGymError> {
        self.store.require_state(search_id, state_id)
    }

    /// Tactics already explored from a state, with the state each one led to.
    pub fn get_tactic_after(
        &self,
        search_id: &SearchId,
        state_id: &StateId,
    ) -> Result<&HashMap<String, StateId>, LeanGymError> {
        Ok(&self.store.require_state(search_id, state_id)?.outgoing)
    }

    pub fn search(&self, search_id: &SearchId) -> Option<&ProofSearch> {
        self.store.get(search_id)
    }

    pub fn search_ids(&self) -> Vec<SearchId> {
        self.store.search_ids().cloned().collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn config(&self) -> &LeanGymConfig {
        &self.config
    }

    /// The last command written, as sent on the wire.
    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    /// Whether commands can still be issued. False after `kill`, after a
    /// failed write, or once lean-gym's output has ended.
    pub fn is_alive(&self) -> bool {
        !self.killed
            && !self.channel.is_closed()
            && self.pump.as_ref().is_some_and(|p| !p.is_finished())
    }
}
