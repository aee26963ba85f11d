use std::collections::HashMap;

use crate::protocol::{GymReply, NO_GOALS};
use crate::types::{LeanGymError, SearchId, StateId};

/// A node in a search's state graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStateNode {
    pub state_id: StateId,
    /// Remaining goals as lean-gym prints them.
    pub text: String,
    /// States this one was reached from, without duplicates, in discovery order.
    pub predecessors: Vec<StateId>,
    /// Explored edges: tactic text to the state it produced.
    pub outgoing: HashMap<String, StateId>,
}

impl ProofStateNode {
    fn new(state_id: StateId, text: String, predecessors: Vec<StateId>) -> Self {
        Self {
            state_id,
            text,
            predecessors,
            outgoing: HashMap::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.predecessors.is_empty()
    }

    pub fn is_proof_complete(&self) -> bool {
        self.text == NO_GOALS
    }
}

/// One proof search: the declaration being proved and every state reached so far.
///
/// States only ever come from the bootstrap reply or a successful tactic
/// application, and are dropped together with the search.
#[derive(Debug, Clone)]
pub struct ProofSearch {
    search_id: SearchId,
    declaration: String,
    root: StateId,
    states: HashMap<StateId, ProofStateNode>,
    failed_tactics: HashMap<String, String>,
    total_tactic_count: u64,
    failed_tactic_count: u64,
}

impl ProofSearch {
    /// Create a search holding only its root state.
    pub fn new(
        search_id: SearchId,
        declaration: impl Into<String>,
        root: StateId,
        root_text: impl Into<String>,
    ) -> Self {
        let mut states = HashMap::new();
        states.insert(
            root.clone(),
            ProofStateNode::new(root.clone(), root_text.into(), Vec::new()),
        );
        Self {
            search_id,
            declaration: declaration.into(),
            root,
            states,
            failed_tactics: HashMap::new(),
            total_tactic_count: 0,
            failed_tactic_count: 0,
        }
    }

    pub fn search_id(&self) -> &SearchId {
        &self.search_id
    }

    pub fn declaration(&self) -> &str {
        &self.declaration
    }

    pub fn root(&self) -> &ProofStateNode {
        &self.states[&self.root]
    }

    pub fn state(&self, state_id: &StateId) -> Option<&ProofStateNode> {
        self.states.get(state_id)
    }

    pub fn states(&self) -> impl Iterator<Item = &ProofStateNode> {
        self.states.values()
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Last error seen for each failed tactic, from whichever state it was tried.
    pub fn failed_tactics(&self) -> &HashMap<String, String> {
        &self.failed_tactics
    }

    pub fn total_tactic_count(&self) -> u64 {
        self.total_tactic_count
    }

    pub fn failed_tactic_count(&self) -> u64 {
        self.failed_tactic_count
    }

    /// The state an explored edge leads to, if `tactic` was already applied
    /// successfully from `state_id`.
    pub fn next_state(&self, state_id: &StateId, tactic: &str) -> Option<&ProofStateNode> {
        let next_id = self.states.get(state_id)?.outgoing.get(tactic)?;
        self.states.get(next_id)
    }

    /// Whether any reached state has no goals left.
    pub fn is_proved(&self) -> bool {
        self.states.values().any(ProofStateNode::is_proof_complete)
    }

    /// Fold a tactic reply into the graph.
    ///
    /// Success adds the edge `prior --tactic--> next` and creates or merges
    /// `next`. Failure only touches the counters and `failed_tactics`.
    /// Both count toward `total_tactic_count`.
    pub fn apply_reply(
        &mut self,
        prior: &StateId,
        tactic: &str,
        reply: &GymReply,
    ) -> Result<(), LeanGymError> {
        if let Some(error) = &reply.error {
            self.record_failure(tactic, error.clone());
            return Ok(());
        }

        let (next_id, text) = reply.success_state()?;
        let prior_node = self
            .states
            .get_mut(prior)
            .ok_or_else(|| LeanGymError::UnknownState {
                search_id: self.search_id.clone(),
                state_id: prior.clone(),
            })?;
        prior_node
            .outgoing
            .insert(tactic.to_string(), next_id.clone());

        match self.states.get_mut(next_id) {
            Some(existing) => {
                // Edges back into the root or onto the same state leave no
                // predecessor: the root stays the only state without one.
                if existing.state_id != *prior
                    && existing.state_id != self.root
                    && !existing.predecessors.contains(prior)
                {
                    existing.predecessors.push(prior.clone());
                }
                existing.text = text.to_string();
            }
            None => {
                self.states.insert(
                    next_id.clone(),
                    ProofStateNode::new(next_id.clone(), text.to_string(), vec![prior.clone()]),
                );
            }
        }

        self.total_tactic_count += 1;
        Ok(())
    }

    /// Count a failed application without touching any state.
    pub fn record_failure(&mut self, tactic: &str, message: String) {
        self.failed_tactic_count += 1;
        self.total_tactic_count += 1;
        self.failed_tactics.insert(tactic.to_string(), message);
    }

    /// Count an application lean-gym never answered. An error already
    /// recorded for the tactic is kept.
    pub fn record_unanswered(&mut self, tactic: &str, message: &str) {
        self.failed_tactic_count += 1;
        self.total_tactic_count += 1;
        self.failed_tactics
            .entry(tactic.to_string())
            .or_insert_with(|| message.to_string());
    }
}

/// Every proof search currently open on one lean-gym instance.
#[derive(Debug, Default)]
pub struct SearchStore {
    searches: HashMap<SearchId, ProofSearch>,
}

impl SearchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly bootstrapped search.
    ///
    /// lean-gym never reuses an id while it is open, so a collision means the
    /// client and the process disagree about which searches exist.
    pub fn insert(&mut self, search: ProofSearch) -> Result<(), LeanGymError> {
        if self.searches.contains_key(search.search_id()) {
            return Err(LeanGymError::Protocol(format!(
                "lean-gym returned search id {} which is already open",
                search.search_id()
            )));
        }
        self.searches.insert(search.search_id().clone(), search);
        Ok(())
    }

    pub fn get(&self, search_id: &SearchId) -> Option<&ProofSearch> {
        self.searches.get(search_id)
    }

    pub fn get_mut(&mut self, search_id: &SearchId) -> Option<&mut ProofSearch> {
        self.searches.get_mut(search_id)
    }

    /// Look up a search, failing with [`LeanGymError::UnknownSearch`].
    pub fn require(&self, search_id: &SearchId) -> Result<&ProofSearch, LeanGymError> {
        self.get(search_id)
            .ok_or_else(|| LeanGymError::UnknownSearch(search_id.clone()))
    }

    /// Look up a state, failing with `UnknownSearch` or `UnknownState`.
    pub fn require_state(
        &self,
        search_id: &SearchId,
        state_id: &StateId,
    ) -> Result<&ProofStateNode, LeanGymError> {
        self.require(search_id)?
            .state(state_id)
            .ok_or_else(|| LeanGymError::UnknownState {
                search_id: search_id.clone(),
                state_id: state_id.clone(),
            })
    }

    pub fn remove(&mut self, search_id: &SearchId) -> Option<ProofSearch> {
        self.searches.remove(search_id)
    }

    pub fn contains(&self, search_id: &SearchId) -> bool {
        self.searches.contains_key(search_id)
    }

    pub fn search_ids(&self) -> impl Iterator<Item = &SearchId> {
        self.searches.keys()
    }

    pub fn len(&self) -> usize {
        self.searches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.searches.is_empty()
    }

    /// The single entry point for mutating a search graph after a tactic reply.
    pub fn update_proof_search(
        &mut self,
        search_id: &SearchId,
        prior: &StateId,
        tactic: &str,
        reply: &GymReply,
    ) -> Result<(), LeanGymError> {
        self.searches
            .get_mut(search_id)
            .ok_or_else(|| LeanGymError::UnknownSearch(search_id.clone()))?
            .apply_reply(prior, tactic, reply)
    }

    /// Count a tactic whose reply never matched, as a failure.
    pub fn record_unanswered(
        &mut self,
        search_id: &SearchId,
        tactic: &str,
        message: &str,
    ) -> Result<(), LeanGymError> {
        self.searches
            .get_mut(search_id)
            .ok_or_else(|| LeanGymError::UnknownSearch(search_id.clone()))?
            .record_unanswered(tactic, message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sid(s: &str) -> SearchId {
        SearchId::from(s)
    }

    fn st(s: &str) -> StateId {
        StateId::from(s)
    }

    fn ok(search: &str, state: &str, text: &str) -> GymReply {
        GymReply::cached(sid(search), st(state), text.to_string())
    }

    fn store_with_root() -> SearchStore {
        let mut store = SearchStore::new();
        store
            .insert(ProofSearch::new(sid("0"), "thm1", st("0"), "⊢ P"))
            .unwrap();
        store
    }

    #[test]
    fn new_search_has_single_root() {
        let store = store_with_root();
        let search = store.get(&sid("0")).unwrap();

        assert_eq!(search.declaration(), "thm1");
        assert_eq!(search.num_states(), 1);
        assert!(search.root().is_root());
        assert_eq!(search.root().text, "⊢ P");
        assert!(search.root().outgoing.is_empty());
        assert_eq!(search.total_tactic_count(), 0);
    }

    #[test]
    fn success_adds_edge_and_state() {
        let mut store = store_with_root();
        store
            .update_proof_search(&sid("0"), &st("0"), "exact proof_of_P", &ok("0", "1", NO_GOALS))
            .unwrap();

        let search = store.get(&sid("0")).unwrap();
        let next = search.state(&st("1")).unwrap();
        assert_eq!(next.predecessors, vec![st("0")]);
        assert!(next.is_proof_complete());
        assert_eq!(search.root().outgoing.get("exact proof_of_P"), Some(&st("1")));
        assert!(search.is_proved());
        assert_eq!(search.total_tactic_count(), 1);
        assert_eq!(search.failed_tactic_count(), 0);
    }

    #[test]
    fn failure_records_error_without_touching_states() {
        let mut store = store_with_root();
        let reply = GymReply::failure(sid("0"), "unknown identifier 'foo'");
        store
            .update_proof_search(&sid("0"), &st("0"), "exact foo", &reply)
            .unwrap();

        let search = store.get(&sid("0")).unwrap();
        assert_eq!(search.num_states(), 1);
        assert!(search.root().outgoing.is_empty());
        assert_eq!(search.failed_tactic_count(), 1);
        assert_eq!(search.total_tactic_count(), 1);
        assert_eq!(
            search.failed_tactics().get("exact foo").map(String::as_str),
            Some("unknown identifier 'foo'")
        );
    }

    #[test]
    fn failed_tactics_keeps_last_error() {
        let mut store = store_with_root();
        for msg in ["first", "second"] {
            store
                .update_proof_search(&sid("0"), &st("0"), "simp", &GymReply::failure(sid("0"), msg))
                .unwrap();
        }
        let search = store.get(&sid("0")).unwrap();
        assert_eq!(search.failed_tactics()["simp"], "second");
        assert_eq!(search.failed_tactic_count(), 2);
    }

    #[test]
    fn merging_paths_forms_a_dag() {
        let mut store = store_with_root();
        store
            .update_proof_search(&sid("0"), &st("0"), "intro h", &ok("0", "1", "h : P ⊢ Q"))
            .unwrap();
        store
            .update_proof_search(&sid("0"), &st("0"), "intros", &ok("0", "2", "h : P ⊢ Q"))
            .unwrap();
        // Both reach state 3.
        store
            .update_proof_search(&sid("0"), &st("1"), "simp", &ok("0", "3", "⊢ R"))
            .unwrap();
        store
            .update_proof_search(&sid("0"), &st("2"), "simp", &ok("0", "3", "⊢ R'"))
            .unwrap();

        let search = store.get(&sid("0")).unwrap();
        let merged = search.state(&st("3")).unwrap();
        assert_eq!(merged.predecessors, vec![st("1"), st("2")]);
        assert_eq!(merged.text, "⊢ R'");
    }

    #[test]
    fn repeated_edge_does_not_duplicate_predecessor() {
        let mut store = store_with_root();
        for _ in 0..3 {
            store
                .update_proof_search(&sid("0"), &st("0"), "intro", &ok("0", "1", "⊢ Q"))
                .unwrap();
        }
        let search = store.get(&sid("0")).unwrap();
        assert_eq!(search.state(&st("1")).unwrap().predecessors, vec![st("0")]);
        assert_eq!(search.total_tactic_count(), 3);
    }

    #[test]
    fn edge_back_to_root_keeps_root_a_root() {
        let mut store = store_with_root();
        store
            .update_proof_search(&sid("0"), &st("0"), "intro h", &ok("0", "1", "h : Q ⊢ P"))
            .unwrap();
        store
            .update_proof_search(&sid("0"), &st("1"), "revert h", &ok("0", "0", "⊢ P"))
            .unwrap();

        let search = store.get(&sid("0")).unwrap();
        assert!(search.root().is_root());
        assert_eq!(search.states().filter(|n| n.is_root()).count(), 1);
        assert_eq!(search.state(&st("1")).unwrap().outgoing["revert h"], st("0"));
        assert_eq!(search.total_tactic_count(), 2);
    }

    #[test]
    fn unanswered_tactic_keeps_real_error() {
        let mut store = store_with_root();
        store
            .update_proof_search(
                &sid("0"),
                &st("0"),
                "simp",
                &GymReply::failure(sid("0"), "simp made no progress"),
            )
            .unwrap();
        store
            .record_unanswered(&sid("0"), "simp", "no reply")
            .unwrap();
        store
            .record_unanswered(&sid("0"), "ring", "no reply")
            .unwrap();

        let search = store.get(&sid("0")).unwrap();
        assert_eq!(search.failed_tactics()["simp"], "simp made no progress");
        assert_eq!(search.failed_tactics()["ring"], "no reply");
        assert_eq!(search.failed_tactic_count(), 3);
        assert_eq!(search.total_tactic_count(), 3);
        assert_eq!(search.num_states(), 1);
    }

    #[test]
    fn self_loop_keeps_root_a_root() {
        let mut store = store_with_root();
        store
            .update_proof_search(&sid("0"), &st("0"), "skip", &ok("0", "0", "⊢ P"))
            .unwrap();
        let search = store.get(&sid("0")).unwrap();
        assert!(search.root().is_root());
        assert_eq!(search.root().outgoing["skip"], st("0"));
    }

    #[test]
    fn tree_and_counter_invariants_hold() {
        let mut store = store_with_root();
        let steps: &[(&str, &str, Option<(&str, &str)>)] = &[
            ("0", "intro", Some(("1", "⊢ a"))),
            ("0", "bad", None),
            ("1", "split", Some(("2", "⊢ b"))),
            ("1", "bad", None),
            ("2", "simp", Some(("3", NO_GOALS))),
            ("1", "split", Some(("2", "⊢ b"))),
        ];
        let mut successes = 0;
        for (from, tactic, outcome) in steps {
            let reply = match outcome {
                Some((to, text)) => {
                    successes += 1;
                    ok("0", to, text)
                }
                None => GymReply::failure(sid("0"), "error"),
            };
            store
                .update_proof_search(&sid("0"), &st(from), tactic, &reply)
                .unwrap();
        }

        let search = store.get(&sid("0")).unwrap();
        for node in search.states() {
            if node.state_id == st("0") {
                assert!(node.predecessors.is_empty());
            } else {
                assert!(!node.predecessors.is_empty(), "{:?} has no predecessor", node.state_id);
            }
        }
        assert_eq!(
            search.total_tactic_count(),
            search.failed_tactic_count() + successes
        );
    }

    #[test]
    fn next_state_reads_explored_edges() {
        let mut store = store_with_root();
        store
            .update_proof_search(&sid("0"), &st("0"), "intro", &ok("0", "1", "⊢ Q"))
            .unwrap();
        let search = store.get(&sid("0")).unwrap();

        assert_eq!(search.next_state(&st("0"), "intro").unwrap().text, "⊢ Q");
        assert!(search.next_state(&st("0"), "simp").is_none());
        assert!(search.next_state(&st("9"), "intro").is_none());
    }

    #[test]
    fn success_from_unknown_state_is_rejected() {
        let mut store = store_with_root();
        let err = store
            .update_proof_search(&sid("0"), &st("7"), "intro", &ok("0", "1", "⊢ Q"))
            .unwrap_err();
        assert!(matches!(err, LeanGymError::UnknownState { .. }));
        assert_eq!(store.get(&sid("0")).unwrap().total_tactic_count(), 0);
    }

    #[test]
    fn malformed_success_is_a_protocol_error() {
        let mut store = store_with_root();
        let reply = GymReply {
            tactic_state: None,
            ..ok("0", "1", "")
        };
        let err = store
            .update_proof_search(&sid("0"), &st("0"), "intro", &reply)
            .unwrap_err();
        assert!(matches!(err, LeanGymError::Protocol(_)));
    }

    #[test]
    fn update_unknown_search() {
        let mut store = SearchStore::new();
        let err = store
            .update_proof_search(&sid("5"), &st("0"), "intro", &ok("5", "1", "x"))
            .unwrap_err();
        assert!(matches!(err, LeanGymError::UnknownSearch(_)));
    }

    #[test]
    fn duplicate_search_id_is_rejected() {
        let mut store = store_with_root();
        let err = store
            .insert(ProofSearch::new(sid("0"), "thm2", st("0"), "⊢ Q"))
            .unwrap_err();
        assert!(matches!(err, LeanGymError::Protocol(_)));
        assert_eq!(store.get(&sid("0")).unwrap().declaration(), "thm1");
    }

    #[test]
    fn remove_forgets_search() {
        let mut store = store_with_root();
        assert!(store.remove(&sid("0")).is_some());
        assert!(store.is_empty());
        assert!(matches!(
            store.require(&sid("0")),
            Err(LeanGymError::UnknownSearch(_))
        ));
    }
}
