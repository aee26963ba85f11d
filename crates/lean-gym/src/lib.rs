//! Async client for the lean-gym REPL.
//!
//! This crate drives a long-lived lean-gym process over newline-delimited
//! JSON and keeps, on the client side, the graph of proof states every open
//! search has reached. Explored edges double as a cache, so replaying a
//! tactic from a known state never goes back to Lean.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use lean_gym::{LeanGymConfig, LeanInstance, SearchId, StateId};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LeanGymConfig::new("/path/to/lean-gym");
//! let mut lean = LeanInstance::spawn(config)?;
//!
//! let reply = lean.init_search("int.prime.dvd_mul").await?;
//! let search_id = reply.search_id.clone().expect("search opened");
//! let root = reply.tactic_state_id.clone().expect("root state");
//!
//! let step = lean.run_stmt(&search_id, &root, "intros").await?;
//! if step.is_done() {
//!     println!("proved");
//! }
//!
//! lean.clear_search(&search_id).await?;
//! lean.kill().await;
//! # Ok(())
//! # }
//! ```
//!
//! Independent searches can be advanced together with
//! [`LeanInstance::run_batch`], which pipelines the commands and matches
//! replies back to their search by id:
//!
//! ```rust,no_run
//! # use lean_gym::{LeanInstance, SearchId, StateId};
//! # async fn example(lean: &mut LeanInstance) -> Result<(), lean_gym::LeanGymError> {
//! let replies = lean
//!     .run_batch(
//!         &[SearchId::from("0"), SearchId::from("2")],
//!         &[StateId::from("0"), StateId::from("0")],
//!         &["simp".to_string(), "norm_num".to_string()],
//!     )
//!     .await?;
//! for (search_id, reply) in &replies {
//!     println!("{search_id}: reward {}", reply.reward());
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod channel;
pub mod env;
pub mod instance;
pub mod mocks;
pub mod process;
pub mod protocol;
pub mod search;
pub mod types;

pub use cache::{CacheStats, TacticCache};
pub use env::{Action, LeanEnv, Observation, Step};
pub use instance::LeanInstance;
pub use protocol::{GymReply, GymRequest, NO_GOALS};
pub use search::{ProofSearch, ProofStateNode, SearchStore};
pub use types::{LeanGymConfig, LeanGymError, SearchId, StateId};
