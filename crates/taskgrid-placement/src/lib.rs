//! taskgrid-placement — the offer engine.
//!
//! Given a task and a list of candidate workers (live workers plus
//! template capacity), decides which worker the task should go to. It does
//! NOT touch the store; backends call into it and the scheduling loop
//! persists the result.
//!
//! # Components
//!
//! - **`predicate`** — hard constraints a worker must satisfy
//! - **`scorer`** — soft metrics and their weighted combination
//! - **`offer`** — offers, accept callbacks, and `select_offer`

pub mod offer;
pub mod predicate;
pub mod scorer;

pub use offer::{AcceptFn, Offer, rank_candidates, select_offer};
pub use predicate::{DEFAULT_PREDICATES, Predicate, candidates, matches};
pub use scorer::{RESOURCE_FIT, STARTUP_COST, Scores, Weights, default_scores};
