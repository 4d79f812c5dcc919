//! Offers and offer selection.
//!
//! An offer proposes one worker for one task. Offers for capacity that
//! does not exist yet carry an accept callback; the scheduling loop runs it
//! (bounded by a timeout) before the assignment is persisted.

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;

use taskgrid_state::{Task, Worker};
use tracing::debug;

use crate::predicate::{Predicate, candidates};
use crate::scorer::{Scores, Weights, default_scores};

type BoxFuture =
    std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

/// Provisioning hook run once when an offer is taken.
pub type AcceptFn = Box<dyn FnOnce() -> BoxFuture + Send>;

pub struct Offer {
    pub worker: Worker,
    pub scores: Scores,
    pub accept: Option<AcceptFn>,
}

impl Offer {
    pub fn new(worker: Worker, scores: Scores) -> Self {
        Self {
            worker,
            scores,
            accept: None,
        }
    }

    /// Attach a provisioning step that must succeed before assignment.
    pub fn with_accept<F, Fut>(mut self, accept: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.accept = Some(Box::new(move || -> BoxFuture { Box::pin(accept()) }));
        self
    }
}

impl fmt::Debug for Offer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Offer")
            .field("worker", &self.worker.id)
            .field("scores", &self.scores)
            .field("accept", &self.accept.is_some())
            .finish()
    }
}

/// Matching workers with their scores and weighted value, best first.
///
/// The sort is stable: among equal values the input order decides.
pub fn rank_candidates(
    task: &Task,
    workers: &[Worker],
    predicates: &[Predicate],
    weights: &Weights,
) -> Vec<(Worker, Scores, f64)> {
    let mut ranked: Vec<(Worker, Scores, f64)> = candidates(task, workers, predicates)
        .into_iter()
        .map(|worker| {
            let scores = default_scores(&worker, task);
            let value = scores.weighted(weights);
            (worker, scores, value)
        })
        .collect();
    ranked.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal));
    ranked
}

/// The best offer for `task` among `workers`, or `None` if nothing matches.
pub fn select_offer(
    task: &Task,
    workers: &[Worker],
    predicates: &[Predicate],
    weights: &Weights,
) -> Option<Offer> {
    let (worker, scores, value) = rank_candidates(task, workers, predicates, weights)
        .into_iter()
        .next()?;
    debug!(task_id = %task.id, worker_id = %worker.id, value, "offer selected");
    Some(Offer::new(worker, scores))
}
