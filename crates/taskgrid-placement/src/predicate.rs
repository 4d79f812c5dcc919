//! Hard placement constraints.
//!
//! A predicate rejects a worker outright; only workers passing every
//! predicate are scored.

use taskgrid_state::{Task, Worker};

/// A hard constraint: `true` if the worker can take the task.
pub type Predicate = fn(&Worker, &Task) -> bool;

/// The predicates every backend applies unless it brings its own.
pub const DEFAULT_PREDICATES: &[Predicate] = &[
    schedulable,
    cpu_fits,
    ram_fits,
    disk_fits,
    zone_matches,
    ports_free,
    requirements_met,
];

/// Dead and gone workers never receive work.
pub fn schedulable(worker: &Worker, _task: &Task) -> bool {
    worker.state.is_schedulable()
}

pub fn cpu_fits(worker: &Worker, task: &Task) -> bool {
    worker.available.cpu_cores >= task.resources.cpu_cores
}

pub fn ram_fits(worker: &Worker, task: &Task) -> bool {
    worker.available.ram_gb >= task.resources.ram_gb
}

pub fn disk_fits(worker: &Worker, task: &Task) -> bool {
    worker.available.disk_gb >= task.resources.disk_gb
}

/// A task listing zones only runs in one of them.
pub fn zone_matches(worker: &Worker, task: &Task) -> bool {
    if task.resources.zones.is_empty() {
        return true;
    }
    worker
        .zone
        .as_ref()
        .is_some_and(|zone| task.resources.zones.iter().any(|z| z == zone))
}

/// Ports are taken when the worker reports them bound, and also when an
/// assigned task that has not finished claims them. The latter covers
/// assignments the worker has not started yet.
pub fn ports_free(worker: &Worker, task: &Task) -> bool {
    let claimed: Vec<u16> = worker
        .tasks
        .values()
        .filter(|assigned| !assigned.state.is_terminal())
        .flat_map(|assigned| assigned.executors.iter())
        .flat_map(|executor| executor.ports.iter().copied())
        .collect();
    task.ports()
        .all(|port| !worker.active_ports.contains(&port) && !claimed.contains(&port))
}

/// Every `require:<key>` tag must appear in the worker's metadata with the
/// same value.
pub fn requirements_met(worker: &Worker, task: &Task) -> bool {
    task.requirements()
        .all(|(key, value)| worker.metadata.get(key).is_some_and(|v| v == value))
}

/// True if the worker passes every predicate.
pub fn matches(worker: &Worker, task: &Task, predicates: &[Predicate]) -> bool {
    predicates.iter().all(|p| p(worker, task))
}

/// The workers from `workers` that can take `task`, in input order.
pub fn candidates(task: &Task, workers: &[Worker], predicates: &[Predicate]) -> Vec<Worker> {
    workers
        .iter()
        .filter(|w| matches(w, task, predicates))
        .cloned()
        .collect()
}
