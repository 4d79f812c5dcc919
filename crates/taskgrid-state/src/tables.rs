//! redb table definitions for the TaskGrid state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). The queue is ordered by a `u64` sequence number drawn from `META`.

use redb::TableDefinition;

/// Tasks keyed by `{task_id}`.
pub const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

/// Scheduling queue: `{seq}` → `{task_id}`, iterated in key order.
pub const QUEUE: TableDefinition<u64, &str> = TableDefinition::new("queue");

/// Reverse queue index: `{task_id}` → `{seq}`.
pub const QUEUE_INDEX: TableDefinition<&str, u64> = TableDefinition::new("queue_index");

/// Current assignment: `{task_id}` → `{worker_id}`.
pub const TASK_WORKERS: TableDefinition<&str, &str> = TableDefinition::new("task_workers");

/// Workers keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Counters. Holds `queue_seq`, the last sequence number handed out.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const QUEUE_SEQ_KEY: &str = "queue_seq";
