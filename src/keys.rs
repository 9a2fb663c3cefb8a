//! Broker key layout shared by every process.
//!
//! | Key                   | Type       | Content                                  |
//! |-----------------------|------------|------------------------------------------|
//! | `<module>in`          | set        | ready inbound messages                   |
//! | `<module>out`         | set        | results waiting for the outbound relay   |
//! | `<module>in_delayed`  | sorted set | delayed messages scored by `run_at`      |
//! | `queues`              | hash       | module -> inbound ready-set depth        |
//! | `workers`             | set        | runtime ids of registered workers        |
//! | `worker:<id>`         | hash       | worker record                            |
//! | `supervisor:expected` | hash       | pool -> configured process count         |
//! | `supervisor:running`  | hash       | pool -> live process count               |
//! | `status`              | string     | status snapshot, expires                 |
//! | `all_logs`            | set        | names of broker log lists                |

/// Hash of module -> inbound queue depth.
pub const QUEUE_DEPTHS: &str = "queues";

/// Set of registered worker runtime ids.
pub const WORKERS: &str = "workers";

/// Hash of pool -> configured process count.
pub const SUPERVISOR_EXPECTED: &str = "supervisor:expected";

/// Hash of pool -> live process count.
pub const SUPERVISOR_RUNNING: &str = "supervisor:running";

/// Status snapshot key.
pub const STATUS: &str = "status";

/// Set of every broker log list name.
pub const ALL_LOGS: &str = "all_logs";

/// Fields of a worker record hash.
pub mod record {
    pub const MODULE: &str = "module";
    pub const PID: &str = "pid";
    pub const STARTED_AT: &str = "started_at";
    pub const LAST_RECEIVE: &str = "last_receive";
    pub const LAST_SEND: &str = "last_send";
    pub const QUEUE_IN: &str = "queue_in";
    pub const QUEUE_OUT: &str = "queue_out";
}

/// Key of a worker record.
pub fn worker_record(runtime_id: &str) -> String {
    format!("worker:{}", runtime_id)
}

/// Keys belonging to one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    module: String,
    ready_in: String,
    ready_out: String,
    delayed_in: String,
}

impl QueueKeys {
    pub fn new(module: impl Into<String>) -> Self {
        let module = module.into();
        Self {
            ready_in: format!("{}in", module),
            ready_out: format!("{}out", module),
            delayed_in: format!("{}in_delayed", module),
            module,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Ready set consumed by the module's workers.
    pub fn ready_in(&self) -> &str {
        &self.ready_in
    }

    /// Result set drained by the outbound relay.
    pub fn ready_out(&self) -> &str {
        &self.ready_out
    }

    /// Delayed sorted set of the inbound side.
    pub fn delayed_in(&self) -> &str {
        &self.delayed_in
    }
}
