//! One supervised pool: a desired size and the slots currently filled.

use std::fmt;

use super::process::{ChildProcess, LaunchSpec};

/// What a pool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKind {
    /// Module workers from the startup configuration.
    Worker,
    /// Inbound relay of a module with a source channel.
    QueueIn,
    /// Outbound relay of a module with destinations.
    QueueOut,
}

impl PoolKind {
    /// Subcommand name for relay pools.
    pub fn subcommand(&self) -> Option<&'static str> {
        match self {
            PoolKind::Worker => None,
            PoolKind::QueueIn => Some("queue-in"),
            PoolKind::QueueOut => Some("queue-out"),
        }
    }
}

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Launching,
    Running,
    /// Fewer live processes than configured, until replacements are up.
    Degraded,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PoolState::Stopped => "stopped",
            PoolState::Launching => "launching",
            PoolState::Running => "running",
            PoolState::Degraded => "degraded",
        };
        write!(f, "{}", s)
    }
}

/// How to build the command line of a new slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolTemplate {
    pub program: String,
    pub args: Vec<String>,
}

pub(crate) struct Slot {
    pub(crate) runtime_id: String,
    pub(crate) pid: Option<u32>,
    pub(crate) child: Box<dyn ChildProcess>,
}

/// Desired and observed state of one pool.
pub struct Pool {
    name: String,
    module: String,
    kind: PoolKind,
    size: usize,
    template: PoolTemplate,
    pub(crate) slots: Vec<Slot>,
    pub(crate) state: PoolState,
    next_instance: u64,
}

impl Pool {
    pub fn new(module: &str, kind: PoolKind, size: usize, template: PoolTemplate) -> Self {
        let name = match kind.subcommand() {
            None => module.to_string(),
            Some(sub) => format!("{}:{}", sub, module),
        };
        Self {
            name,
            module: module.to_string(),
            kind,
            size,
            template,
            slots: Vec::new(),
            state: PoolState::Stopped,
            next_instance: 0,
        }
    }

    /// Key of this pool in the supervisor hashes.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn kind(&self) -> &PoolKind {
        &self.kind
    }

    /// Configured process count.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    /// Slots whose process was alive at the last check.
    pub fn live(&self) -> usize {
        self.slots.len()
    }

    /// Runtime ids of the tracked processes.
    pub fn runtime_ids(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.runtime_id.as_str()).collect()
    }

    /// Builds the launch spec of the next slot and consumes its id.
    ///
    /// Workers get `<module>_<n>`, relays `<subcommand>:<module>_<n>`, with
    /// `n` increasing over the lifetime of the pool.
    pub(crate) fn next_spec(&mut self, runtime_path: &str) -> LaunchSpec {
        let runtime_id = format!("{}_{}", self.name, self.next_instance);
        self.next_instance += 1;

        let mut args = self.template.args.clone();
        if self.kind == PoolKind::Worker {
            args.extend([
                "-r".to_string(),
                runtime_path.to_string(),
                "-i".to_string(),
                runtime_id.clone(),
            ]);
        }
        LaunchSpec {
            runtime_id,
            program: self.template.program.clone(),
            args,
        }
    }

    /// Drops every slot whose process has exited. Returns the removed
    /// runtime ids.
    pub(crate) fn reap(&mut self) -> Vec<(String, Option<u32>)> {
        let mut dead = Vec::new();
        self.slots.retain_mut(|slot| {
            if slot.child.is_alive() {
                true
            } else {
                dead.push((slot.runtime_id.clone(), slot.pid));
                false
            }
        });
        dead
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("live", &self.slots.len())
            .field("state", &self.state)
            .finish()
    }
}
