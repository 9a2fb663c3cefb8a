//! Worker-side access to a module's queues.
//!
//! Worker business logic lives outside this crate; workers link against
//! [`ModuleQueue`] to pull ready messages and push results. The
//! [`passthrough`] worker forwards every message unchanged and serves as a
//! reference implementation and test fixture.

pub mod passthrough;
pub mod queue;

pub use passthrough::run_passthrough;
pub use queue::{split_runtime_id, ModuleQueue};
