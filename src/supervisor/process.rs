//! Child process handles behind a launcher seam.
//!
//! The supervisor only talks to [`Launcher`] and [`ChildProcess`], so its
//! reconciliation logic can be exercised without spawning real programs.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::warn;

/// What to execute for one pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub runtime_id: String,
    pub program: String,
    pub args: Vec<String>,
}

/// A spawned child process.
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running.
    ///
    /// Implementations reap an exited child here, so a zombie is reported
    /// as dead and does not linger in the process table.
    fn is_alive(&mut self) -> bool;

    /// Forcibly terminates the process and waits for it to exit.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// Starts child processes.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn ChildProcess>>;
}

/// Launches real OS processes via `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<Box<dyn ChildProcess>> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Box::new(OsChild {
            runtime_id: spec.runtime_id.clone(),
            child,
        }))
    }
}

struct OsChild {
    runtime_id: String,
    child: Child,
}

#[async_trait]
impl ChildProcess for OsChild {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(e) => {
                warn!(runtime_id = %self.runtime_id, error = %e, "Liveness check failed");
                false
            }
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            runtime_id: "test_0".to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_exited_child_is_dead() {
        let mut child = OsLauncher.launch(&spec("true", &[])).expect("spawn true");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!child.is_alive());
    }

    #[tokio::test]
    async fn test_kill_running_child() {
        let mut child = OsLauncher
            .launch(&spec("sleep", &["30"]))
            .expect("spawn sleep");
        assert!(child.pid().is_some());
        assert!(child.is_alive());

        child.kill().await.expect("kill");
        assert!(!child.is_alive());
    }

    #[test]
    fn test_missing_program() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let _guard = runtime.enter();
        assert!(OsLauncher
            .launch(&spec("/nonexistent/pipequeue-worker", &[]))
            .is_err());
    }
}
