//! Starting and stopping worker processes.
//!
//! Every staged worker ships an entry-point script at
//! `<staging_dir>/bin/agent.sh` (`agent.bat` on Windows). The script is
//! invoked with `start` to launch the worker and `stop force` to shut it down.
//! Neither call waits for the worker itself: the launched process is reaped in
//! the background and its exit status logged.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, Result};

/// Directory holding the entry-point script.
pub const BIN_DIR: &str = "bin";

/// Entry-point script name for the current platform.
#[cfg(windows)]
pub const ENTRY_POINT: &str = "agent.bat";

/// Entry-point script name for the current platform.
#[cfg(not(windows))]
pub const ENTRY_POINT: &str = "agent.sh";

/// A command sent to a worker's entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Launch the worker.
    Start,
    /// Stop the worker, forcibly.
    Stop,
}

impl WorkerCommand {
    /// Arguments passed to the entry point.
    #[must_use]
    pub const fn args(self) -> &'static [&'static str] {
        match self {
            Self::Start => &["start"],
            Self::Stop => &["stop", "force"],
        }
    }
}

/// The `WorkerRunner` trait defines how worker processes are driven.
///
/// Production code uses [`ScriptRunner`]; tests swap in `MockRunner`.
#[async_trait]
pub trait WorkerRunner: Send + Sync {
    /// Run a command against the worker staged in `staging_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point cannot be started.
    async fn run(&self, staging_dir: &Path, command: WorkerCommand) -> Result<()>;

    /// Launch the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point cannot be started.
    async fn start(&self, staging_dir: &Path) -> Result<()> {
        self.run(staging_dir, WorkerCommand::Start).await
    }

    /// Stop the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry point cannot be started.
    async fn stop(&self, staging_dir: &Path) -> Result<()> {
        self.run(staging_dir, WorkerCommand::Stop).await
    }
}

/// Runs the staged entry-point script as a child process.
#[derive(Debug, Default, Clone)]
pub struct ScriptRunner;

impl ScriptRunner {
    /// Create a new script runner.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Path of the entry point inside a staging directory.
    #[must_use]
    pub fn entry_point(staging_dir: &Path) -> PathBuf {
        staging_dir.join(BIN_DIR).join(ENTRY_POINT)
    }
}

#[async_trait]
impl WorkerRunner for ScriptRunner {
    async fn run(&self, staging_dir: &Path, command: WorkerCommand) -> Result<()> {
        let work_dir = staging_dir.join(BIN_DIR);
        let program = Self::entry_point(staging_dir);

        let mut child = tokio::process::Command::new(&program)
            .args(command.args())
            .current_dir(&work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ProviderError::Launch {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        info!(
            program = %program.display(),
            ?command,
            pid,
            "Launched worker entry point"
        );

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(program = %program.display(), ?command, pid, "Entry point exited");
                }
                Ok(status) => {
                    warn!(
                        program = %program.display(),
                        ?command,
                        pid,
                        code = ?status.code(),
                        "Entry point exited with failure"
                    );
                }
                Err(e) => {
                    warn!(program = %program.display(), error = %e, "Failed to reap entry point");
                }
            }
        });

        Ok(())
    }
}

/// Mock runner for testing.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// A runner that records commands instead of spawning processes.
    #[derive(Default)]
    pub struct MockRunner {
        calls: Mutex<Vec<(PathBuf, WorkerCommand)>>,
        fail_start: AtomicBool,
        fail_stop: AtomicBool,
    }

    impl MockRunner {
        /// Create a new mock runner.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Make subsequent `start` commands fail.
        pub fn fail_start(&self, fail: bool) {
            self.fail_start.store(fail, Ordering::SeqCst);
        }

        /// Make subsequent `stop` commands fail.
        pub fn fail_stop(&self, fail: bool) {
            self.fail_stop.store(fail, Ordering::SeqCst);
        }

        /// All commands received, in order.
        #[must_use]
        pub fn calls(&self) -> Vec<(PathBuf, WorkerCommand)> {
            self.calls.lock().clone()
        }

        /// Number of times `command` was received.
        #[must_use]
        pub fn count(&self, command: WorkerCommand) -> usize {
            self.calls.lock().iter().filter(|(_, c)| *c == command).count()
        }
    }

    #[async_trait]
    impl WorkerRunner for MockRunner {
        async fn run(&self, staging_dir: &Path, command: WorkerCommand) -> Result<()> {
            self.calls.lock().push((staging_dir.to_path_buf(), command));

            let fail = match command {
                WorkerCommand::Start => self.fail_start.load(Ordering::SeqCst),
                WorkerCommand::Stop => self.fail_stop.load(Ordering::SeqCst),
            };
            if fail {
                return Err(ProviderError::Launch {
                    program: ScriptRunner::entry_point(staging_dir),
                    source: std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "mock launch failure",
                    ),
                });
            }
            Ok(())
        }
    }
}
