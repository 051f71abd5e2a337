//! Teams: the workers that run continuation steps.
//!
//! A [`Team`] has one job: run the [`Job`] it is given, now or later, on
//! some thread. It knows nothing about processes or resources; the office
//! hands it a closure that advances one chain to its next suspension or
//! completion.
//!
//! Two teams are provided:
//!
//! - [`PassiveTeam`] - runs the job on the calling thread
//! - [`TokioTeam`] - spawns the job onto a tokio runtime, owned or borrowed
//!
//! # Example
//!
//! ```
//! use keel_flow::team::{Job, PassiveTeam, Team};
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//!
//! let ran = Arc::new(AtomicBool::new(false));
//! let flag = Arc::clone(&ran);
//! PassiveTeam.assign(Job::new("demo", move || flag.store(true, Ordering::SeqCst)));
//! assert!(ran.load(Ordering::SeqCst));
//! ```

use core::fmt;
use std::io;

use tokio::runtime::{Builder, Handle, Runtime};

/// A unit of work handed to a team.
pub struct Job {
    label: &'static str,
    run: Box<dyn FnOnce() + Send>,
}

impl Job {
    /// Wraps `run`, labelled for tracing.
    pub fn new(label: &'static str, run: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            run: Box::new(run),
        }
    }

    /// Returns the label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Runs the job.
    pub fn run(self) {
        (self.run)();
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("label", &self.label).finish_non_exhaustive()
    }
}

/// A pool of capacity that runs jobs.
pub trait Team: Send + Sync + 'static {
    /// Runs `job`, on any thread, exactly once.
    fn assign(&self, job: Job);
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveTeam;

impl Team for PassiveTeam {
    fn assign(&self, job: Job) {
        job.run();
    }
}

/// Runs jobs as tasks on a tokio runtime.
pub struct TokioTeam {
    name: String,
    handle: Handle,
    runtime: Option<Runtime>,
}

impl TokioTeam {
    /// Starts a dedicated multi-threaded runtime with `workers` threads,
    /// named after the team.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the runtime cannot be built.
    pub fn new(name: impl Into<String>, workers: usize) -> io::Result<Self> {
        let name = name.into();
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers.max(1))
            .thread_name(format!("{name}-worker"))
            .enable_time()
            .build()?;
        tracing::debug!(team = %name, workers, "team started");
        Ok(Self {
            name,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Runs jobs on an existing runtime.
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self {
            name: name.into(),
            handle,
            runtime: None,
        }
    }

    /// Returns the team name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the runtime handle jobs are spawned on.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Team for TokioTeam {
    fn assign(&self, job: Job) {
        tracing::trace!(team = %self.name, job = job.label(), "job assigned");
        self.handle.spawn(async move { job.run() });
    }
}

impl Drop for TokioTeam {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            tracing::debug!(team = %self.name, "team stopping");
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TokioTeam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTeam")
            .field("name", &self.name)
            .field("owns_runtime", &self.runtime.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn tokio_team_runs_jobs_on_named_workers() {
        let team = TokioTeam::new("jobs", 2).expect("runtime builds");
        let (tx, rx) = mpsc::channel();

        for i in 0..4 {
            let tx = tx.clone();
            team.assign(Job::new("test", move || {
                let name = std::thread::current().name().map(str::to_owned);
                tx.send((i, name)).expect("receiver alive");
            }));
        }

        let mut seen: Vec<_> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job ran"))
            .collect();
        seen.sort_by_key(|(i, _)| *i);
        assert_eq!(seen.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(seen.iter().all(|(_, name)| name.as_deref() == Some("jobs-worker")));
    }

    #[test]
    fn dropping_an_owned_team_does_not_block() {
        let team = TokioTeam::new("short", 1).expect("runtime builds");
        team.assign(Job::new("sleep", || std::thread::sleep(Duration::from_millis(20))));
        drop(team);
    }
}
