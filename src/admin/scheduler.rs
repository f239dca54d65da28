//! Background job runner for the Admin service.
//!
//! Jobs are either fixed-interval or cron-scheduled and run as independent
//! tasks that stop on the shared shutdown signal. A job that fails logs
//! and waits for its next slot; a job that panics takes only its own task
//! down.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::core::error::{EngineError, EngineResult};

/// When a job fires.
#[derive(Debug, Clone)]
pub enum JobSchedule {
    /// Fixed interval from startup.
    Interval(Duration),
    /// Cron expression (seconds field included).
    Cron(String),
}

impl JobSchedule {
    /// Delay until the next firing.
    fn next_delay(&self) -> EngineResult<Duration> {
        match self {
            JobSchedule::Interval(d) => Ok(*d),
            JobSchedule::Cron(expr) => {
                let schedule = Schedule::from_str(expr)
                    .map_err(|e| EngineError::Validation(format!("cron expression: {e}")))?;
                let next = schedule
                    .upcoming(Utc)
                    .next()
                    .ok_or_else(|| EngineError::Validation("cron never fires".into()))?;
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                Ok(delay)
            }
        }
    }
}

/// A schedulable unit of background work.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> EngineResult<()>;
}

/// Spawns and tracks job loops.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
        }
    }

    /// Start a job loop. The first run waits one full schedule slot so a
    /// restart storm does not fire every job at once.
    pub fn spawn(
        &mut self,
        job: Arc<dyn BackgroundJob>,
        schedule: JobSchedule,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let handle = tokio::spawn(async move {
            info!(job = job.name(), "background job scheduled");
            loop {
                let delay = match schedule.next_delay() {
                    Ok(d) => d.max(Duration::from_secs(1)),
                    Err(e) => {
                        error!(job = job.name(), error = %e, "unschedulable job; stopping");
                        return;
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let started = std::time::Instant::now();
                        match job.run().await {
                            Ok(()) => info!(
                                job = job.name(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "background job finished"
                            ),
                            Err(e) => warn!(job = job.name(), error = %e, "background job failed"),
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!(job = job.name(), "background job stopping");
                            return;
                        }
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    /// Wait for every job loop to wind down.
    pub async fn join_all(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingJob {
        runs: AtomicU32,
    }

    #[async_trait]
    impl BackgroundJob for CountingJob {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self) -> EngineResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_interval_delay() {
        let schedule = JobSchedule::Interval(Duration::from_secs(30));
        assert_eq!(schedule.next_delay().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_cron_delay_is_bounded() {
        // Every minute at second 0.
        let schedule = JobSchedule::Cron("0 * * * * *".into());
        let delay = schedule.next_delay().unwrap();
        assert!(delay <= Duration::from_secs(60));
    }

    #[test]
    fn test_bad_cron_rejected() {
        let schedule = JobSchedule::Cron("not a cron".into());
        assert!(schedule.next_delay().is_err());
    }

    #[tokio::test]
    async fn test_job_runs_and_stops_on_shutdown() {
        let job = Arc::new(CountingJob {
            runs: AtomicU32::new(0),
        });
        let (tx, rx) = watch::channel(false);
        let mut scheduler = Scheduler::new();
        scheduler.spawn(job.clone(), JobSchedule::Interval(Duration::from_secs(1)), rx);

        tokio::time::sleep(Duration::from_millis(2200)).await;
        tx.send(true).unwrap();
        scheduler.join_all().await;

        let runs = job.runs.load(Ordering::SeqCst);
        assert!(runs >= 1, "expected at least one run, got {runs}");
    }
}
