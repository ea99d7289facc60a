/// Daily counter reset.
///
/// This module provides the reset job and the timer that fires it. The
/// timer is a trait so the job can be driven directly in tests and by any
/// other clock in production.

use crate::day::DayScope;
use crate::error::QueueResult;
use crate::store::{CounterStore, ResetReport};
use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Work run once per day.
#[async_trait]
pub trait DailyJob: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self);
}

/// "Run this job every day at `at` in `scope`."
pub trait DailyTimer: Send + Sync {
    fn schedule_daily(&self, at: NaiveTime, scope: DayScope, job: Arc<dyn DailyJob>) -> JoinHandle<()>;
}

/// Resets both counters of every hospital to 1.
pub struct DailyResetJob<C: ?Sized> {
    counters: Arc<C>,
}

impl<C: CounterStore + ?Sized> DailyResetJob<C> {
    pub fn new(counters: Arc<C>) -> Self {
        DailyResetJob { counters }
    }

    pub async fn run_once(&self) -> QueueResult<ResetReport> {
        let report = self.counters.reset_all().await?;
        if report.is_clean() {
            info!(hospitals = report.reset.len(), "daily counter reset complete");
        } else {
            warn!(
                reset = report.reset.len(),
                failed = report.failed.len(),
                "daily counter reset finished with failures"
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl<C: CounterStore + ?Sized> DailyJob for DailyResetJob<C> {
    fn name(&self) -> &str {
        "daily-counter-reset"
    }

    async fn run(&self) {
        if let Err(err) = self.run_once().await {
            error!(error = %err, "daily counter reset could not list hospitals");
        }
    }
}

/// Sleeps on the tokio clock until the next local occurrence of `at`.
///
/// A firing missed while the process was down is not caught up.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDailyTimer;

impl DailyTimer for TokioDailyTimer {
    fn schedule_daily(&self, at: NaiveTime, scope: DayScope, job: Arc<dyn DailyJob>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = scope.next_occurrence(now, at);
                let wait = (next - now).to_std().unwrap_or_default();
                info!(job = job.name(), next = %next, "next daily run scheduled");
                tokio::time::sleep(wait).await;
                job.run().await;
            }
        })
    }
}

/// Wires a reset job to a timer.
pub struct DailyResetScheduler {
    timer: Arc<dyn DailyTimer>,
    job: Arc<dyn DailyJob>,
    at: NaiveTime,
    scope: DayScope,
}

impl DailyResetScheduler {
    pub fn new<C>(timer: Arc<dyn DailyTimer>, counters: Arc<C>, at: NaiveTime, scope: DayScope) -> Self
    where
        C: CounterStore + ?Sized + 'static,
    {
        DailyResetScheduler {
            timer,
            job: Arc::new(DailyResetJob::new(counters)),
            at,
            scope,
        }
    }

    pub fn start(&self) -> JoinHandle<()> {
        info!(at = %self.at, offset = %self.scope.offset(), "starting daily counter reset");
        self.timer.schedule_daily(self.at, self.scope, self.job.clone())
    }
}
