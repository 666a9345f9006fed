// src/scheduler.rs
use metrics::{counter, gauge};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::EngineResult;

/// Totals across all rounds of one drain.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
    pub rounds: usize,
    pub processed: usize,
    pub matched: usize,
    pub conflicts: usize,
    pub errored: usize,
    pub complete: bool,
    pub next_skip: usize,
}

/// Calls `process_batch` with the returned cursor until the backlog reports
/// `complete` or `max_rounds` is reached.
pub async fn drain_backlog(engine: &Engine, take: usize, max_rounds: usize) -> EngineResult<DrainReport> {
    let mut report = DrainReport::default();
    let mut skip = 0;
    while report.rounds < max_rounds.max(1) {
        let out = engine.process_batch(skip, take).await?;
        report.rounds += 1;
        report.processed += out.processed;
        report.matched += out.matched;
        report.conflicts += out.conflicts;
        report.errored += out.errored;
        report.next_skip = out.next_skip;
        skip = out.next_skip;
        if out.complete {
            report.complete = true;
            break;
        }
        if out.processed == 0 && !out.deadline_hit {
            break;
        }
    }
    Ok(report)
}

/// Spawn a background task that drains the backlog every `interval_secs`.
/// Returns `None` when the interval is 0.
pub fn spawn_backlog_scheduler(engine: Arc<Engine>, cfg: SchedulerConfig) -> Option<JoinHandle<()>> {
    if cfg.interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(cfg.interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp().max(0) as u64;
            counter!("spam_backlog_runs_total").increment(1);
            gauge!("spam_backlog_last_run_ts").set(now as f64);

            match drain_backlog(&engine, cfg.take, cfg.max_rounds).await {
                Ok(r) => tracing::info!(
                    target: "spam",
                    rounds = r.rounds,
                    processed = r.processed,
                    matched = r.matched,
                    complete = r.complete,
                    "backlog tick"
                ),
                Err(e) => tracing::warn!(target: "spam", error = %e, "backlog tick failed"),
            }
        }
    }))
}
