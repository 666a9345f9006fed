use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();
static DESCRIBED: OnceCell<()> = OnceCell::new();

/// Registers help text for every engine metric. Safe to call repeatedly.
pub fn ensure_metrics_described() {
    DESCRIBED.get_or_init(|| {
        describe_counter!("spam_batch_runs_total", "process_batch invocations");
        describe_counter!("spam_batch_processed_total", "Messages fetched and scored");
        describe_counter!("spam_batch_matched_total", "Messages moved to review");
        describe_counter!("spam_batch_conflicts_total", "Conditional writes that affected 0 rows");
        describe_counter!("spam_batch_blocked_total", "Transitions rejected by the validator");
        describe_counter!("spam_batch_errored_total", "Per-item scoring or write failures");
        describe_counter!("spam_batch_deadline_total", "Batches stopped early by the time budget");
        describe_histogram!("spam_batch_duration_ms", "Wall-clock time per process_batch");
        describe_counter!("spam_learning_records_total", "Learning records appended");
        describe_counter!("spam_restore_total", "Messages restored from review to pending");
        describe_counter!("spam_store_retries_total", "Store calls retried after a transient error");
        describe_counter!("spam_circuit_open_total", "Times the store circuit breaker opened");
        describe_counter!("spam_circuit_rejections_total", "Calls rejected while the breaker was open");
        describe_gauge!("spam_pending_remaining", "Pending messages left after the last batch");
        describe_counter!("spam_backlog_runs_total", "Scheduled backlog drains started");
        describe_gauge!("spam_backlog_last_run_ts", "Unix time of the last scheduled drain");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Installs the Prometheus recorder once per process; later calls reuse it.
    pub fn init() -> anyhow::Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())?
            .clone();
        ensure_metrics_described();
        gauge!("spam_pending_remaining").set(0.0);
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
