//! Prometheus metrics for the UPM pipeline

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics collection shared by every component of a deployment
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub replay_events_total: CounterVec,
    pub replay_buffer_depth: GaugeVec,
    pub batches_applied_total: CounterVec,
    pub batch_loss: GaugeVec,
    pub update_duration: HistogramVec,
    pub trainer_batch_count: GaugeVec,
    pub trainer_restarts_total: CounterVec,
    pub snapshot_size_bytes: GaugeVec,
    pub snapshot_version: GaugeVec,
    pub drift_score_p95: GaugeVec,
    pub drift_score_mean: GaugeVec,
    pub drift_score_max: GaugeVec,
    pub drift_windows_total: CounterVec,
    pub adapter_syncs_total: CounterVec,
    pub adapter_sync_duration: HistogramVec,
}

fn counter(name: &str, help: &str, labels: &[&str]) -> CounterVec {
    CounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("failed to create {} counter: {}", name, e))
}

fn gauge(name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    GaugeVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|e| panic!("failed to create {} gauge: {}", name, e))
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> HistogramVec {
    HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .unwrap_or_else(|e| panic!("failed to create {} histogram: {}", name, e))
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let replay_events_total = counter(
            "upm_replay_events_total",
            "Batch notifications seen by replay buffers, by outcome",
            &["trainer", "outcome"],
        );
        let replay_buffer_depth = gauge(
            "upm_replay_buffer_depth",
            "Entries currently held in the replay buffer",
            &["trainer"],
        );
        let batches_applied_total = counter(
            "upm_batches_applied_total",
            "Incremental updates applied",
            &["trainer"],
        );
        let batch_loss = gauge("upm_batch_loss", "Loss of the last applied batch", &["trainer"]);
        let update_duration = histogram(
            "upm_update_duration_seconds",
            "Duration of a single incremental update",
            vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
            &["trainer"],
        );
        let trainer_batch_count = gauge(
            "upm_trainer_batch_count",
            "Batches applied since the trainer was created",
            &["trainer"],
        );
        let trainer_restarts_total = counter(
            "upm_trainer_restarts_total",
            "Supervisor restarts after a trainer task panicked",
            &["trainer"],
        );
        let snapshot_size_bytes = gauge(
            "upm_snapshot_size_bytes",
            "On-disk size of the newest snapshot",
            &["trainer"],
        );
        let snapshot_version = gauge(
            "upm_snapshot_version",
            "Version of the newest snapshot",
            &["trainer"],
        );
        let drift_score_p95 = gauge(
            "upm_drift_score_p95",
            "P95 drift score of the last evaluated window",
            &["trainer"],
        );
        let drift_score_mean = gauge(
            "upm_drift_score_mean",
            "Mean drift score of the last evaluated window",
            &["trainer"],
        );
        let drift_score_max = gauge(
            "upm_drift_score_max",
            "Max drift score of the last evaluated window",
            &["trainer"],
        );
        let drift_windows_total = counter(
            "upm_drift_windows_total",
            "Closed drift windows, by outcome",
            &["outcome"],
        );
        let adapter_syncs_total = counter(
            "upm_adapter_syncs_total",
            "Adapter synchronization attempts, by outcome",
            &["outcome"],
        );
        let adapter_sync_duration = histogram(
            "upm_adapter_sync_duration_seconds",
            "Time to synchronize one adapter, retries included",
            vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0],
            &["outcome"],
        );

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(replay_events_total.clone()),
            Box::new(replay_buffer_depth.clone()),
            Box::new(batches_applied_total.clone()),
            Box::new(batch_loss.clone()),
            Box::new(update_duration.clone()),
            Box::new(trainer_batch_count.clone()),
            Box::new(trainer_restarts_total.clone()),
            Box::new(snapshot_size_bytes.clone()),
            Box::new(snapshot_version.clone()),
            Box::new(drift_score_p95.clone()),
            Box::new(drift_score_mean.clone()),
            Box::new(drift_score_max.clone()),
            Box::new(drift_windows_total.clone()),
            Box::new(adapter_syncs_total.clone()),
            Box::new(adapter_sync_duration.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .unwrap_or_else(|e| panic!("failed to register collector: {}", e));
        }

        Self {
            registry: Arc::new(registry),
            replay_events_total,
            replay_buffer_depth,
            batches_applied_total,
            batch_loss,
            update_duration,
            trainer_batch_count,
            trainer_restarts_total,
            snapshot_size_bytes,
            snapshot_version,
            drift_score_p95,
            drift_score_mean,
            drift_score_max,
            drift_windows_total,
            adapter_syncs_total,
            adapter_sync_duration,
        }
    }

    /// Record a replay buffer decision
    pub fn record_replay(&self, trainer: &str, outcome: &str, depth: usize) {
        self.replay_events_total
            .with_label_values(&[trainer, outcome])
            .inc();
        self.replay_buffer_depth
            .with_label_values(&[trainer])
            .set(depth as f64);
    }

    pub fn set_replay_depth(&self, trainer: &str, depth: usize) {
        self.replay_buffer_depth
            .with_label_values(&[trainer])
            .set(depth as f64);
    }

    /// Record one applied update
    pub fn record_update(&self, trainer: &str, loss: f64, duration_secs: f64, batch_count: u64) {
        self.batches_applied_total.with_label_values(&[trainer]).inc();
        self.batch_loss.with_label_values(&[trainer]).set(loss);
        self.update_duration
            .with_label_values(&[trainer])
            .observe(duration_secs);
        self.trainer_batch_count
            .with_label_values(&[trainer])
            .set(batch_count as f64);
    }

    pub fn record_snapshot(&self, trainer: &str, size_bytes: u64, version: u64) {
        self.snapshot_size_bytes
            .with_label_values(&[trainer])
            .set(size_bytes as f64);
        self.snapshot_version
            .with_label_values(&[trainer])
            .set(version as f64);
    }

    pub fn record_drift_scores(&self, trainer: &str, p95: f64, mean: f64, max: f64) {
        self.drift_score_p95.with_label_values(&[trainer]).set(p95);
        self.drift_score_mean.with_label_values(&[trainer]).set(mean);
        self.drift_score_max.with_label_values(&[trainer]).set(max);
    }

    pub fn record_drift_window(&self, outcome: &str) {
        self.drift_windows_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_sync(&self, outcome: &str, duration_secs: f64) {
        self.adapter_syncs_total.with_label_values(&[outcome]).inc();
        self.adapter_sync_duration
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn record_restart(&self, trainer: &str) {
        self.trainer_restarts_total
            .with_label_values(&[trainer])
            .inc();
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server for the Prometheus scrape endpoint
pub struct MetricsServer {
    metrics: Metrics,
    addr: String,
}

impl MetricsServer {
    pub fn new(metrics: Metrics, addr: impl Into<String>) -> Self {
        Self {
            metrics,
            addr: addr.into(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Serve `/metrics` until the task is dropped
    pub async fn run(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!("Metrics server listening on http://{}/metrics", self.addr);

        loop {
            let (mut socket, _addr) = listener.accept().await?;

            // Request line is read and discarded; every path serves metrics.
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;

            let body = self.metrics.gather();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                error!("Failed to write metrics response: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_names() {
        let metrics = Metrics::new();
        metrics.record_replay("t1", "buffered", 3);
        metrics.record_update("t1", 0.5, 0.002, 1);
        metrics.record_snapshot("t1", 512, 1);
        metrics.record_drift_scores("t1", 0.25, 0.13, 0.25);
        metrics.record_drift_window("quarantined");
        metrics.record_sync("synced", 0.01);

        let output = metrics.gather();
        for name in [
            "upm_replay_events_total",
            "upm_replay_buffer_depth",
            "upm_batches_applied_total",
            "upm_batch_loss",
            "upm_update_duration_seconds",
            "upm_trainer_batch_count",
            "upm_snapshot_size_bytes",
            "upm_snapshot_version",
            "upm_drift_score_p95",
            "upm_drift_score_mean",
            "upm_drift_score_max",
            "upm_drift_windows_total",
            "upm_adapter_syncs_total",
            "upm_adapter_sync_duration_seconds",
        ] {
            assert!(output.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn test_metrics_clone_shares_registry() {
        let m1 = Metrics::new();
        m1.record_replay("alpha", "duplicate", 0);
        let m2 = m1.clone();
        m2.record_replay("beta", "dropped_full", 1000);

        let output = m2.gather();
        assert!(output.contains("alpha"));
        assert!(output.contains("dropped_full"));
    }

    #[test]
    fn test_metrics_server_new() {
        let server = MetricsServer::new(Metrics::new(), "127.0.0.1:0");
        assert_eq!(server.addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_metrics_server_serves_text() {
        let metrics = Metrics::new();
        metrics.record_restart("t1");

        // Bind an ephemeral port, then hand it to the server
        let free_port = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = free_port.local_addr().unwrap().to_string();
        drop(free_port);

        let server = MetricsServer::new(metrics, addr.clone());
        let handle = tokio::spawn(async move { server.run().await });

        let mut body = String::new();
        for _ in 0..50 {
            if let Ok(mut stream) = tokio::net::TcpStream::connect(&addr).await {
                stream
                    .write_all(b"GET /metrics HTTP/1.1\r\n\r\n")
                    .await
                    .unwrap();
                stream.read_to_string(&mut body).await.unwrap();
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("upm_trainer_restarts_total"));
    }
}
