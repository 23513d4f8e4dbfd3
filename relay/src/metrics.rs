//! Metrics Collection for the Mesh Relay
//!
//! Provides atomic counters, latency histograms, and a
//! Prometheus-compatible /v1/metrics endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Relay-wide metrics
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    /// Total gateway calls processed
    total_calls: AtomicU64,
    /// Active node sessions
    active_sessions: AtomicU64,
    /// Sessions replaced by a reconnect of the same node
    superseded_sessions: AtomicU64,
    /// Response frames that matched no waiting call
    late_responses: AtomicU64,
    /// Frames from nodes that failed to decode
    malformed_frames: AtomicU64,
    /// Status code counts
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    /// Gateway-generated failures by error kind
    failures: Mutex<BTreeMap<&'static str, u64>>,
    /// Total bytes in/out
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    /// Latency tracking
    latencies: Mutex<LatencyHistogram>,
    /// Per-node metrics
    node_metrics: Mutex<BTreeMap<String, NodeMetrics>>,
}

/// Latency histogram for percentile calculation
struct LatencyHistogram {
    /// Recent latencies (ring buffer, microseconds)
    values: Vec<u64>,
    /// Write position
    pos: usize,
    /// Total count
    count: u64,
    /// Sum for average
    sum: u64,
}

impl LatencyHistogram {
    fn new(capacity: usize) -> Self {
        Self {
            values: vec![0; capacity],
            pos: 0,
            count: 0,
            sum: 0,
        }
    }

    fn record(&mut self, latency_us: u64) {
        self.values[self.pos] = latency_us;
        self.pos = (self.pos + 1) % self.values.len();
        self.count += 1;
        self.sum += latency_us;
    }

    fn percentile(&self, p: f64) -> u64 {
        let count = self.count.min(self.values.len() as u64) as usize;
        if count == 0 {
            return 0;
        }

        let mut sorted: Vec<u64> = self.values[..count].to_vec();
        sorted.sort_unstable();

        let idx = ((count as f64 * p / 100.0) as usize).min(count - 1);
        sorted[idx]
    }

    fn average(&self) -> u64 {
        if self.count == 0 { 0 } else { self.sum / self.count }
    }
}

/// Per-node metrics
#[derive(Debug, Clone, Default)]
pub struct NodeMetrics {
    pub calls: u64,
    pub errors: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                total_calls: AtomicU64::new(0),
                active_sessions: AtomicU64::new(0),
                superseded_sessions: AtomicU64::new(0),
                late_responses: AtomicU64::new(0),
                malformed_frames: AtomicU64::new(0),
                status_2xx: AtomicU64::new(0),
                status_3xx: AtomicU64::new(0),
                status_4xx: AtomicU64::new(0),
                status_5xx: AtomicU64::new(0),
                failures: Mutex::new(BTreeMap::new()),
                bytes_in: AtomicU64::new(0),
                bytes_out: AtomicU64::new(0),
                latencies: Mutex::new(LatencyHistogram::new(10000)),
                node_metrics: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Record a completed gateway call. `node` is set only for nodes the
    /// directory knows; `failure` is the error kind when the relay generated
    /// the response itself.
    pub async fn record_call(
        &self,
        node: Option<&str>,
        status: u16,
        failure: Option<&'static str>,
        latency_us: u64,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        self.inner.total_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.inner.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        match status / 100 {
            2 => { self.inner.status_2xx.fetch_add(1, Ordering::Relaxed); }
            3 => { self.inner.status_3xx.fetch_add(1, Ordering::Relaxed); }
            4 => { self.inner.status_4xx.fetch_add(1, Ordering::Relaxed); }
            5 => { self.inner.status_5xx.fetch_add(1, Ordering::Relaxed); }
            _ => {}
        }

        if let Some(kind) = failure {
            *self.inner.failures.lock().await.entry(kind).or_default() += 1;
        }

        self.inner.latencies.lock().await.record(latency_us);

        let Some(node) = node else { return };
        let mut nodes = self.inner.node_metrics.lock().await;
        let entry = nodes.entry(node.to_string()).or_default();
        entry.calls += 1;
        if status >= 400 {
            entry.errors += 1;
        }
        entry.bytes_in += bytes_in;
        entry.bytes_out += bytes_out;
    }

    pub fn session_opened(&self) {
        self.inner.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn session_superseded(&self) {
        self.inner.superseded_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_response(&self) {
        self.inner.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn malformed_frame(&self) {
        self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.inner.active_sessions.load(Ordering::Relaxed)
    }

    pub async fn node(&self, node: &str) -> Option<NodeMetrics> {
        self.inner.node_metrics.lock().await.get(node).cloned()
    }

    /// Generate Prometheus-format metrics text
    pub async fn to_prometheus(&self, pending_calls: usize) -> String {
        let lat = self.inner.latencies.lock().await;
        let p50 = lat.percentile(50.0);
        let p95 = lat.percentile(95.0);
        let p99 = lat.percentile(99.0);
        let avg = lat.average();
        drop(lat);

        let mut out = format!(
r#"# HELP mesh_calls_total Total number of gateway calls processed
# TYPE mesh_calls_total counter
mesh_calls_total {}

# HELP mesh_active_sessions Number of connected node sessions
# TYPE mesh_active_sessions gauge
mesh_active_sessions {}

# HELP mesh_pending_calls Calls waiting for a node response
# TYPE mesh_pending_calls gauge
mesh_pending_calls {}

# HELP mesh_superseded_sessions_total Sessions replaced by a node reconnect
# TYPE mesh_superseded_sessions_total counter
mesh_superseded_sessions_total {}

# HELP mesh_late_responses_total Responses that matched no waiting call
# TYPE mesh_late_responses_total counter
mesh_late_responses_total {}

# HELP mesh_malformed_frames_total Undecodable frames received from nodes
# TYPE mesh_malformed_frames_total counter
mesh_malformed_frames_total {}

# HELP mesh_calls_by_status Calls by HTTP status class
# TYPE mesh_calls_by_status counter
mesh_calls_by_status{{status="2xx"}} {}
mesh_calls_by_status{{status="3xx"}} {}
mesh_calls_by_status{{status="4xx"}} {}
mesh_calls_by_status{{status="5xx"}} {}

# HELP mesh_bytes_total Total body bytes transferred
# TYPE mesh_bytes_total counter
mesh_bytes_total{{direction="in"}} {}
mesh_bytes_total{{direction="out"}} {}

# HELP mesh_latency_us Call latency in microseconds
# TYPE mesh_latency_us summary
mesh_latency_us{{quantile="0.5"}} {}
mesh_latency_us{{quantile="0.95"}} {}
mesh_latency_us{{quantile="0.99"}} {}
mesh_latency_us_avg {}
"#,
            self.inner.total_calls.load(Ordering::Relaxed),
            self.inner.active_sessions.load(Ordering::Relaxed),
            pending_calls,
            self.inner.superseded_sessions.load(Ordering::Relaxed),
            self.inner.late_responses.load(Ordering::Relaxed),
            self.inner.malformed_frames.load(Ordering::Relaxed),
            self.inner.status_2xx.load(Ordering::Relaxed),
            self.inner.status_3xx.load(Ordering::Relaxed),
            self.inner.status_4xx.load(Ordering::Relaxed),
            self.inner.status_5xx.load(Ordering::Relaxed),
            self.inner.bytes_in.load(Ordering::Relaxed),
            self.inner.bytes_out.load(Ordering::Relaxed),
            p50, p95, p99, avg,
        );

        let failures = self.inner.failures.lock().await;
        if !failures.is_empty() {
            out.push_str("\n# HELP mesh_failures_total Relay-generated failures by kind\n");
            out.push_str("# TYPE mesh_failures_total counter\n");
            for (kind, count) in failures.iter() {
                out.push_str(&format!("mesh_failures_total{{kind=\"{}\"}} {}\n", escape_label(kind), count));
            }
        }
        drop(failures);

        let nodes = self.inner.node_metrics.lock().await;
        if !nodes.is_empty() {
            out.push_str("\n# HELP mesh_node_calls_total Calls per node\n");
            out.push_str("# TYPE mesh_node_calls_total counter\n");
            for (node, m) in nodes.iter() {
                let node = escape_label(node);
                out.push_str(&format!("mesh_node_calls_total{{node=\"{}\"}} {}\n", node, m.calls));
                out.push_str(&format!("mesh_node_errors_total{{node=\"{}\"}} {}\n", node, m.errors));
            }
        }
        out
    }
}

/// Escape a Prometheus label value.
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_call() {
        let m = Metrics::new();
        m.record_call(Some("node-a"), 200, None, 1500, 10, 20).await;
        m.record_call(Some("node-a"), 504, Some("timed-out"), 9000, 0, 0).await;
        m.record_call(None, 404, Some("no-route"), 100, 0, 0).await;
        m.session_opened();

        let node = m.node("node-a").await.unwrap();
        assert_eq!(node.calls, 2);
        assert_eq!(node.errors, 1);
        assert_eq!(node.bytes_out, 20);

        let text = m.to_prometheus(3).await;
        assert!(text.contains("mesh_calls_total 3"));
        assert_eq!(text.matches("mesh_node_calls_total{").count(), 1);
        assert!(text.contains("mesh_active_sessions 1"));
        assert!(text.contains("mesh_pending_calls 3"));
        assert!(text.contains(r#"mesh_failures_total{kind="timed-out"} 1"#));
        assert!(text.contains(r#"mesh_node_calls_total{node="node-a"} 2"#));
    }

    #[tokio::test]
    async fn test_label_values_are_escaped() {
        let m = Metrics::new();
        m.record_call(Some(r#"we"ird\node"#), 200, None, 10, 0, 0).await;
        let text = m.to_prometheus(0).await;
        assert!(text.contains(r#"mesh_node_calls_total{node="we\"ird\\node"} 1"#));
    }

    #[test]
    fn test_percentiles() {
        let mut h = LatencyHistogram::new(4);
        assert_eq!(h.percentile(50.0), 0);
        for v in [10, 20, 30, 40, 50] {
            h.record(v);
        }
        // Ring buffer keeps the last 4 samples.
        assert_eq!(h.percentile(99.0), 50);
        assert_eq!(h.percentile(0.0), 20);
        assert_eq!(h.average(), 30);
    }
}
