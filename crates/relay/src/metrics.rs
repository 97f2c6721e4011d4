// Prometheus-style counters and gauges for the relay.
//
// Handlers record through the free functions, which are no-ops until
// `set_global_metrics` installs the process-wide instance.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use crate::memory::PressureTier;

/// Routes served by the relay; anything else is bucketed as `other`.
const KNOWN_ENDPOINTS: [&str; 6] = ["/healthz", "/ws", "/metrics", "/v1/session", "/v1/canvas", "/v1/status"];
const FLUSH_OUTCOMES: [&str; 2] = ["written", "failed"];

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

/// One labelled counter family. Label values are kept sorted for stable output.
struct CounterFamily {
    name: &'static str,
    help: &'static str,
    labels: &'static [&'static str],
    values: Mutex<BTreeMap<Vec<String>, u64>>,
}

impl CounterFamily {
    fn new(name: &'static str, help: &'static str, labels: &'static [&'static str]) -> Self {
        Self { name, help, labels, values: Mutex::new(BTreeMap::new()) }
    }

    fn add(&self, label_values: &[&str], delta: u64) {
        let key = label_values.iter().map(|value| value.to_string()).collect();
        let mut values = self.values.lock().expect("metrics map lock poisoned");
        let value = values.entry(key).or_insert(0);
        *value = value.saturating_add(delta);
    }

    fn render(&self, output: &mut String) {
        write_header(output, self.name, self.help, "counter");
        let values = self.values.lock().expect("metrics map lock poisoned");
        for (label_values, value) in values.iter() {
            let labels = self
                .labels
                .iter()
                .zip(label_values)
                .map(|(name, value)| format!("{name}=\"{}\"", escape_label_value(value)))
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(output, "{}{{{labels}}} {value}", self.name);
        }
    }
}

pub struct RelayMetrics {
    request_rate_total: CounterFamily,
    request_errors_total: CounterFamily,
    request_duration_sum_ms: CounterFamily,
    request_duration_count: CounterFamily,
    ws_rate_total: CounterFamily,
    ws_errors_total: CounterFamily,
    ws_duration_sum_ms: CounterFamily,
    ws_duration_count: CounterFamily,
    rate_limited_total: CounterFamily,
    draw_rejections_total: CounterFamily,
    canvas_flush_total: CounterFamily,
    ws_connections: AtomicU64,
    session_members: AtomicU64,
    session_observers: AtomicU64,
    memory_resident_bytes: AtomicU64,
    memory_pressure_tier: AtomicU64,
    memory_evictions_total: AtomicU64,
    canvas_last_flush_bytes: AtomicU64,
}

const ENDPOINT_LABELS: &[&str] = &["method", "endpoint"];
const EVENT_LABELS: &[&str] = &["event"];

impl Default for RelayMetrics {
    fn default() -> Self {
        let canvas_flush_total =
            CounterFamily::new("canvas_flush_total", "Canvas snapshot flushes by outcome.", &["outcome"]);
        for outcome in FLUSH_OUTCOMES {
            canvas_flush_total.add(&[outcome], 0);
        }

        Self {
            request_rate_total: CounterFamily::new(
                "relay_request_rate_total",
                "Total HTTP requests by endpoint.",
                ENDPOINT_LABELS,
            ),
            request_errors_total: CounterFamily::new(
                "relay_request_errors_total",
                "Total HTTP error responses by endpoint.",
                ENDPOINT_LABELS,
            ),
            request_duration_sum_ms: CounterFamily::new(
                "relay_request_duration_ms_sum",
                "Sum of HTTP request latency in milliseconds by endpoint.",
                ENDPOINT_LABELS,
            ),
            request_duration_count: CounterFamily::new(
                "relay_request_duration_ms_count",
                "Count of HTTP request latency samples by endpoint.",
                ENDPOINT_LABELS,
            ),
            ws_rate_total: CounterFamily::new(
                "relay_ws_rate_total",
                "Total websocket messages by event type.",
                EVENT_LABELS,
            ),
            ws_errors_total: CounterFamily::new(
                "relay_ws_errors_total",
                "Websocket messages answered with an error frame.",
                EVENT_LABELS,
            ),
            ws_duration_sum_ms: CounterFamily::new(
                "relay_ws_duration_ms_sum",
                "Sum of hub handling latency in milliseconds by event type.",
                EVENT_LABELS,
            ),
            ws_duration_count: CounterFamily::new(
                "relay_ws_duration_ms_count",
                "Count of hub latency samples by event type.",
                EVENT_LABELS,
            ),
            rate_limited_total: CounterFamily::new(
                "rate_limited_total",
                "Events dropped by the rate limiter.",
                EVENT_LABELS,
            ),
            draw_rejections_total: CounterFamily::new(
                "draw_rejections_total",
                "Drawing steps rejected by the stroke state machine.",
                &["reason"],
            ),
            canvas_flush_total,
            ws_connections: AtomicU64::new(0),
            session_members: AtomicU64::new(0),
            session_observers: AtomicU64::new(0),
            memory_resident_bytes: AtomicU64::new(0),
            memory_pressure_tier: AtomicU64::new(0),
            memory_evictions_total: AtomicU64::new(0),
            canvas_last_flush_bytes: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn record_ws_message(event: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_message(event, is_error, latency_ms);
    }
}

pub fn record_rate_limited(event: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_rate_limited(event);
    }
}

pub fn record_draw_rejection(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_draw_rejection(reason);
    }
}

pub fn set_presence(connections: usize, members: usize, observers: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_presence(connections, members, observers);
    }
}

pub fn observe_memory(resident_bytes: u64, tier: PressureTier, evicted: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.observe_memory(resident_bytes, tier, evicted);
    }
}

pub fn record_canvas_flush(written_bytes: Option<u64>) {
    if let Some(metrics) = global_metrics() {
        metrics.record_canvas_flush(written_bytes);
    }
}

impl RelayMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let method = method.to_ascii_uppercase();
        let labels = [method.as_str(), normalize_endpoint(path)];

        self.request_rate_total.add(&labels, 1);
        self.request_duration_sum_ms.add(&labels, latency_ms);
        self.request_duration_count.add(&labels, 1);
        if status_code >= 400 {
            self.request_errors_total.add(&labels, 1);
        }
    }

    pub fn record_ws_message(&self, event: &str, is_error: bool, latency_ms: u64) {
        let event = normalize_label(event);
        let labels = [event.as_str()];
        self.ws_rate_total.add(&labels, 1);
        self.ws_duration_sum_ms.add(&labels, latency_ms);
        self.ws_duration_count.add(&labels, 1);
        if is_error {
            self.ws_errors_total.add(&labels, 1);
        }
    }

    pub fn record_rate_limited(&self, event: &str) {
        self.rate_limited_total.add(&[normalize_label(event).as_str()], 1);
    }

    pub fn record_draw_rejection(&self, reason: &str) {
        self.draw_rejections_total.add(&[normalize_label(reason).as_str()], 1);
    }

    pub fn set_presence(&self, connections: usize, members: usize, observers: usize) {
        self.ws_connections.store(connections as u64, Ordering::SeqCst);
        self.session_members.store(members as u64, Ordering::SeqCst);
        self.session_observers.store(observers as u64, Ordering::SeqCst);
    }

    pub fn observe_memory(&self, resident_bytes: u64, tier: PressureTier, evicted: usize) {
        self.memory_resident_bytes.store(resident_bytes, Ordering::SeqCst);
        self.memory_pressure_tier.store(u64::from(tier.level()), Ordering::SeqCst);
        self.memory_evictions_total.fetch_add(evicted as u64, Ordering::SeqCst);
    }

    /// `None` records a failed flush.
    pub fn record_canvas_flush(&self, written_bytes: Option<u64>) {
        match written_bytes {
            Some(bytes) => {
                self.canvas_flush_total.add(&["written"], 1);
                self.canvas_last_flush_bytes.store(bytes, Ordering::SeqCst);
            }
            None => self.canvas_flush_total.add(&["failed"], 1),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        for family in [
            &self.request_rate_total,
            &self.request_errors_total,
            &self.request_duration_sum_ms,
            &self.request_duration_count,
            &self.ws_rate_total,
            &self.ws_errors_total,
            &self.ws_duration_sum_ms,
            &self.ws_duration_count,
            &self.rate_limited_total,
            &self.draw_rejections_total,
            &self.canvas_flush_total,
        ] {
            family.render(&mut output);
        }

        let scalars: [(&str, &str, &str, &AtomicU64); 7] = [
            ("ws_connections", "Open websocket connections.", "gauge", &self.ws_connections),
            ("session_members", "Identified members in the drawing session.", "gauge", &self.session_members),
            (
                "session_observers",
                "Connections watching without a roster entry.",
                "gauge",
                &self.session_observers,
            ),
            ("memory_resident_bytes", "Last sampled resident memory.", "gauge", &self.memory_resident_bytes),
            ("memory_pressure_tier", "Current memory pressure tier (0-3).", "gauge", &self.memory_pressure_tier),
            (
                "memory_evictions_total",
                "Managed resources released under pressure.",
                "counter",
                &self.memory_evictions_total,
            ),
            (
                "canvas_last_flush_bytes",
                "Compressed size of the last written snapshot.",
                "gauge",
                &self.canvas_last_flush_bytes,
            ),
        ];
        for (name, help, kind, value) in scalars {
            write_header(&mut output, name, help, kind);
            let _ = writeln!(output, "{name} {}", value.load(Ordering::SeqCst));
        }

        output
    }
}

fn write_header(output: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {kind}");
}

fn normalize_endpoint(path: &str) -> &'static str {
    let trimmed = match path.trim_end_matches('/') {
        "" => "/",
        other => other,
    };
    KNOWN_ENDPOINTS.iter().copied().find(|known| *known == trimmed).unwrap_or("other")
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}
