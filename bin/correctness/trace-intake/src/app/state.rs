use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::http::HeaderName;
use tokio::time::Instant;
use tracewire::{
    query::{KeyValue, Process, Span, Trace},
    sampling::SamplingStrategyResponse,
};

/// Static behavior of the backend.
#[derive(Clone, Debug)]
pub struct BackendSettings {
    /// Service that every recorded trace belongs to, and the only service reported.
    pub service: String,

    /// Header whose presence on a request causes a trace to be recorded.
    pub correlation_header: HeaderName,

    /// How long a recorded trace stays invisible to searches.
    pub indexing_delay: Duration,

    /// Sampling rate reported for every service.
    pub sampling_rate: f64,
}

struct StoredTrace {
    visible_at: Instant,
    trace: Trace,
}

#[derive(Default)]
struct Inner {
    traces: Vec<StoredTrace>,
    next_id: u64,
}

#[derive(Clone)]
pub struct BackendState {
    settings: Arc<BackendSettings>,
    inner: Arc<Mutex<Inner>>,
}

impl BackendState {
    /// Creates a new `BackendState` with no recorded traces.
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn correlation_header(&self) -> &HeaderName {
        &self.settings.correlation_header
    }

    /// Records a single-span trace for `operation`, tagged with the correlation header and `tag_value`.
    ///
    /// The trace only becomes visible to searches once the indexing delay has passed. Returns the new trace ID.
    pub fn record_trace(&self, operation: &str, tag_value: &str) -> String {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or_default();

        let mut inner = self.lock();
        inner.next_id += 1;
        let trace_id = format!("{:016x}", inner.next_id);

        let span = Span {
            trace_id: trace_id.clone(),
            span_id: trace_id.clone(),
            operation_name: operation.to_string(),
            references: Vec::new(),
            start_time,
            duration: 0,
            tags: vec![
                KeyValue::string(self.settings.correlation_header.as_str(), tag_value),
                KeyValue::string("span.kind", "server"),
            ],
            logs: Vec::new(),
            process_id: "p1".to_string(),
            warnings: None,
        };

        let process = Process {
            service_name: self.settings.service.clone(),
            tags: Vec::new(),
        };

        inner.traces.push(StoredTrace {
            visible_at: Instant::now() + self.settings.indexing_delay,
            trace: Trace {
                trace_id: trace_id.clone(),
                spans: vec![span],
                processes: BTreeMap::from([("p1".to_string(), process)]),
                warnings: None,
            },
        });

        trace_id
    }

    /// Returns every visible trace for `service`, optionally restricted to traces carrying the `(key, value)` tag.
    pub fn search(&self, service: &str, tag: Option<(&str, &str)>) -> Vec<Trace> {
        let now = Instant::now();
        self.lock()
            .traces
            .iter()
            .filter(|stored| stored.visible_at <= now)
            .map(|stored| &stored.trace)
            .filter(|trace| trace.service_names().contains(&service))
            .filter(|trace| tag.map_or(true, |(key, value)| trace.has_tag(key, value)))
            .cloned()
            .collect()
    }

    /// Returns the services known to the backend.
    pub fn services(&self) -> Vec<String> {
        vec![self.settings.service.clone()]
    }

    /// Returns the sampling strategy, which is the same for every service.
    pub fn sampling_strategy(&self) -> SamplingStrategyResponse {
        SamplingStrategyResponse::probabilistic(self.settings.sampling_rate)
    }
}
