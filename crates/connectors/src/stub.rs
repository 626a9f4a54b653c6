//! Scripted adapters for tests: fixed rows, injected latency and
//! failures, and concurrency probes used to assert semaphore bounds.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use crate::{Adapter, AdapterError, Row};
use models::OpSpec;

/// Which error the stub raises while failures remain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailureMode {
    Connection,
    Syntax,
    Transient,
}

impl FailureMode {
    fn to_error(self) -> AdapterError {
        match self {
            FailureMode::Connection => AdapterError::Connection("injected failure".to_string()),
            FailureMode::Syntax => AdapterError::Syntax("injected failure".to_string()),
            FailureMode::Transient => AdapterError::Backend {
                message: "injected transient failure".to_string(),
                retryable: true,
            },
        }
    }
}

/// StubAdapter returns scripted rows after an optional delay, optionally
/// failing its first N calls, and tracks how many calls ran concurrently.
pub struct StubAdapter {
    name: String,
    rows: Vec<Row>,
    latency: Duration,
    hang: bool,
    failures_remaining: AtomicU32,
    failure_mode: FailureMode,
    calls: AtomicU32,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl StubAdapter {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: Vec::new(),
            latency: Duration::ZERO,
            hang: false,
            failures_remaining: AtomicU32::new(0),
            failure_mode: FailureMode::Transient,
            calls: AtomicU32::new(0),
            current: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }

    /// Rows to return, given as a JSON array of objects.
    pub fn with_rows(mut self, rows: Value) -> Self {
        self.rows = rows
            .as_array()
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the first `n` execute calls with `mode` before succeeding.
    pub fn failing(mut self, n: u32, mode: FailureMode) -> Self {
        self.failures_remaining = AtomicU32::new(n);
        self.failure_mode = mode;
        self
    }

    /// Never complete `execute`; useful for timeout and cancellation tests.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// The highest number of concurrently in-flight execute calls seen.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

/// Decrements the in-flight gauge even when execute exits early.
struct Gauge<'a>(&'a AtomicUsize);

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Adapter for StubAdapter {
    async fn test_connection(&self) -> Result<bool, AdapterError> {
        Ok(true)
    }

    async fn execute(&self, _spec: &OpSpec) -> Result<Vec<Row>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inflight = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(inflight, Ordering::SeqCst);
        let _gauge = Gauge(&self.current);

        if self.hang {
            std::future::pending::<()>().await;
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0
            && self
                .failures_remaining
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            tracing::debug!(adapter = %self.name, "stub raising injected failure");
            return Err(self.failure_mode.to_error());
        }

        Ok(self.rows.clone())
    }

    async fn introspect_schema(&self) -> Result<Vec<Value>, AdapterError> {
        Ok(vec![serde_json::json!({
            "source": self.name,
            "tables": [],
        })])
    }
}
