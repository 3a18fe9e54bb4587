/*!
 * Structured Tracing
 * Subscriber setup and timed spans for allocator operations
 *
 * Features:
 * - JSON-formatted logs for structured parsing
 * - Sequential operation ids for correlating events of one operation
 * - Durations recorded on span close, slow operations flagged
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, span, warn, Level};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Operations slower than this are reported at warn level
const SLOW_OPERATION_MS: u128 = 100;

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SUBALLOC_TRACE_JSON: Enable JSON output (default: false)
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("SUBALLOC_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    if use_json {
        let installed = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok();
        if installed {
            info!("Structured tracing initialized with JSON output");
        }
    } else {
        let installed = registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok();
        if installed {
            info!("Structured tracing initialized");
        }
    }
}

/// Timed span around one allocator operation (a workload phase, a
/// defragmentation pass)
pub struct OperationSpan {
    span: tracing::Span,
    start: Instant,
    operation_id: u64,
}

impl OperationSpan {
    pub fn new(operation: &str) -> Self {
        let operation_id = NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed);

        let span = span!(
            Level::DEBUG,
            "operation",
            operation_id,
            operation = operation,
            duration_us = tracing::field::Empty,
            items_processed = tracing::field::Empty,
            bytes = tracing::field::Empty,
        );

        span.in_scope(|| debug!(operation, operation_id, "operation started"));

        Self {
            span,
            start: Instant::now(),
            operation_id,
        }
    }

    #[inline]
    pub fn operation_id(&self) -> u64 {
        self.operation_id
    }

    /// Number of allocations or moves handled
    pub fn record_items_processed(&self, count: usize) {
        self.span.record("items_processed", count);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.span.record("bytes", bytes);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for OperationSpan {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        self.span.record("duration_us", duration.as_micros() as u64);
        let _entered = self.span.enter();

        if duration.as_millis() > SLOW_OPERATION_MS {
            warn!(
                operation_id = self.operation_id,
                duration_ms = duration.as_millis() as u64,
                slow = true,
                "slow operation detected"
            );
        } else {
            debug!(
                operation_id = self.operation_id,
                duration_us = duration.as_micros() as u64,
                "operation completed"
            );
        }
    }
}

/// Helper to create an operation span
#[inline]
pub fn span_operation(name: &str) -> OperationSpan {
    OperationSpan::new(name)
}
