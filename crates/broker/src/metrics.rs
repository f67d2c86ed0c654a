//! Prometheus metrics for the Cask broker.
//!
//! The `/metrics` endpoint is unauthenticated; bind `listen.http_bind` to a
//! loopback or otherwise restricted address.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Template metrics
pub static TEMPLATES_BUILT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_templates_built_total",
        "Total number of templates built and frozen",
    )
    .expect("metric creation failed")
});

pub static TEMPLATE_BUILD_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_template_build_failures_total",
        "Total number of failed template builds",
    )
    .expect("metric creation failed")
});

pub static TEMPLATE_BUILD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "cask_template_build_duration_seconds",
            "Template build duration in seconds, fixture hook included",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Database metrics
pub static DATABASES_CLONED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_databases_cloned_total",
        "Total number of databases cloned from templates",
    )
    .expect("metric creation failed")
});

pub static CLONE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "cask_clone_duration_seconds",
            "Duration of cloning one database from its template",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

pub static DATABASES_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_databases_dropped_total",
        "Total number of databases dropped at teardown",
    )
    .expect("metric creation failed")
});

pub static DROP_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_drop_failures_total",
        "Total number of databases that could not be dropped",
    )
    .expect("metric creation failed")
});

pub static KEYED_HITS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "cask_keyed_hits_total",
        "Total number of keyed requests served by an existing database",
    )
    .expect("metric creation failed")
});

// Session metrics
pub static ACTIVE_CONTEXTS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "cask_active_contexts",
        "Number of calling contexts currently connected",
    )
    .expect("metric creation failed")
});

pub static REQUEST_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "cask_request_errors_total",
            "Total number of requests answered with an error, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(TEMPLATES_BUILT.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TEMPLATE_BUILD_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TEMPLATE_BUILD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DATABASES_CLONED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CLONE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DATABASES_DROPPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DROP_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(KEYED_HITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_CONTEXTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REQUEST_ERRORS.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for GET /metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Count a request answered with an error.
pub fn record_request_error(kind: &str) {
    REQUEST_ERRORS.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_twice() {
        register_metrics();
        register_metrics();
        TEMPLATES_BUILT.inc();
        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"cask_templates_built_total".to_string()));
    }
}
