use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
};
use std::sync::LazyLock;

pub static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("signage-explainer"));

// --- Upstream Call Metrics ---

pub static UPSTREAM_CALL_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("upstream.call.duration")
        .with_description("Duration of a single upstream HTTP attempt in seconds")
        .with_unit("s")
        .build()
});

pub static UPSTREAM_ERROR_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("upstream.call.error.count")
        .with_description("Number of failed upstream HTTP attempts")
        .with_unit("{error}")
        .build()
});

pub static UPSTREAM_RETRY_COUNT: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("upstream.call.retry.count")
        .with_description("Number of upstream call retries")
        .with_unit("{retry}")
        .build()
});

// --- Domain Metrics ---

pub static ANALYSIS_CYCLES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("analysis.cycles")
        .with_description("Completed analysis cycles by outcome")
        .with_unit("{cycle}")
        .build()
});

pub static ANALYSIS_CYCLE_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("analysis.cycle.duration")
        .with_description("Analysis cycle duration in seconds, dispatch to settled result")
        .with_unit("s")
        .build()
});

pub static LOCATION_RESOLUTIONS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("location.resolutions")
        .with_description("Location lookups by outcome")
        .with_unit("{lookup}")
        .build()
});

// --- HTTP Metrics ---

pub static HTTP_REQUESTS_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("http.requests.total")
        .with_description("Total number of HTTP requests")
        .with_unit("{request}")
        .build()
});

pub static HTTP_REQUEST_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("http.request.duration")
        .with_description("HTTP request duration in milliseconds")
        .with_unit("ms")
        .with_boundaries(vec![
            1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
            30000.0,
        ])
        .build()
});
