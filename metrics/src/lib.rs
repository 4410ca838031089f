use std::time::{Duration, Instant};

use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Counter<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.add(duration.as_secs_f64(), labels);
    }
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: Vec<KeyValue>,
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    pub fn start_with_labels(metric: &'a T, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels: labels.to_vec(),
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), &self.labels);
    }
}

pub mod blob_store {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub operations: Histogram<f64>,
        pub errors: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("stelvio-blob-store");
            let operations = meter
                .f64_histogram("stelvio.blob_store.operations")
                .with_description("blob store operation latencies in seconds")
                .build();
            let errors = meter
                .u64_counter("stelvio.blob_store.errors")
                .with_description("number of failed blob store operations")
                .build();
            Metrics { operations, errors }
        }
    }
}

pub mod state_ops {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub partial_push_attempts: Counter<u64>,
        pub partial_push_uploads: Counter<u64>,
        pub partial_push_skipped: Counter<u64>,
        pub partial_push_failures: Counter<u64>,
        pub lock_conflicts: Counter<u64>,
        pub state_push: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("stelvio-state");
            let partial_push_attempts = meter
                .u64_counter("stelvio.state.partial_push_attempts")
                .with_description("number of partial push wake-ups")
                .build();
            let partial_push_uploads = meter
                .u64_counter("stelvio.state.partial_push_uploads")
                .with_description("number of partial pushes that uploaded state")
                .build();
            let partial_push_skipped = meter
                .u64_counter("stelvio.state.partial_push_skipped")
                .with_description("number of partial pushes skipped because state was unchanged")
                .build();
            let partial_push_failures = meter
                .u64_counter("stelvio.state.partial_push_failures")
                .with_description("number of failed partial pushes")
                .build();
            let lock_conflicts = meter
                .u64_counter("stelvio.state.lock_conflicts")
                .with_description("number of lock acquisitions rejected by an existing lock")
                .build();
            let state_push = meter
                .f64_histogram("stelvio.state.push")
                .with_description("state push latencies in seconds")
                .build();
            Metrics {
                partial_push_attempts,
                partial_push_uploads,
                partial_push_skipped,
                partial_push_failures,
                lock_conflicts,
                state_push,
            }
        }
    }
}
