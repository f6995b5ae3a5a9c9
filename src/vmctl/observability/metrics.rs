/*
 * Copyright (C) 2024 The vmctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::sync::OnceLock;

use chrono::Utc;
use prometheus::core::Collector;
use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::vmctl::k8s::store::NotificationKind;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static EVENTS_OBSERVED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static LAST_EVENT_TIMESTAMP: OnceLock<Gauge> = OnceLock::new();
static RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static LEADER_STATUS: OnceLock<IntGauge> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("vmctl".to_string()), None)
            .expect("failed to initialise vmctl metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register vmctl metric collector");
    collector
}

fn events_observed_total() -> &'static IntCounterVec {
    EVENTS_OBSERVED_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "events_observed_total",
            "Resource store notifications observed, grouped by kind",
        );
        let counter =
            IntCounterVec::new(opts, &["kind"]).expect("failed to build events observed counter");
        register_collector(counter)
    })
}

fn last_event_timestamp() -> &'static Gauge {
    LAST_EVENT_TIMESTAMP.get_or_init(|| {
        let gauge = Gauge::new(
            "last_event_timestamp_seconds",
            "Unix time of the most recent resource store notification",
        )
        .expect("failed to build last event gauge");
        register_collector(gauge)
    })
}

fn reconciles_total() -> &'static IntCounterVec {
    RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "reconciles_total",
            "Reconciliation attempts grouped by result",
        );
        let counter =
            IntCounterVec::new(opts, &["result"]).expect("failed to build reconcile counter");
        register_collector(counter)
    })
}

fn queue_depth() -> &'static IntGauge {
    QUEUE_DEPTH.get_or_init(|| {
        let gauge = IntGauge::new("queue_depth", "Keys waiting in the retry queue")
            .expect("failed to build queue depth gauge");
        register_collector(gauge)
    })
}

fn queue_retries_total() -> &'static IntCounter {
    QUEUE_RETRIES_TOTAL.get_or_init(|| {
        let counter = IntCounter::new(
            "queue_retries_total",
            "Keys rescheduled with backoff after a transient failure",
        )
        .expect("failed to build queue retries counter");
        register_collector(counter)
    })
}

fn leader_status() -> &'static IntGauge {
    LEADER_STATUS.get_or_init(|| {
        let gauge = IntGauge::new(
            "leader_status",
            "1 while this replica holds the controller lease",
        )
        .expect("failed to build leader status gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ReconcileResult {
    Converged,
    Dropped,
    Retry,
    Panicked,
}

impl ReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ReconcileResult::Converged => "converged",
            ReconcileResult::Dropped => "dropped",
            ReconcileResult::Retry => "retry",
            ReconcileResult::Panicked => "panicked",
        }
    }
}

/// Hooks the control loop calls into. Exporting is left to the implementor.
pub trait MetricsSink: Send + Sync {
    fn record_notification(&self, kind: NotificationKind);

    fn record_reconcile(&self, result: ReconcileResult);

    fn record_retry(&self) {}

    fn set_queue_depth(&self, _depth: usize) {}

    fn set_leader(&self, _leading: bool) {}
}

/// Sink backed by the process-wide Prometheus registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusMetrics;

impl MetricsSink for PrometheusMetrics {
    fn record_notification(&self, kind: NotificationKind) {
        events_observed_total()
            .with_label_values(&[kind.as_label()])
            .inc();
        last_event_timestamp().set(Utc::now().timestamp_millis() as f64 / 1000.0);
    }

    fn record_reconcile(&self, result: ReconcileResult) {
        reconciles_total()
            .with_label_values(&[result.as_label()])
            .inc();
    }

    fn record_retry(&self) {
        queue_retries_total().inc();
    }

    fn set_queue_depth(&self, depth: usize) {
        queue_depth().set(depth as i64);
    }

    fn set_leader(&self, leading: bool) {
        leader_status().set(i64::from(leading));
    }
}

/// Encodes every registered metric in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    // Touch the lazily built collectors so a fresh process still exports them.
    let _ = events_observed_total();
    let _ = last_event_timestamp();
    let _ = reconciles_total();
    let _ = queue_depth();
    let _ = queue_retries_total();
    let _ = leader_status();

    let encoder = TextEncoder::new();
    let families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(buffer)
}
