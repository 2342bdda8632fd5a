/*
 * Copyright (C) 2025 The Cirrus Authors
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
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static NODECLAIMS_GAUGE: OnceLock<IntGaugeVec> = OnceLock::new();
static PODS_GAUGE: OnceLock<IntGaugeVec> = OnceLock::new();
static NODES_GAUGE: OnceLock<IntGauge> = OnceLock::new();
static PROVISIONING_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static PROVISIONER_UNSCHEDULABLE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DISRUPTION_EVAL_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static DISRUPTION_ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("cirrus".to_string()), None)
            .expect("failed to initialise cirrus metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register cirrus metric collector");
    collector
}

fn nodeclaims_gauge() -> &'static IntGaugeVec {
    NODECLAIMS_GAUGE.get_or_init(|| {
        let opts = Opts::new("nodeclaims", "Number of node claims grouped by lifecycle state");
        let gauge =
            IntGaugeVec::new(opts, &["state"]).expect("failed to build nodeclaims gauge");
        register_collector(gauge)
    })
}

fn pods_gauge() -> &'static IntGaugeVec {
    PODS_GAUGE.get_or_init(|| {
        let opts = Opts::new("pods", "Number of pods grouped by phase");
        let gauge = IntGaugeVec::new(opts, &["phase"]).expect("failed to build pods gauge");
        register_collector(gauge)
    })
}

fn nodes_gauge() -> &'static IntGauge {
    NODES_GAUGE.get_or_init(|| {
        let gauge = IntGauge::with_opts(Opts::new("nodes", "Number of tracked nodes"))
            .expect("failed to build nodes gauge");
        register_collector(gauge)
    })
}

fn provisioning_duration() -> &'static HistogramVec {
    PROVISIONING_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "scheduling_duration_seconds",
            "Latency distribution of provisioning decisions",
        )
        .subsystem("provisioner")
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
        let histogram =
            HistogramVec::new(opts, &["result"]).expect("failed to build provisioning histogram");
        register_collector(histogram)
    })
}

fn provisioner_unschedulable_total() -> &'static IntCounterVec {
    PROVISIONER_UNSCHEDULABLE_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "unschedulable_pods_total",
            "Pods the simulator could not place, grouped by whether limits caused it",
        )
        .subsystem("provisioner");
        let counter = IntCounterVec::new(opts, &["cause"])
            .expect("failed to build unschedulable pods counter");
        register_collector(counter)
    })
}

fn disruption_eval_duration() -> &'static HistogramVec {
    DISRUPTION_EVAL_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "evaluation_duration_seconds",
            "Latency distribution of disruption method evaluation",
        )
        .subsystem("disruption")
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
        let histogram =
            HistogramVec::new(opts, &["method"]).expect("failed to build disruption histogram");
        register_collector(histogram)
    })
}

fn disruption_actions_total() -> &'static IntCounterVec {
    DISRUPTION_ACTIONS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "actions_total",
            "Disruption commands issued, grouped by method and action",
        )
        .subsystem("disruption");
        let counter = IntCounterVec::new(opts, &["method", "action"])
            .expect("failed to build disruption actions counter");
        register_collector(counter)
    })
}

/// Replaces the node-claim state gauges with a fresh census.
pub fn set_nodeclaim_gauges(counts: &[(&str, i64)]) {
    let gauge = nodeclaims_gauge();
    gauge.reset();
    for (state, count) in counts {
        gauge.with_label_values(&[state]).set(*count);
    }
}

pub fn set_pod_gauges(counts: &[(&str, i64)]) {
    let gauge = pods_gauge();
    gauge.reset();
    for (phase, count) in counts {
        gauge.with_label_values(&[phase]).set(*count);
    }
}

pub fn set_node_count(count: i64) {
    nodes_gauge().set(count);
}

pub fn observe_provisioning(duration: Duration, succeeded: bool) {
    let result = if succeeded { "success" } else { "error" };
    provisioning_duration()
        .with_label_values(&[result])
        .observe(duration.as_secs_f64());
}

pub fn record_unschedulable(cause: &str, count: u64) {
    provisioner_unschedulable_total()
        .with_label_values(&[cause])
        .inc_by(count);
}

pub fn observe_disruption_evaluation(method: &str, duration: Duration) {
    disruption_eval_duration()
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

pub fn record_disruption_action(method: &str, action: &str) {
    disruption_actions_total()
        .with_label_values(&[method, action])
        .inc();
}

/// Encodes all registered metrics in the Prometheus text exposition format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
