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

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;

use crate::cirrus::cloud::CloudProvider;
use crate::cirrus::cluster::state::ClusterState;
use crate::cirrus::observability::metrics;

const ERROR_MAX_LEN: usize = 240;

#[derive(Clone, Debug, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn healthy(name: &'static str) -> Self {
        ComponentHealth {
            name,
            healthy: true,
            error: None,
        }
    }

    fn unhealthy(name: &'static str, err: impl ToString) -> Self {
        let mut message = err.to_string();
        if message.len() > ERROR_MAX_LEN {
            message.truncate(ERROR_MAX_LEN);
        }
        ComponentHealth {
            name,
            healthy: false,
            error: Some(message),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Degraded,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    pub fn is_ready(&self) -> bool {
        self.status == HealthStatus::Ready
    }
}

#[derive(Clone)]
pub struct HealthState {
    pub cloud: Arc<dyn CloudProvider>,
    pub cluster: Arc<ClusterState>,
}

/// Readiness covers the dependencies a working controller needs: the cloud
/// provider answering and the cluster state synced.
pub fn readiness_report(state: &HealthState) -> HealthReport {
    let mut components = Vec::with_capacity(2);
    match state.cloud.liveness() {
        Ok(()) => components.push(ComponentHealth::healthy("cloud_provider")),
        Err(err) => components.push(ComponentHealth::unhealthy("cloud_provider", err)),
    }
    if state.cluster.synced() {
        components.push(ComponentHealth::healthy("cluster_state"));
    } else {
        components.push(ComponentHealth::unhealthy(
            "cluster_state",
            "initial list not yet ingested",
        ));
    }
    let status = if components.iter().all(|component| component.healthy) {
        HealthStatus::Ready
    } else {
        HealthStatus::Degraded
    };
    HealthReport { status, components }
}

/// Liveness only asserts the process services requests; no dependency
/// checks, to stay lightweight.
pub fn liveness_report() -> HealthReport {
    HealthReport {
        status: HealthStatus::Ready,
        components: vec![ComponentHealth::healthy("process")],
    }
}

/// HTTP surface for probes and metrics scraping.
pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    Json(liveness_report())
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    let report = readiness_report(&state);
    let status = if report.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn metrics_handler() -> impl IntoResponse {
    match metrics::gather() {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cirrus::cloud::fake::FakeCloudProvider;

    fn health_state(synced: bool, alive: bool) -> HealthState {
        let cloud = Arc::new(FakeCloudProvider::with_default_catalog());
        cloud.set_alive(alive);
        let cluster = Arc::new(ClusterState::new());
        if synced {
            cluster.mark_pods_synced();
            cluster.mark_nodes_synced();
            cluster.mark_claims_synced();
        }
        HealthState { cloud, cluster }
    }

    #[test]
    fn ready_when_everything_answers() {
        let report = readiness_report(&health_state(true, true));
        assert!(report.is_ready());
    }

    #[test]
    fn degraded_until_synced() {
        let report = readiness_report(&health_state(false, true));
        assert!(!report.is_ready());
        let state = report
            .components
            .iter()
            .find(|component| component.name == "cluster_state")
            .expect("component");
        assert!(!state.healthy);
    }

    #[test]
    fn degraded_when_the_cloud_is_unreachable() {
        let report = readiness_report(&health_state(true, false));
        assert!(!report.is_ready());
    }

    #[test]
    fn liveness_never_checks_dependencies() {
        assert!(liveness_report().is_ready());
    }
}
