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

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cirrus::api::object::{ApiObject, ObjectMeta, Toleration, DO_NOT_DISRUPT_ANNOTATION};
use crate::cirrus::api::requirements::Requirement;
use crate::cirrus::api::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerKind {
    DaemonSet,
    ReplicaSet,
    StatefulSet,
    Job,
}

/// Even spread of matching pods across the domains of a topology key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    #[serde(rename = "topologyKey")]
    pub topology_key: String,
    #[serde(rename = "maxSkew")]
    pub max_skew: i64,
}

/// Required anti-affinity: no two pods carrying `label_key=label_value` may
/// share a domain of `topology_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodAntiAffinityTerm {
    #[serde(rename = "labelKey")]
    pub label_key: String,
    #[serde(rename = "labelValue")]
    pub label_value: String,
    #[serde(rename = "topologyKey")]
    pub topology_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub requests: Resources,
    #[serde(rename = "nodeSelector", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(rename = "nodeRequirements", default, skip_serializing_if = "Vec::is_empty")]
    pub node_requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(rename = "topologySpread", default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread: Vec<TopologySpreadConstraint>,
    #[serde(rename = "antiAffinity", default, skip_serializing_if = "Vec::is_empty")]
    pub anti_affinity: Vec<PodAntiAffinityTerm>,
    #[serde(rename = "nodeName", default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
    #[serde(default)]
    pub status: PodStatus,
}

impl Pod {
    pub fn new(metadata: ObjectMeta, spec: PodSpec) -> Self {
        Pod {
            metadata,
            spec,
            status: PodStatus::default(),
        }
    }

    /// Pending, unbound, and not owned by a daemon set: the provisioner may
    /// need to create capacity for it.
    pub fn is_provisionable(&self) -> bool {
        self.status.phase == PodPhase::Pending
            && self.spec.node_name.is_none()
            && !self.is_daemon()
    }

    pub fn is_daemon(&self) -> bool {
        self.spec.owner == Some(OwnerKind::DaemonSet)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status.phase, PodPhase::Succeeded | PodPhase::Failed)
    }

    /// Pods that survive a node removal only by being recreated elsewhere.
    /// Daemon pods follow their node and terminal pods need no home.
    pub fn is_reschedulable(&self) -> bool {
        !self.is_daemon() && !self.is_terminal()
    }

    pub fn has_do_not_disrupt(&self) -> bool {
        self.metadata
            .annotations
            .get(DO_NOT_DISRUPT_ANNOTATION)
            .is_some_and(|value| value == "true")
    }
}

impl ApiObject for Pod {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_pod(name: &str) -> Pod {
        Pod::new(
            ObjectMeta::named(name),
            PodSpec {
                requests: Resources::requests(100, 1 << 20),
                ..Default::default()
            },
        )
    }

    #[test]
    fn pending_unbound_pod_is_provisionable() {
        let pod = pending_pod("web-0");
        assert!(pod.is_provisionable());
    }

    #[test]
    fn bound_daemon_and_terminal_pods_are_not_provisionable() {
        let mut bound = pending_pod("bound");
        bound.spec.node_name = Some("node-a".to_string());
        assert!(!bound.is_provisionable());

        let mut daemon = pending_pod("daemon");
        daemon.spec.owner = Some(OwnerKind::DaemonSet);
        assert!(!daemon.is_provisionable());
        assert!(!daemon.is_reschedulable());

        let mut done = pending_pod("done");
        done.status.phase = PodPhase::Succeeded;
        assert!(!done.is_provisionable());
        assert!(!done.is_reschedulable());
    }

    #[test]
    fn do_not_disrupt_requires_true() {
        let mut pod = pending_pod("guarded");
        pod.metadata
            .annotations
            .insert(DO_NOT_DISRUPT_ANNOTATION.to_string(), "false".to_string());
        assert!(!pod.has_do_not_disrupt());
        pod.metadata
            .annotations
            .insert(DO_NOT_DISRUPT_ANNOTATION.to_string(), "true".to_string());
        assert!(pod.has_do_not_disrupt());
    }
}
