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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::cirrus::api::object::{ApiObject, ObjectMeta, Taint};
use crate::cirrus::api::requirements::Requirements;
use crate::cirrus::api::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionType {
    Launched,
    Registered,
    Initialized,
    Empty,
    Drifted,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition: DateTime<Utc>,
}

/// The record of one requested node. Created by the provisioner, mutated by
/// the lifecycle controller as cloud events arrive, destroyed by disruption
/// or garbage collection removing the finalizer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClaim {
    pub metadata: ObjectMeta,
    pub spec: NodeClaimSpec,
    #[serde(default)]
    pub status: NodeClaimStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClaimSpec {
    /// Name of the pool this claim was launched from.
    #[serde(rename = "nodePool")]
    pub nodepool: String,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,
    /// Aggregate requests of the workloads packed onto this claim at
    /// scheduling time.
    #[serde(default)]
    pub resources: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(rename = "startupTaints", default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClaimStatus {
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Labels resolved by the cloud provider at launch (instance type, zone,
    /// capacity type).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capacity: Resources,
    #[serde(default)]
    pub allocatable: Resources,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl NodeClaim {
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|condition| condition.condition_type == condition_type)
    }

    pub fn condition_is_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some_and(|c| c.status)
    }

    /// Sets a condition, preserving the transition time when the status does
    /// not actually change.
    pub fn set_condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
    ) {
        let now = Utc::now();
        if let Some(existing) = self
            .status
            .conditions
            .iter_mut()
            .find(|condition| condition.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition = now;
            }
            existing.status = status;
            existing.reason = reason.to_string();
            existing.message = message.to_string();
            return;
        }
        self.status.conditions.push(Condition {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition: now,
        });
    }

    pub fn clear_condition(&mut self, condition_type: ConditionType) {
        self.status
            .conditions
            .retain(|condition| condition.condition_type != condition_type);
    }

    pub fn is_launched(&self) -> bool {
        self.condition_is_true(ConditionType::Launched)
    }

    pub fn is_registered(&self) -> bool {
        self.condition_is_true(ConditionType::Registered)
    }

    pub fn is_initialized(&self) -> bool {
        self.condition_is_true(ConditionType::Initialized)
    }

    pub fn is_terminating(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        self.metadata.age(now).num_seconds()
    }
}

impl ApiObject for NodeClaim {
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

    #[test]
    fn set_condition_preserves_transition_time_on_no_change() {
        let mut claim = NodeClaim {
            metadata: ObjectMeta::named("claim-1"),
            ..Default::default()
        };
        claim.set_condition(ConditionType::Launched, true, "Launched", "");
        let first = claim
            .condition(ConditionType::Launched)
            .expect("condition")
            .last_transition;
        claim.set_condition(ConditionType::Launched, true, "Launched", "instance ready");
        let second = claim
            .condition(ConditionType::Launched)
            .expect("condition")
            .last_transition;
        assert_eq!(first, second);
        assert!(claim.is_launched());
    }

    #[test]
    fn conditions_default_false_when_absent() {
        let claim = NodeClaim::default();
        assert!(!claim.is_registered());
        assert!(!claim.is_initialized());
        assert!(claim.condition(ConditionType::Drifted).is_none());
    }
}
