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
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::cirrus::api::duration::NillableDuration;
use crate::cirrus::api::object::{
    is_qualified_name, is_valid_label_value, restricted_label, ApiObject, ObjectMeta, Taint,
    NODEPOOL_LABEL,
};
use crate::cirrus::api::requirements::Requirements;
use crate::cirrus::api::resources::Resources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsolidationPolicy {
    WhenEmpty,
    #[default]
    WhenUnderutilized,
}

/// Disruption policy attached to a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Disruption {
    #[serde(rename = "consolidationPolicy", default)]
    pub consolidation_policy: ConsolidationPolicy,
    /// Required when the policy is WhenEmpty; otherwise only the literal
    /// `Never` is accepted.
    #[serde(rename = "consolidateAfter", default, skip_serializing_if = "Option::is_none")]
    pub consolidate_after: Option<NillableDuration>,
    #[serde(rename = "expireAfter", default)]
    pub expire_after: NillableDuration,
}

/// Template for the node claims a pool may launch. Resource requests are
/// forbidden here; capacity always comes from the resolved instance type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClaimTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Requirements::is_empty")]
    pub requirements: Requirements,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(rename = "startupTaints", default, skip_serializing_if = "Vec::is_empty")]
    pub startup_taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "Resources::is_zero")]
    pub requests: Resources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolSpec {
    pub template: NodeClaimTemplate,
    #[serde(default)]
    pub disruption: Disruption,
    /// Ceiling on the summed capacity of launched claims; absent means
    /// unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<Resources>,
    /// Priority during scheduling; higher weights are tried first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub metadata: ObjectMeta,
    pub spec: NodePoolSpec,
}

impl NodePool {
    /// Stable digest of the claim template, recorded on launched claims and
    /// compared later to detect drift.
    pub fn hash(&self) -> String {
        let payload = serde_json::to_vec(&self.spec.template)
            .expect("node pool template serializes to JSON");
        format!("{:x}", Sha1::digest(&payload))
    }

    pub fn weight(&self) -> i32 {
        self.spec.weight.unwrap_or(0)
    }

    /// Admission validation; an invalid pool is never persisted.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validate_disruption()?;
        self.validate_template()
    }

    fn validate_disruption(&self) -> Result<(), ValidationError> {
        let disruption = &self.spec.disruption;
        match disruption.consolidation_policy {
            ConsolidationPolicy::WhenEmpty => {
                if disruption.consolidate_after.is_none() {
                    return Err(ValidationError::Disruption(
                        "consolidateAfter must be specified with consolidationPolicy=WhenEmpty"
                            .to_string(),
                    ));
                }
            }
            ConsolidationPolicy::WhenUnderutilized => {
                if let Some(after) = disruption.consolidate_after {
                    if !after.is_never() {
                        return Err(ValidationError::Disruption(
                            "consolidateAfter cannot be combined with consolidationPolicy=WhenUnderutilized"
                                .to_string(),
                        ));
                    }
                }
            }
        }
        if let Some(weight) = self.spec.weight {
            if !(1..=100).contains(&weight) {
                return Err(ValidationError::Weight(weight));
            }
        }
        Ok(())
    }

    fn validate_template(&self) -> Result<(), ValidationError> {
        let template = &self.spec.template;
        if !template.requests.is_zero() {
            return Err(ValidationError::TemplateRequests);
        }
        for (key, value) in &template.labels {
            if key == NODEPOOL_LABEL {
                return Err(ValidationError::RestrictedLabel(key.clone()));
            }
            if let Some(message) = restricted_label(key) {
                return Err(ValidationError::Label(message));
            }
            if !is_qualified_name(key) {
                return Err(ValidationError::Label(format!("invalid label key {key:?}")));
            }
            if !is_valid_label_value(value) {
                return Err(ValidationError::Label(format!(
                    "invalid value {value:?} for label {key}"
                )));
            }
        }
        for key in template.requirements.keys() {
            if key == NODEPOOL_LABEL {
                return Err(ValidationError::RestrictedLabel(key.clone()));
            }
        }
        Ok(())
    }
}

impl ApiObject for NodePool {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Orders pools by descending weight, ties broken by name, in-place.
pub fn order_by_weight(pools: &mut [NodePool]) {
    pools.sort_by(|a, b| {
        b.weight()
            .cmp(&a.weight())
            .then_with(|| a.metadata.name.cmp(&b.metadata.name))
    });
}

/// Errors surfaced on the admission seam for user-authored pools.
#[derive(Debug)]
pub enum ValidationError {
    Disruption(String),
    TemplateRequests,
    RestrictedLabel(String),
    Label(String),
    Weight(i32),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Disruption(message) => write!(f, "disruption policy: {}", message),
            ValidationError::TemplateRequests => {
                write!(f, "template resource requests are not allowed")
            }
            ValidationError::RestrictedLabel(key) => {
                write!(f, "label key {} is restricted", key)
            }
            ValidationError::Label(message) => write!(f, "template labels: {}", message),
            ValidationError::Weight(weight) => {
                write!(f, "weight {} outside the accepted range 1..=100", weight)
            }
        }
    }
}

impl Error for ValidationError {}
