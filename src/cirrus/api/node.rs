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

use crate::cirrus::api::object::{
    ApiObject, ObjectMeta, Taint, DISRUPTING_TAINT_KEY, DO_NOT_DISRUPT_ANNOTATION,
    UNREGISTERED_TAINT_KEY,
};
use crate::cirrus::api::resources::Resources;

/// The orchestrator's node object. Owned externally; the controller reads
/// taints, allocatable, readiness, and labels, and patches taints and labels
/// during registration and disruption.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,
    #[serde(rename = "providerID", default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub allocatable: Resources,
    #[serde(default)]
    pub ready: bool,
}

impl Node {
    pub fn has_taint(&self, key: &str) -> bool {
        self.taints.iter().any(|taint| taint.key == key)
    }

    pub fn add_taint(&mut self, taint: Taint) {
        if !self.has_taint(&taint.key) {
            self.taints.push(taint);
        }
    }

    pub fn remove_taint(&mut self, key: &str) {
        self.taints.retain(|taint| taint.key != key);
    }

    pub fn is_cordoned(&self) -> bool {
        self.has_taint(DISRUPTING_TAINT_KEY)
    }

    pub fn is_unregistered(&self) -> bool {
        self.has_taint(UNREGISTERED_TAINT_KEY)
    }

    pub fn has_do_not_disrupt(&self) -> bool {
        self.metadata
            .annotations
            .get(DO_NOT_DISRUPT_ANNOTATION)
            .is_some_and(|value| value == "true")
    }
}

impl ApiObject for Node {
    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
