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

/// Label referencing the pool a node claim was launched from.
pub const NODEPOOL_LABEL: &str = "cirrus.io/nodepool";
/// Label carrying the resolved instance type of a launched node.
pub const INSTANCE_TYPE_LABEL: &str = "node.cirrus.io/instance-type";
/// Label carrying the availability zone of a launched node.
pub const ZONE_LABEL: &str = "topology.cirrus.io/zone";
/// Label distinguishing spot from on-demand capacity.
pub const CAPACITY_TYPE_LABEL: &str = "cirrus.io/capacity-type";
/// Topology key identifying a single node.
pub const HOSTNAME_LABEL: &str = "cirrus.io/hostname";

/// Annotation recording the pool template hash a claim was launched with.
pub const NODEPOOL_HASH_ANNOTATION: &str = "cirrus.io/nodepool-hash";
/// Annotation on pods or nodes that opts them out of disruption.
pub const DO_NOT_DISRUPT_ANNOTATION: &str = "cirrus.io/do-not-disrupt";

/// Finalizer gating node-claim deletion on instance teardown.
pub const TERMINATION_FINALIZER: &str = "cirrus.io/termination";

/// Startup taint present until a node is initialized.
pub const UNREGISTERED_TAINT_KEY: &str = "node.cirrus.io/unregistered";
/// Cordon taint applied while a node is being disrupted.
pub const DISRUPTING_TAINT_KEY: &str = "cirrus.io/disrupting";

const RESTRICTED_LABEL_PREFIXES: &[&str] = &["cirrus.io/", "node.cirrus.io/", "topology.cirrus.io/"];

/// Returns an error message when `key` lives in the label space the
/// controller manages itself.
pub fn restricted_label(key: &str) -> Option<String> {
    RESTRICTED_LABEL_PREFIXES
        .iter()
        .find(|prefix| key.starts_with(*prefix))
        .map(|prefix| format!("label key {} uses the restricted prefix {}", key, prefix))
}

/// Minimal qualified-name check applied to label keys.
pub fn is_qualified_name(key: &str) -> bool {
    if key.is_empty() || key.len() > 253 {
        return false;
    }
    let name = key.rsplit('/').next().unwrap_or(key);
    !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

/// Label values may be empty; non-empty values follow the same charset rules
/// as the name portion of a key.
pub fn is_valid_label_value(value: &str) -> bool {
    value.is_empty() || (value.len() <= 63 && is_qualified_name(value))
}

/// Object metadata shared by every API object the controller manages.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(rename = "creationTimestamp", skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    #[serde(rename = "deletionTimestamp", skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        ObjectMeta {
            name: name.into(),
            creation_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        match self.creation_timestamp {
            Some(created) => now - created,
            None => chrono::Duration::zero(),
        }
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotations.contains_key(key)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

/// Accessor implemented by every stored object so generic stores can reach
/// metadata without knowing the concrete type.
pub trait ApiObject: Clone + Send + Sync + 'static {
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    pub effect: TaintEffect,
}

impl Taint {
    pub fn new(key: &str, effect: TaintEffect) -> Self {
        Taint {
            key: key.to_string(),
            value: String::new(),
            effect,
        }
    }

    pub fn disrupting() -> Self {
        Taint::new(DISRUPTING_TAINT_KEY, TaintEffect::NoSchedule)
    }

    pub fn unregistered() -> Self {
        Taint::new(UNREGISTERED_TAINT_KEY, TaintEffect::NoSchedule)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TolerationOperator {
    #[default]
    Equal,
    Exists,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub operator: TolerationOperator,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// An empty key with operator Exists tolerates everything.
    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        match (&self.key, self.operator) {
            (None, TolerationOperator::Exists) => true,
            (None, TolerationOperator::Equal) => false,
            (Some(key), TolerationOperator::Exists) => key == &taint.key,
            (Some(key), TolerationOperator::Equal) => key == &taint.key && self.value == taint.value,
        }
    }
}

/// Returns true when every NoSchedule/NoExecute taint is tolerated.
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    taints
        .iter()
        .filter(|taint| taint.effect != TaintEffect::PreferNoSchedule)
        .all(|taint| tolerations.iter().any(|toleration| toleration.tolerates(taint)))
}
