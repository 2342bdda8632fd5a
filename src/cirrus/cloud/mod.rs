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
use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::cirrus::api::nodeclaim::NodeClaim;
use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::resources::Resources;

pub mod fake;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CapacityType {
    OnDemand,
    Spot,
}

impl CapacityType {
    pub fn as_label(&self) -> &'static str {
        match self {
            CapacityType::OnDemand => "on-demand",
            CapacityType::Spot => "spot",
        }
    }
}

/// One purchasable variant of an instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offering {
    pub zone: String,
    #[serde(rename = "capacityType")]
    pub capacity_type: CapacityType,
    pub price: f64,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceType {
    pub name: String,
    pub capacity: Resources,
    /// Resources consumed by the host system before workloads land.
    #[serde(default)]
    pub overhead: Resources,
    pub offerings: Vec<Offering>,
}

impl InstanceType {
    pub fn allocatable(&self) -> Resources {
        self.capacity.saturating_sub(&self.overhead)
    }

    pub fn available_offerings(&self) -> impl Iterator<Item = &Offering> {
        self.offerings.iter().filter(|offering| offering.available)
    }

    /// Cheapest available offering price, used for consolidation comparisons.
    pub fn cheapest_price(&self) -> Option<f64> {
        self.available_offerings()
            .map(|offering| offering.price)
            .min_by(|a, b| a.total_cmp(b))
    }
}

/// Snapshot of a launched instance as the cloud provider sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(rename = "instanceType")]
    pub instance_type: String,
    pub zone: String,
    #[serde(rename = "capacityType")]
    pub capacity_type: CapacityType,
    pub price: f64,
    pub capacity: Resources,
    pub allocatable: Resources,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug)]
pub enum CloudError {
    /// The provider cannot currently satisfy the request; retry later.
    InsufficientCapacity(String),
    /// The provider is rate limiting; retry with backoff.
    Throttled(String),
    /// The request itself is malformed; retrying will not help.
    InvalidRequest(String),
    /// The referenced instance does not exist.
    NotFound,
}

impl CloudError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::InsufficientCapacity(_) | CloudError::Throttled(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound)
    }
}

impl Display for CloudError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudError::InsufficientCapacity(message) => {
                write!(f, "insufficient capacity: {}", message)
            }
            CloudError::Throttled(message) => write!(f, "throttled: {}", message),
            CloudError::InvalidRequest(message) => write!(f, "invalid request: {}", message),
            CloudError::NotFound => write!(f, "not found"),
        }
    }
}

impl Error for CloudError {}

/// The capability set the controller binds to. Implementations vary per
/// cloud; the core never reaches past this trait.
pub trait CloudProvider: Send + Sync {
    /// Asynchronously creates an instance satisfying the claim's
    /// requirements and returns the resolved offering.
    fn create(&self, claim: &NodeClaim) -> Result<Instance, CloudError>;

    /// Deletes the backing instance. `NotFound` is reported as an error and
    /// treated as success by callers tearing a node down.
    fn delete(&self, provider_id: &str) -> Result<(), CloudError>;

    fn get(&self, provider_id: &str) -> Result<Instance, CloudError>;

    fn list(&self) -> Result<Vec<Instance>, CloudError>;

    /// Enumerates the offering catalog available to a pool.
    fn instance_types(&self, pool: &NodePool) -> Result<Vec<InstanceType>, CloudError>;

    /// Provider-specific drift signal, combined by logical OR with the
    /// template hash comparison.
    fn is_drifted(&self, claim: &NodeClaim) -> Result<bool, CloudError>;

    fn liveness(&self) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocatable_subtracts_overhead() {
        let instance_type = InstanceType {
            name: "m-large".to_string(),
            capacity: Resources::new(4000, 16 << 30, 110),
            overhead: Resources::new(200, 1 << 30, 10),
            offerings: vec![],
        };
        assert_eq!(
            instance_type.allocatable(),
            Resources::new(3800, 15 << 30, 100)
        );
    }

    #[test]
    fn cheapest_price_ignores_unavailable_offerings() {
        let instance_type = InstanceType {
            name: "m-large".to_string(),
            capacity: Resources::new(4000, 16 << 30, 110),
            overhead: Resources::ZERO,
            offerings: vec![
                Offering {
                    zone: "zone-a".to_string(),
                    capacity_type: CapacityType::Spot,
                    price: 0.10,
                    available: false,
                },
                Offering {
                    zone: "zone-a".to_string(),
                    capacity_type: CapacityType::OnDemand,
                    price: 0.30,
                    available: true,
                },
            ],
        };
        assert_eq!(instance_type.cheapest_price(), Some(0.30));
    }

    #[test]
    fn retryable_error_classification() {
        assert!(CloudError::Throttled("slow down".into()).is_retryable());
        assert!(CloudError::InsufficientCapacity("no spot".into()).is_retryable());
        assert!(!CloudError::InvalidRequest("bad shape".into()).is_retryable());
        assert!(!CloudError::NotFound.is_retryable());
    }
}
