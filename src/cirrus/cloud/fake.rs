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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use crate::cirrus::api::nodeclaim::NodeClaim;
use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::object::{CAPACITY_TYPE_LABEL, INSTANCE_TYPE_LABEL, ZONE_LABEL};
use crate::cirrus::api::resources::Resources;
use crate::cirrus::cloud::{
    CapacityType, CloudError, CloudProvider, Instance, InstanceType, Offering,
};

/// Deterministic in-memory cloud provider. Serves as the reference provider
/// for local runs and as the test double for every suite that exercises the
/// launch/terminate path.
pub struct FakeCloudProvider {
    catalog: RwLock<Vec<InstanceType>>,
    instances: RwLock<HashMap<String, Instance>>,
    drifted: RwLock<HashSet<String>>,
    create_error: Mutex<Option<(&'static str, bool)>>,
    next_id: AtomicU64,
    alive: AtomicBool,
}

impl FakeCloudProvider {
    pub fn new(catalog: Vec<InstanceType>) -> Self {
        FakeCloudProvider {
            catalog: RwLock::new(catalog),
            instances: RwLock::new(HashMap::new()),
            drifted: RwLock::new(HashSet::new()),
            create_error: Mutex::new(None),
            next_id: AtomicU64::new(1),
            alive: AtomicBool::new(true),
        }
    }

    /// A small default catalog useful for local runs and most tests.
    pub fn with_default_catalog() -> Self {
        FakeCloudProvider::new(default_catalog())
    }

    pub fn set_catalog(&self, catalog: Vec<InstanceType>) {
        *self.catalog.write().expect("catalog lock poisoned") = catalog;
    }

    /// Makes every subsequent create fail with an insufficient-capacity
    /// error until cleared.
    pub fn fail_creates(&self, reason: &'static str) {
        *self.create_error.lock().expect("create error lock poisoned") = Some((reason, false));
    }

    /// Makes every subsequent create fail terminally (invalid request).
    pub fn reject_creates(&self, reason: &'static str) {
        *self.create_error.lock().expect("create error lock poisoned") = Some((reason, true));
    }

    pub fn allow_creates(&self) {
        *self.create_error.lock().expect("create error lock poisoned") = None;
    }

    /// Drops an instance without a delete call, simulating cloud-side loss.
    pub fn forget(&self, provider_id: &str) {
        self.instances
            .write()
            .expect("instances lock poisoned")
            .remove(provider_id);
    }

    pub fn mark_drifted(&self, provider_id: &str) {
        self.drifted
            .write()
            .expect("drift lock poisoned")
            .insert(provider_id.to_string());
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Relaxed);
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().expect("instances lock poisoned").len()
    }

    fn resolve(&self, claim: &NodeClaim) -> Result<(InstanceType, Offering), CloudError> {
        let catalog = self.catalog.read().expect("catalog lock poisoned");
        let requirements = &claim.spec.requirements;
        let mut best: Option<(InstanceType, Offering)> = None;
        for instance_type in catalog.iter() {
            if !requirements.allows(INSTANCE_TYPE_LABEL, &instance_type.name) {
                continue;
            }
            if !claim.spec.resources.fits(&instance_type.allocatable()) {
                continue;
            }
            for offering in instance_type.available_offerings() {
                if !requirements.allows(ZONE_LABEL, &offering.zone)
                    || !requirements.allows(CAPACITY_TYPE_LABEL, offering.capacity_type.as_label())
                {
                    continue;
                }
                let cheaper = best
                    .as_ref()
                    .map(|(_, current)| offering.price < current.price)
                    .unwrap_or(true);
                if cheaper {
                    best = Some((instance_type.clone(), offering.clone()));
                }
            }
        }
        best.ok_or_else(|| {
            CloudError::InsufficientCapacity(format!(
                "no offering satisfies claim {}",
                claim.metadata.name
            ))
        })
    }
}

impl CloudProvider for FakeCloudProvider {
    fn create(&self, claim: &NodeClaim) -> Result<Instance, CloudError> {
        if let Some((reason, terminal)) =
            *self.create_error.lock().expect("create error lock poisoned")
        {
            return Err(if terminal {
                CloudError::InvalidRequest(reason.to_string())
            } else {
                CloudError::InsufficientCapacity(reason.to_string())
            });
        }
        let (instance_type, offering) = self.resolve(claim)?;
        let id = format!("fake://i-{:08}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let labels = BTreeMap::from([
            (INSTANCE_TYPE_LABEL.to_string(), instance_type.name.clone()),
            (ZONE_LABEL.to_string(), offering.zone.clone()),
            (
                CAPACITY_TYPE_LABEL.to_string(),
                offering.capacity_type.as_label().to_string(),
            ),
        ]);
        let instance = Instance {
            id: id.clone(),
            instance_type: instance_type.name.clone(),
            zone: offering.zone.clone(),
            capacity_type: offering.capacity_type,
            price: offering.price,
            capacity: instance_type.capacity,
            allocatable: instance_type.allocatable(),
            labels,
        };
        self.instances
            .write()
            .expect("instances lock poisoned")
            .insert(id, instance.clone());
        Ok(instance)
    }

    fn delete(&self, provider_id: &str) -> Result<(), CloudError> {
        match self
            .instances
            .write()
            .expect("instances lock poisoned")
            .remove(provider_id)
        {
            Some(_) => Ok(()),
            None => Err(CloudError::NotFound),
        }
    }

    fn get(&self, provider_id: &str) -> Result<Instance, CloudError> {
        self.instances
            .read()
            .expect("instances lock poisoned")
            .get(provider_id)
            .cloned()
            .ok_or(CloudError::NotFound)
    }

    fn list(&self) -> Result<Vec<Instance>, CloudError> {
        let mut instances: Vec<Instance> = self
            .instances
            .read()
            .expect("instances lock poisoned")
            .values()
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    fn instance_types(&self, _pool: &NodePool) -> Result<Vec<InstanceType>, CloudError> {
        Ok(self.catalog.read().expect("catalog lock poisoned").clone())
    }

    fn is_drifted(&self, claim: &NodeClaim) -> Result<bool, CloudError> {
        let drifted = self.drifted.read().expect("drift lock poisoned");
        Ok(claim
            .status
            .provider_id
            .as_ref()
            .is_some_and(|id| drifted.contains(id)))
    }

    fn liveness(&self) -> Result<(), CloudError> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(CloudError::Throttled("provider marked unavailable".to_string()))
        }
    }
}

/// Three on-demand/spot shapes spanning the sizes the test scenarios need.
pub fn default_catalog() -> Vec<InstanceType> {
    let zones = ["zone-a", "zone-b"];
    let shapes = [
        ("c-small", Resources::new(2_000, 4 << 30, 58), 0.10),
        ("c-medium", Resources::new(4_000, 8 << 30, 110), 0.20),
        ("c-large", Resources::new(8_000, 16 << 30, 110), 0.40),
    ];
    shapes
        .iter()
        .map(|(name, capacity, price)| InstanceType {
            name: name.to_string(),
            capacity: *capacity,
            overhead: Resources::new(100, 1 << 28, 2),
            offerings: zones
                .iter()
                .flat_map(|zone| {
                    [
                        Offering {
                            zone: zone.to_string(),
                            capacity_type: CapacityType::OnDemand,
                            price: *price,
                            available: true,
                        },
                        Offering {
                            zone: zone.to_string(),
                            capacity_type: CapacityType::Spot,
                            price: price * 0.4,
                            available: true,
                        },
                    ]
                })
                .collect(),
        })
        .collect()
}
