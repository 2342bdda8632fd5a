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
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequirementOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single scheduling requirement against a label key. Absent labels match
/// `NotIn` and `DoesNotExist`, mirroring node-affinity semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub key: String,
    pub operator: RequirementOperator,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub values: BTreeSet<String>,
}

impl Requirement {
    pub fn in_values<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Requirement {
            key: key.to_string(),
            operator: RequirementOperator::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn not_in<I, S>(key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Requirement {
            key: key.to_string(),
            operator: RequirementOperator::NotIn,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn exists(key: &str) -> Self {
        Requirement {
            key: key.to_string(),
            operator: RequirementOperator::Exists,
            values: BTreeSet::new(),
        }
    }

    pub fn does_not_exist(key: &str) -> Self {
        Requirement {
            key: key.to_string(),
            operator: RequirementOperator::DoesNotExist,
            values: BTreeSet::new(),
        }
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        match self.operator {
            RequirementOperator::In => value.is_some_and(|v| self.values.contains(v)),
            RequirementOperator::NotIn => value.is_none_or(|v| !self.values.contains(v)),
            RequirementOperator::Exists => value.is_some(),
            RequirementOperator::DoesNotExist => value.is_none(),
        }
    }

    /// Merges a requirement for the same key, tightening the constraint.
    fn intersect(&self, other: &Requirement) -> Result<Requirement, RequirementConflict> {
        use RequirementOperator::*;
        debug_assert_eq!(self.key, other.key);
        let conflict = |message: String| RequirementConflict {
            key: self.key.clone(),
            message,
        };
        let merged = match (self.operator, other.operator) {
            (In, In) => {
                let values: BTreeSet<String> =
                    self.values.intersection(&other.values).cloned().collect();
                if values.is_empty() {
                    return Err(conflict("no value satisfies both In constraints".to_string()));
                }
                Requirement {
                    key: self.key.clone(),
                    operator: In,
                    values,
                }
            }
            (In, NotIn) | (NotIn, In) => {
                let (included, excluded) = if self.operator == In {
                    (&self.values, &other.values)
                } else {
                    (&other.values, &self.values)
                };
                let values: BTreeSet<String> =
                    included.difference(excluded).cloned().collect();
                if values.is_empty() {
                    return Err(conflict("all allowed values are excluded".to_string()));
                }
                Requirement {
                    key: self.key.clone(),
                    operator: In,
                    values,
                }
            }
            (In, Exists) | (Exists, In) => {
                let source = if self.operator == In { self } else { other };
                source.clone()
            }
            (In, DoesNotExist) | (DoesNotExist, In) | (Exists, DoesNotExist) | (DoesNotExist, Exists) => {
                return Err(conflict(format!(
                    "{:?} conflicts with {:?}",
                    self.operator, other.operator
                )));
            }
            (NotIn, NotIn) => Requirement {
                key: self.key.clone(),
                operator: NotIn,
                values: self.values.union(&other.values).cloned().collect(),
            },
            (NotIn, Exists) | (Exists, NotIn) => {
                let source = if self.operator == NotIn { self } else { other };
                source.clone()
            }
            (NotIn, DoesNotExist) | (DoesNotExist, NotIn) | (DoesNotExist, DoesNotExist) => {
                Requirement {
                    key: self.key.clone(),
                    operator: DoesNotExist,
                    values: BTreeSet::new(),
                }
            }
            (Exists, Exists) => self.clone(),
        };
        Ok(merged)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequirementConflict {
    pub key: String,
    pub message: String,
}

impl fmt::Display for RequirementConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "incompatible requirements on {}: {}", self.key, self.message)
    }
}

impl std::error::Error for RequirementConflict {}

/// A set of requirements, at most one per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirements(BTreeMap<String, Requirement>);

impl Requirements {
    pub fn new() -> Self {
        Requirements(BTreeMap::new())
    }

    pub fn from_iter<I: IntoIterator<Item = Requirement>>(
        requirements: I,
    ) -> Result<Self, RequirementConflict> {
        let mut set = Requirements::new();
        for requirement in requirements {
            set.add(requirement)?;
        }
        Ok(set)
    }

    /// Builds the `In` requirements equivalent to a plain node selector.
    pub fn from_selector(selector: &BTreeMap<String, String>) -> Self {
        Requirements(
            selector
                .iter()
                .map(|(key, value)| {
                    (
                        key.clone(),
                        Requirement::in_values(key, [value.clone()]),
                    )
                })
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.0.values()
    }

    pub fn add(&mut self, requirement: Requirement) -> Result<(), RequirementConflict> {
        match self.0.get(&requirement.key) {
            Some(existing) => {
                let merged = existing.intersect(&requirement)?;
                self.0.insert(merged.key.clone(), merged);
            }
            None => {
                self.0.insert(requirement.key.clone(), requirement);
            }
        }
        Ok(())
    }

    /// The tightened union of two requirement sets; errors when any key
    /// becomes unsatisfiable.
    pub fn intersect(&self, other: &Requirements) -> Result<Requirements, RequirementConflict> {
        let mut merged = self.clone();
        for requirement in other.iter() {
            merged.add(requirement.clone())?;
        }
        Ok(merged)
    }

    /// Whether a concrete label set satisfies every requirement.
    pub fn matches_labels(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .values()
            .all(|requirement| requirement.matches(labels.get(&requirement.key).map(String::as_str)))
    }

    /// Whether `value` for `key` is permitted; keys without a requirement
    /// are unconstrained.
    pub fn allows(&self, key: &str, value: &str) -> bool {
        match self.0.get(key) {
            Some(requirement) => requirement.matches(Some(value)),
            None => true,
        }
    }
}
