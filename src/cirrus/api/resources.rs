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
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Node and pod resource quantities. CPU is measured in millicores, memory
/// in bytes, pods as a plain count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub pods: i64,
}

impl Resources {
    pub const ZERO: Resources = Resources {
        cpu: 0,
        memory: 0,
        pods: 0,
    };

    pub fn new(cpu: i64, memory: i64, pods: i64) -> Self {
        Resources { cpu, memory, pods }
    }

    /// Convenience constructor for pod requests, which always count as one
    /// pod slot.
    pub fn requests(cpu: i64, memory: i64) -> Self {
        Resources {
            cpu,
            memory,
            pods: 1,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Resources::ZERO
    }

    /// Component-wise `self <= capacity`.
    pub fn fits(&self, capacity: &Resources) -> bool {
        self.cpu <= capacity.cpu && self.memory <= capacity.memory && self.pods <= capacity.pods
    }

    /// Returns true when any component of `usage` exceeds the corresponding
    /// component of `self`.
    pub fn exceeded_by(&self, usage: &Resources) -> Option<String> {
        if usage.cpu > self.cpu {
            return Some(format!("cpu usage {}m exceeds limit {}m", usage.cpu, self.cpu));
        }
        if usage.memory > self.memory {
            return Some(format!(
                "memory usage {} exceeds limit {}",
                usage.memory, self.memory
            ));
        }
        if usage.pods > self.pods {
            return Some(format!("pod usage {} exceeds limit {}", usage.pods, self.pods));
        }
        None
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu: (self.cpu - other.cpu).max(0),
            memory: (self.memory - other.memory).max(0),
            pods: (self.pods - other.pods).max(0),
        }
    }

    /// Component-wise minimum, used to build the conservative capacity of a
    /// virtual node over a feasible instance-type set.
    pub fn min(&self, other: &Resources) -> Resources {
        Resources {
            cpu: self.cpu.min(other.cpu),
            memory: self.memory.min(other.memory),
            pods: self.pods.min(other.pods),
        }
    }

    /// The dominant fractional share of `capacity`, used to order pods for
    /// first-fit-decreasing packing.
    pub fn dominant_share(&self, capacity: &Resources) -> f64 {
        let cpu = ratio(self.cpu, capacity.cpu);
        let memory = ratio(self.memory, capacity.memory);
        cpu.max(memory)
    }
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(self, rhs: Resources) -> Resources {
        Resources {
            cpu: self.cpu + rhs.cpu,
            memory: self.memory + rhs.memory,
            pods: self.pods + rhs.pods,
        }
    }
}

impl AddAssign for Resources {
    fn add_assign(&mut self, rhs: Resources) {
        self.cpu += rhs.cpu;
        self.memory += rhs.memory;
        self.pods += rhs.pods;
    }
}

impl Sum for Resources {
    fn sum<I: Iterator<Item = Resources>>(iter: I) -> Resources {
        iter.fold(Resources::ZERO, |acc, item| acc + item)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={}m memory={} pods={}", self.cpu, self.memory, self.pods)
    }
}
