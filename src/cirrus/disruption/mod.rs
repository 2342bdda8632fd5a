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

pub mod candidates;
pub mod engine;
pub mod queue;
pub mod validation;

/// Disruption methods in strict priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptionMethod {
    Expiration,
    Drift,
    Emptiness,
    Consolidation,
}

impl DisruptionMethod {
    pub const ORDERED: [DisruptionMethod; 4] = [
        DisruptionMethod::Expiration,
        DisruptionMethod::Drift,
        DisruptionMethod::Emptiness,
        DisruptionMethod::Consolidation,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            DisruptionMethod::Expiration => "expiration",
            DisruptionMethod::Drift => "drift",
            DisruptionMethod::Emptiness => "emptiness",
            DisruptionMethod::Consolidation => "consolidation",
        }
    }
}
