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

use serde::Serialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Environment prefix for every recognized option.
const ENV_PREFIX: &str = "CIRRUS_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureGates {
    pub drift: bool,
}

impl Default for FeatureGates {
    fn default() -> Self {
        FeatureGates { drift: true }
    }
}

/// Operator options. Defaults are overridden by `CIRRUS_*` environment
/// variables, which are in turn overridden by command-line flags.
#[derive(Debug, Clone, Serialize)]
pub struct Options {
    pub service_name: String,
    pub metrics_port: u16,
    pub health_probe_port: u16,
    pub webhook_port: u16,
    pub kube_client_qps: u32,
    pub kube_client_burst: u32,
    pub enable_leader_election: bool,
    /// Memory ceiling hint in bytes; negative means unset.
    pub memory_limit: i64,
    pub log_level: String,
    pub log_format: String,
    #[serde(with = "humantime_serde")]
    pub batch_max_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub batch_idle_duration: Duration,
    pub feature_gates: FeatureGates,
}

mod humantime_serde {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            service_name: "cirrus".to_string(),
            metrics_port: 8000,
            health_probe_port: 8081,
            webhook_port: 8443,
            kube_client_qps: 200,
            kube_client_burst: 300,
            enable_leader_election: true,
            memory_limit: -1,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            batch_max_duration: Duration::from_secs(10),
            batch_idle_duration: Duration::from_secs(1),
            feature_gates: FeatureGates::default(),
        }
    }
}

impl Options {
    /// Defaults layered with whatever `CIRRUS_*` variables are set.
    pub fn from_env() -> Options {
        let mut options = Options::default();
        options.apply_env(|key| env::var(key).ok());
        options
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        let lookup = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        if let Some(value) = lookup("SERVICE_NAME") {
            self.service_name = value;
        }
        parse_into(&lookup("METRICS_PORT"), &mut self.metrics_port);
        parse_into(&lookup("HEALTH_PROBE_PORT"), &mut self.health_probe_port);
        parse_into(&lookup("WEBHOOK_PORT"), &mut self.webhook_port);
        parse_into(&lookup("KUBE_CLIENT_QPS"), &mut self.kube_client_qps);
        parse_into(&lookup("KUBE_CLIENT_BURST"), &mut self.kube_client_burst);
        parse_into(&lookup("LEADER_ELECTION"), &mut self.enable_leader_election);
        parse_into(&lookup("MEMORY_LIMIT"), &mut self.memory_limit);
        if let Some(value) = lookup("LOG_LEVEL") {
            self.log_level = value;
        }
        if let Some(value) = lookup("LOG_FORMAT") {
            self.log_format = value;
        }
        parse_duration_into(&lookup("BATCH_MAX_DURATION"), &mut self.batch_max_duration);
        parse_duration_into(&lookup("BATCH_IDLE_DURATION"), &mut self.batch_idle_duration);
        if let Some(value) = lookup("FEATURE_GATE_DRIFT") {
            parse_into(&Some(value), &mut self.feature_gates.drift);
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_idle_duration > self.batch_max_duration {
            return Err(format!(
                "batch idle duration {:?} exceeds the window cap {:?}",
                self.batch_idle_duration, self.batch_max_duration
            ));
        }
        if self.kube_client_qps == 0 || self.kube_client_burst == 0 {
            return Err("client QPS and burst must be positive".to_string());
        }
        Ok(())
    }
}

fn parse_into<T: FromStr>(value: &Option<String>, target: &mut T) {
    if let Some(value) = value {
        if let Ok(parsed) = value.parse::<T>() {
            *target = parsed;
        }
    }
}

fn parse_duration_into(value: &Option<String>, target: &mut Duration) {
    if let Some(value) = value {
        if let Ok(parsed) = humantime::parse_duration(value) {
            *target = parsed;
        }
    }
}
