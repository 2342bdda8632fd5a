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

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const NEVER: &str = "Never";

/// A duration that may be the literal `Never`, serialized as a humantime
/// string (`30s`, `12h`) or `"Never"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NillableDuration(pub Option<Duration>);

impl NillableDuration {
    pub fn never() -> Self {
        NillableDuration(None)
    }

    pub fn after(duration: Duration) -> Self {
        NillableDuration(Some(duration))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn duration(&self) -> Option<Duration> {
        self.0
    }
}

impl Default for NillableDuration {
    fn default() -> Self {
        NillableDuration::never()
    }
}

impl fmt::Display for NillableDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(duration) => write!(f, "{}", humantime::format_duration(duration)),
            None => write!(f, "{}", NEVER),
        }
    }
}

impl Serialize for NillableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for NillableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = NillableDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a duration string such as \"30s\" or the literal \"Never\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<NillableDuration, E> {
                if value == NEVER {
                    return Ok(NillableDuration::never());
                }
                humantime::parse_duration(value)
                    .map(NillableDuration::after)
                    .map_err(|err| E::custom(format!("invalid duration {value:?}: {err}")))
            }
        }

        deserializer.deserialize_str(DurationVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_round_trip() {
        let thirty: NillableDuration = serde_json::from_str("\"30s\"").expect("parse 30s");
        assert_eq!(thirty, NillableDuration::after(Duration::from_secs(30)));
        assert_eq!(serde_json::to_string(&thirty).expect("encode"), "\"30s\"");

        let never: NillableDuration = serde_json::from_str("\"Never\"").expect("parse Never");
        assert!(never.is_never());
        assert_eq!(serde_json::to_string(&never).expect("encode"), "\"Never\"");
    }

    #[test]
    fn rejects_garbage() {
        let parsed: Result<NillableDuration, _> = serde_json::from_str("\"later\"");
        assert!(parsed.is_err());
    }
}
