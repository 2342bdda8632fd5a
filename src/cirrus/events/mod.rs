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
use std::collections::VecDeque;
use std::sync::Mutex;

const BUFFER_CAPACITY: usize = 256;

/// A user-visible occurrence attached to an object, mirroring orchestrator
/// events: scheduling failures, disruption decisions, lifecycle milestones.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    /// `Kind/name` of the object the event is about.
    pub object: String,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Records events into a bounded ring buffer and the log stream. Emission
/// never blocks a reconcile.
#[derive(Default)]
pub struct EventRecorder {
    buffer: Mutex<VecDeque<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        EventRecorder::default()
    }

    pub fn publish(&self, object: impl Into<String>, reason: &str, message: impl Into<String>) {
        let event = Event {
            object: object.into(),
            reason: reason.to_string(),
            message: message.into(),
            timestamp: Utc::now(),
        };
        log::info!("event {} {}: {}", event.object, event.reason, event.message);
        let mut buffer = self.buffer.lock().expect("event buffer lock poisoned");
        if buffer.len() == BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Most recent events, oldest first.
    pub fn recent(&self) -> Vec<Event> {
        self.buffer
            .lock()
            .expect("event buffer lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Events recorded for one object, oldest first.
    pub fn for_object(&self, object: &str) -> Vec<Event> {
        self.buffer
            .lock()
            .expect("event buffer lock poisoned")
            .iter()
            .filter(|event| event.object == object)
            .cloned()
            .collect()
    }
}
