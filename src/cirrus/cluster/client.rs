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

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::RwLock;
use tokio::sync::broadcast;

use crate::cirrus::api::node::Node;
use crate::cirrus::api::nodeclaim::NodeClaim;
use crate::cirrus::api::nodepool::NodePool;
use crate::cirrus::api::object::ApiObject;
use crate::cirrus::api::pod::Pod;

const WATCH_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Orchestrator-style watch event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

#[derive(Debug)]
pub enum ClientError {
    NotFound(String),
    AlreadyExists(String),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound(name) => write!(f, "object {} not found", name),
            ClientError::AlreadyExists(name) => write!(f, "object {} already exists", name),
        }
    }
}

impl Error for ClientError {}

/// A typed object collection with broadcast watch semantics. Deletion is
/// finalizer-gated: objects with finalizers receive a deletion timestamp and
/// disappear only when the last finalizer is removed.
pub struct Store<T: ApiObject> {
    objects: RwLock<HashMap<String, T>>,
    watchers: broadcast::Sender<WatchEvent<T>>,
}

impl<T: ApiObject> Default for Store<T> {
    fn default() -> Self {
        Store::new()
    }
}

impl<T: ApiObject> Store<T> {
    pub fn new() -> Self {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Store {
            objects: RwLock::new(HashMap::new()),
            watchers,
        }
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watchers.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.objects
            .read()
            .expect("store lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list(&self) -> Vec<T> {
        let mut objects: Vec<T> = self
            .objects
            .read()
            .expect("store lock poisoned")
            .values()
            .cloned()
            .collect();
        objects.sort_by(|a, b| a.name().cmp(b.name()));
        objects
    }

    pub fn count(&self) -> usize {
        self.objects.read().expect("store lock poisoned").len()
    }

    pub fn create(&self, mut object: T) -> Result<T, ClientError> {
        let name = object.name().to_string();
        let mut objects = self.objects.write().expect("store lock poisoned");
        if objects.contains_key(&name) {
            return Err(ClientError::AlreadyExists(name));
        }
        if object.metadata().creation_timestamp.is_none() {
            object.metadata_mut().creation_timestamp = Some(Utc::now());
        }
        objects.insert(name, object.clone());
        drop(objects);
        self.publish(WatchEventType::Added, object.clone());
        Ok(object)
    }

    pub fn update(&self, object: T) -> Result<T, ClientError> {
        let name = object.name().to_string();
        let mut objects = self.objects.write().expect("store lock poisoned");
        if !objects.contains_key(&name) {
            return Err(ClientError::NotFound(name));
        }
        objects.insert(name, object.clone());
        drop(objects);
        self.publish(WatchEventType::Modified, object.clone());
        Ok(object)
    }

    /// Create-or-replace, used when the caller does not care which it is.
    pub fn apply(&self, object: T) -> T {
        match self.create(object.clone()) {
            Ok(created) => created,
            Err(_) => self.update(object).expect("object present after create conflict"),
        }
    }

    /// Requests deletion. Objects without finalizers are removed at once;
    /// otherwise the deletion timestamp is set and the object stays until
    /// `remove_finalizer` erases the last gate.
    pub fn delete(&self, name: &str) -> Result<(), ClientError> {
        let mut objects = self.objects.write().expect("store lock poisoned");
        let Some(object) = objects.get_mut(name) else {
            return Err(ClientError::NotFound(name.to_string()));
        };
        if object.metadata().finalizers.is_empty() {
            let removed = objects.remove(name).expect("object present");
            drop(objects);
            self.publish(WatchEventType::Deleted, removed);
            return Ok(());
        }
        if object.metadata().deletion_timestamp.is_none() {
            object.metadata_mut().deletion_timestamp = Some(Utc::now());
            let updated = object.clone();
            drop(objects);
            self.publish(WatchEventType::Modified, updated);
        }
        Ok(())
    }

    /// Drops a finalizer; a deleting object loses its last finalizer here
    /// and is erased.
    pub fn remove_finalizer(&self, name: &str, finalizer: &str) -> Result<(), ClientError> {
        let mut objects = self.objects.write().expect("store lock poisoned");
        let Some(object) = objects.get_mut(name) else {
            return Err(ClientError::NotFound(name.to_string()));
        };
        object.metadata_mut().remove_finalizer(finalizer);
        if object.metadata().deletion_timestamp.is_some() && object.metadata().finalizers.is_empty()
        {
            let removed = objects.remove(name).expect("object present");
            drop(objects);
            self.publish(WatchEventType::Deleted, removed);
        } else {
            let updated = object.clone();
            drop(objects);
            self.publish(WatchEventType::Modified, updated);
        }
        Ok(())
    }

    fn publish(&self, event_type: WatchEventType, object: T) {
        // Nobody watching is fine; stores work standalone in tests.
        let _ = self.watchers.send(WatchEvent { event_type, object });
    }
}

/// The orchestrator surface the controller binds to: typed collections for
/// the four object kinds it consumes, each with CRUD and watch.
#[derive(Default)]
pub struct ClusterClient {
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
    pub nodeclaims: Store<NodeClaim>,
    pub nodepools: Store<NodePool>,
}

impl ClusterClient {
    pub fn new() -> Self {
        ClusterClient::default()
    }
}
