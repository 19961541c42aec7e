// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Declarative "watch this repository" resources and the store seam the
//! reconciler consumes.
//!
//! The reconciler only ever reads a resource by key and writes its status.
//! Status is owned by the reconciler and is written only after a complete,
//! successful cycle. The in-memory store mirrors the semantics of an
//! object store with optimistic concurrency: every write bumps the resource
//! version, spec writes additionally bump the generation and notify
//! subscribers, status writes notify nobody.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Error;

/// Status value written after a successful cycle.
pub const SYNCHRONIZED: &str = "Synchronized";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Identifies a watched repository resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,)]
pub struct ResourceKey
{
    /// Namespace the resource and its credential live in.
    pub namespace: String,
    /// Resource name, unique within the namespace.
    pub name:      String,
}

impl ResourceKey
{
    /// Creates a key from namespace and name.
    pub fn new(namespace: impl Into<String,>, name: impl Into<String,>,) -> Self
    {
        Self {
            namespace: namespace.into(), name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey
{
    fn fmt(&self, f: &mut fmt::Formatter<'_,>,) -> fmt::Result
    {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired state: which remote repository to watch and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct RepoSpec
{
    /// Owner organization or user on the hosting service.
    pub owner:          String,
    /// Repository name.
    #[serde(alias = "name")]
    pub repo:           String,
    /// Name of a secret in the same namespace holding a `token` key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String,>,
}

/// Observed state written by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize,)]
pub struct RepoStatus
{
    /// `Synchronized` after the first successful cycle, unset before.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state:          Option<String,>,
    /// Start time of the last successful cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc,>,>,
}

impl RepoStatus
{
    /// Status recorded after a successful cycle that started at `at`.
    pub fn synchronized(at: DateTime<Utc,>,) -> Self
    {
        Self {
            state: Some(SYNCHRONIZED.to_owned(),), last_synced_at: Some(at,),
        }
    }
}

/// A watched repository object as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize,)]
pub struct WatchedRepository
{
    pub key:              ResourceKey,
    /// Incremented on every spec change.
    pub generation:       u64,
    /// Incremented on every write, spec or status.
    pub resource_version: u64,
    pub spec:             RepoSpec,
    pub status:           RepoStatus,
}

/// Change notification published by a [`ResourceStore`].
#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum ResourceEvent
{
    /// The resource was created or its spec changed.
    Applied(ResourceKey,),
    /// The resource was removed.
    Deleted(ResourceKey,),
}

/// Store of watched repository resources.
#[async_trait]
pub trait ResourceStore: Send + Sync
{
    /// Lists all resource keys currently present.
    async fn list(&self,) -> Result<Vec<ResourceKey,>, Error,>;

    /// Fetches a resource by key; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ResourceKey,) -> Result<Option<WatchedRepository,>, Error,>;

    /// Replaces the status of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] when the stored resource version differs
    /// from `expected_version` and [`Error::Store`] when the resource no
    /// longer exists.
    async fn update_status(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        status: RepoStatus,
    ) -> Result<WatchedRepository, Error,>;

    /// Subscribes to spec change notifications.
    fn subscribe(&self,) -> broadcast::Receiver<ResourceEvent,>;
}

/// Process-local [`ResourceStore`] fed from configuration.
pub struct InMemoryResourceStore
{
    objects: Mutex<BTreeMap<ResourceKey, WatchedRepository,>,>,
    events:  broadcast::Sender<ResourceEvent,>,
}

impl Default for InMemoryResourceStore
{
    fn default() -> Self
    {
        let (events, _,) = broadcast::channel(EVENT_CHANNEL_CAPACITY,);
        Self {
            objects: Mutex::new(BTreeMap::new(),), events,
        }
    }
}

impl InMemoryResourceStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Creates or updates the spec of a resource.
    ///
    /// Subscribers are notified only when the spec actually changed, which
    /// keeps no-op re-applies from triggering extra cycles.
    pub fn apply(&self, key: ResourceKey, spec: RepoSpec,) -> WatchedRepository
    {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner,);
        let (object, changed,) = match objects.get_mut(&key,) {
            Some(existing,) if existing.spec == spec => (existing.clone(), false,),
            Some(existing,) => {
                existing.spec = spec;
                existing.generation += 1;
                existing.resource_version += 1;
                (existing.clone(), true,)
            }
            None => {
                let created = WatchedRepository {
                    key: key.clone(),
                    generation: 1,
                    resource_version: 1,
                    spec,
                    status: RepoStatus::default(),
                };
                objects.insert(key.clone(), created.clone(),);
                (created, true,)
            }
        };
        drop(objects,);

        if changed {
            let _ = self.events.send(ResourceEvent::Applied(key,),);
        }
        object
    }

    /// Removes a resource, returning whether it existed.
    pub fn delete(&self, key: &ResourceKey,) -> bool
    {
        let removed = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .remove(key,)
            .is_some();
        if removed {
            let _ = self.events.send(ResourceEvent::Deleted(key.clone(),),);
        }
        removed
    }
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore
{
    async fn list(&self,) -> Result<Vec<ResourceKey,>, Error,>
    {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner,);
        Ok(objects.keys().cloned().collect(),)
    }

    async fn get(&self, key: &ResourceKey,) -> Result<Option<WatchedRepository,>, Error,>
    {
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner,);
        Ok(objects.get(key,).cloned(),)
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        expected_version: u64,
        status: RepoStatus,
    ) -> Result<WatchedRepository, Error,>
    {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner,);
        let object = objects
            .get_mut(key,)
            .ok_or_else(|| Error::store(format!("resource {key} not found"),),)?;
        if object.resource_version != expected_version {
            return Err(Error::Conflict {
                key: key.to_string(),
            },);
        }
        object.status = status;
        object.resource_version += 1;
        Ok(object.clone(),)
    }

    fn subscribe(&self,) -> broadcast::Receiver<ResourceEvent,>
    {
        self.events.subscribe()
    }
}
