// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Reconciliation of a single watched repository.
//!
//! One cycle resolves the credential, fetches and aggregates the remote
//! data, publishes the snapshot and finally records the cycle start as
//! `lastSyncedAt`. Any failure before publication leaves metrics and status
//! untouched. Timing of the next cycle is returned to the caller, which owns
//! timers and backoff.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    aggregate::{FirstSyncPolicy, SyncWindow, aggregate},
    client::{ApiFactory, DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE, FetchOptions, MetricsClient},
    credential::{Credential, SecretStore, resolve_credential},
    error::Error,
    publisher::{RepoLabels, RepoMetrics},
    resource::{RepoStatus, ResourceKey, ResourceStore},
    retry::{RetryConfig, retry_with_backoff},
};

/// Interval between successful cycles of one resource.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300,);
/// Per-request limit for unauthenticated access.
pub const DEFAULT_ANONYMOUS_TIMEOUT: Duration = Duration::from_secs(15,);

/// Lifecycle of a resource as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize,)]
pub enum SyncPhase
{
    /// Waiting for a worker, or waiting to retry after a failed cycle.
    Pending,
    /// A cycle is running.
    Synchronizing,
    /// The last cycle succeeded.
    Synchronized,
}

/// Knobs of a reconciliation cycle.
#[derive(Debug, Clone, PartialEq,)]
pub struct ReconcileSettings
{
    pub resync_interval:       Duration,
    pub anonymous_timeout:     Option<Duration,>,
    pub authenticated_timeout: Option<Duration,>,
    pub page_size:             u8,
    pub max_pages:             u32,
    pub first_sync:            FirstSyncPolicy,
    /// Retry of status writes that lost an optimistic-concurrency race.
    pub status_retry:          RetryConfig,
}

impl Default for ReconcileSettings
{
    fn default() -> Self
    {
        Self {
            resync_interval:       DEFAULT_RESYNC_INTERVAL,
            anonymous_timeout:     Some(DEFAULT_ANONYMOUS_TIMEOUT,),
            authenticated_timeout: None,
            page_size:             DEFAULT_PAGE_SIZE,
            max_pages:             DEFAULT_MAX_PAGES,
            first_sync:            FirstSyncPolicy::default(),
            status_retry:          RetryConfig {
                initial_delay_ms: 100, ..RetryConfig::default()
            },
        }
    }
}

/// Result of one cycle handed to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub struct ReconcileOutcome
{
    pub success:        bool,
    /// Delay before the next regular cycle; `None` when the resource is gone
    /// and should not be scheduled again.
    pub next_run_after: Option<Duration,>,
}

impl ReconcileOutcome
{
    pub fn requeue(after: Duration,) -> Self
    {
        Self {
            success: true, next_run_after: Some(after,),
        }
    }

    pub fn deleted() -> Self
    {
        Self {
            success: true, next_run_after: None,
        }
    }

    pub fn failed(after: Duration,) -> Self
    {
        Self {
            success: false, next_run_after: Some(after,),
        }
    }
}

type Clock = Arc<dyn Fn() -> DateTime<Utc,> + Send + Sync,>;

/// Reconciles watched repositories one cycle at a time.
///
/// The reconciler holds no per-resource state; the caller guarantees at
/// most one concurrent cycle per key.
pub struct Reconciler
{
    store:    Arc<dyn ResourceStore,>,
    secrets:  Arc<dyn SecretStore,>,
    factory:  Arc<dyn ApiFactory,>,
    metrics:  Arc<RepoMetrics,>,
    settings: ReconcileSettings,
    clock:    Clock,
}

impl Reconciler
{
    pub fn new(
        store: Arc<dyn ResourceStore,>,
        secrets: Arc<dyn SecretStore,>,
        factory: Arc<dyn ApiFactory,>,
        metrics: Arc<RepoMetrics,>,
        settings: ReconcileSettings,
    ) -> Self
    {
        Self {
            store,
            secrets,
            factory,
            metrics,
            settings,
            clock: Arc::new(Utc::now,),
        }
    }

    /// Replaces the wall clock used for `lastSyncedAt`.
    pub fn with_clock<C,>(mut self, clock: C,) -> Self
    where
        C: Fn() -> DateTime<Utc,> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock,);
        self
    }

    pub fn settings(&self,) -> &ReconcileSettings
    {
        &self.settings
    }

    /// Fetch limits for a credential: anonymous access gets the
    /// conservative timeout.
    pub fn fetch_options(&self, credential: &Credential,) -> FetchOptions
    {
        let call_timeout = if credential.is_anonymous() {
            self.settings.anonymous_timeout
        } else {
            self.settings.authenticated_timeout
        };
        FetchOptions {
            page_size: self.settings.page_size, max_pages: self.settings.max_pages, call_timeout,
        }
    }

    /// Runs one reconciliation cycle for `key`.
    ///
    /// A missing resource ends the cycle successfully without requeue.
    ///
    /// # Errors
    ///
    /// Credential, remote, pagination, cancellation and store failures are
    /// returned without having published anything or touched the status,
    /// except for store failures of the final status write.
    pub async fn reconcile(
        &self,
        key: &ResourceKey,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome, Error,>
    {
        let Some(resource,) = self.store.get(key,).await? else {
            debug!(%key, "resource not found, nothing to reconcile");
            return Ok(ReconcileOutcome::deleted(),);
        };
        let started_at = (self.clock)();
        let spec = &resource.spec;

        let credential = resolve_credential(
            self.secrets.as_ref(),
            &key.namespace,
            spec.credential_ref.as_deref(),
        )
        .await?;
        let client =
            MetricsClient::new(self.factory.connect(&credential,)?, self.fetch_options(&credential,),);
        let data = client.fetch(&spec.owner, &spec.repo, cancel,).await?;

        let window = SyncWindow {
            since:  resource.status.last_synced_at,
            until:  started_at,
            policy: self.settings.first_sync,
        };
        let snapshot = aggregate(&data.summary, &data.issues, &data.pull_requests, &window,);

        if cancel.is_cancelled() {
            return Err(Error::Cancelled,);
        }
        self.metrics.publish(&RepoLabels::new(&spec.owner, &spec.repo,), &snapshot,);

        self.write_status(key, resource.resource_version, RepoStatus::synchronized(started_at,),)
            .await?;

        info!(
            %key,
            owner = %spec.owner,
            repo = %spec.repo,
            open_issues = snapshot.open_issues,
            open_pull_requests = snapshot.open_pull_requests,
            closed_issues = snapshot.closed_issue_durations.len(),
            "reconciled \"{}/{}\"",
            spec.owner,
            spec.repo
        );
        Ok(ReconcileOutcome::requeue(self.settings.resync_interval,),)
    }

    /// Runs one cycle and folds failures into the outcome after logging
    /// them.
    pub async fn run_cycle(&self, key: &ResourceKey, cancel: &CancellationToken,) -> ReconcileOutcome
    {
        match self.reconcile(key, cancel,).await {
            Ok(outcome,) => outcome,
            Err(Error::Cancelled,) => {
                info!(%key, "reconciliation cancelled");
                ReconcileOutcome::failed(self.settings.resync_interval,)
            }
            Err(error,) => {
                error!(%key, %error, "reconciliation failed");
                ReconcileOutcome::failed(self.settings.resync_interval,)
            }
        }
    }

    /// Writes the status, re-reading the resource version after a conflict.
    async fn write_status(
        &self,
        key: &ResourceKey,
        resource_version: u64,
        status: RepoStatus,
    ) -> Result<(), Error,>
    {
        let store = self.store.as_ref();
        let expected = &AtomicU64::new(resource_version,);
        let status = &status;

        let attempt = move || async move {
            let version = expected.load(Ordering::SeqCst,);
            match store.update_status(key, version, status.clone(),).await {
                Ok(_,) => Ok((),),
                Err(error,) if error.is_conflict() => match store.get(key,).await? {
                    Some(latest,) => {
                        expected.store(latest.resource_version, Ordering::SeqCst,);
                        Err(error,)
                    }
                    None => {
                        warn!(%key, "resource deleted before status update");
                        Ok((),)
                    }
                },
                Err(error,) => Err(error,),
            }
        };

        retry_with_backoff(
            &self.settings.status_retry,
            "status update",
            Error::is_conflict,
            attempt,
        )
        .await
    }
}
