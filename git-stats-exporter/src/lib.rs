// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Exporter publishing repository statistics as Prometheus metrics.
//!
//! Every watched repository resource is reconciled periodically: the
//! repository summary, open pull requests and all issues are fetched from
//! the hosting API, aggregated into a snapshot and published as gauges plus
//! an issue-close duration histogram. The resource status records the start
//! of the last successful cycle, which bounds the closed issues observed by
//! the next one.

pub mod aggregate;
pub mod client;
pub mod config;
pub mod controller;
pub mod credential;
pub mod error;
pub mod exporter;
pub mod publisher;
pub mod resource;
pub mod retry;
pub mod scheduler;
pub mod slug;

#[cfg(test)]
mod testing;

pub use aggregate::{FirstSyncPolicy, RepoMetricsSnapshot, SyncWindow, aggregate};
pub use client::{ApiFactory, GitHubApi, GitHubApiFactory, MetricsClient, RepositoryApi};
pub use config::{ExporterConfig, WatchEntry, load_config, parse_config};
pub use controller::{ReconcileOutcome, ReconcileSettings, Reconciler, SyncPhase};
pub use credential::{Credential, SecretStore, resolve_credential};
pub use error::{Error, io_error};
pub use publisher::{RepoLabels, RepoMetrics};
pub use resource::{InMemoryResourceStore, ResourceKey, ResourceStore};
pub use scheduler::Scheduler;
