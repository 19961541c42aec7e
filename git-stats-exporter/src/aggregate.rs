// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Pure transformation of fetched repository data into a metrics snapshot.
//!
//! Closed issues contribute an issue-close duration only inside the sync
//! window `(since, until]`. `since` is the previous cycle's `until`, so every
//! close event is attributed to exactly one cycle: issues closed at or before
//! the last sync are never observed again, and an issue that closes while a
//! cycle is fetching falls into the next window instead of being skipped.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::client::{IssueState, RawIssue, RawPullRequest, RepoSummary};

/// What the first cycle of a resource does with issues closed in the past.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,)]
#[serde(rename_all = "snake_case")]
pub enum FirstSyncPolicy
{
    /// Record nothing until a baseline exists.
    #[default]
    Baseline,
    /// Record every issue closed before the first cycle once.
    Backfill,
}

/// Time range whose close events belong to the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub struct SyncWindow
{
    /// `lastSyncedAt` of the resource; `None` before the first success.
    pub since:  Option<DateTime<Utc,>,>,
    /// Start of the current cycle, recorded as the next `lastSyncedAt`.
    pub until:  DateTime<Utc,>,
    pub policy: FirstSyncPolicy,
}

impl SyncWindow
{
    /// Returns `true` when a close at `closed_at` belongs to this window.
    pub fn contains(&self, closed_at: DateTime<Utc,>,) -> bool
    {
        if closed_at > self.until {
            return false;
        }
        match (self.since, self.policy,) {
            (Some(since,), _,) => closed_at > since,
            (None, FirstSyncPolicy::Backfill,) => true,
            (None, FirstSyncPolicy::Baseline,) => false,
        }
    }
}

/// Metrics of one repository for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize,)]
pub struct RepoMetricsSnapshot
{
    pub open_issues:            u64,
    pub open_pull_requests:     u64,
    pub stars:                  u64,
    pub forks:                  u64,
    pub subscribers:            u64,
    /// Lifetime of every issue closed inside the window.
    #[serde(rename = "closed_issue_duration_minutes", serialize_with = "serialize_minutes")]
    pub closed_issue_durations: Vec<TimeDelta,>,
}

impl RepoMetricsSnapshot
{
    /// Close durations in fractional minutes, the histogram unit.
    pub fn close_duration_minutes(&self,) -> impl Iterator<Item = f64,> + '_
    {
        self.closed_issue_durations.iter().map(|duration| minutes(*duration,),)
    }
}

fn minutes(duration: TimeDelta,) -> f64
{
    duration.num_milliseconds() as f64 / 60_000.0
}

fn serialize_minutes<S,>(durations: &[TimeDelta], serializer: S,) -> Result<S::Ok, S::Error,>
where
    S: Serializer,
{
    serializer.collect_seq(durations.iter().map(|duration| minutes(*duration,),),)
}

/// Builds the snapshot for one cycle.
///
/// `issues` must already exclude pull-request-backed entries and
/// `pull_requests` must be the open pull requests only. Lifetimes of issues
/// whose close precedes their creation are clamped to zero.
pub fn aggregate(
    summary: &RepoSummary,
    issues: &[RawIssue],
    pull_requests: &[RawPullRequest],
    window: &SyncWindow,
) -> RepoMetricsSnapshot
{
    let open_issues = issues.iter().filter(|issue| issue.state == IssueState::Open,).count();

    let closed_issue_durations = issues
        .iter()
        .filter(|issue| issue.state == IssueState::Closed,)
        .filter_map(|issue| {
            let closed_at = issue.closed_at?;
            window
                .contains(closed_at,)
                .then(|| (closed_at - issue.created_at).max(TimeDelta::zero(),),)
        },)
        .collect();

    RepoMetricsSnapshot {
        open_issues: open_issues as u64,
        open_pull_requests: pull_requests.len() as u64,
        stars: summary.stargazers_count,
        forks: summary.forks_count,
        subscribers: summary.subscribers_count,
        closed_issue_durations,
    }
}
