// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Prometheus series published for every watched repository.
//!
//! [`RepoMetrics`] owns the metric families and registers them with an
//! explicitly constructed [`Registry`]; the same registry is handed to the
//! scrape endpoint. Each family serializes writes per label set internally,
//! so cycles of different repositories never interfere.

use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge, histogram::Histogram},
    registry::Registry,
};

use crate::aggregate::RepoMetricsSnapshot;

/// Bucket boundaries of the issue-close histogram, in minutes: one hour,
/// one day, one, two, four, eight and sixteen weeks.
pub const CLOSE_DURATION_BUCKETS: [f64; 7] =
    [60.0, 1_440.0, 10_080.0, 20_160.0, 40_320.0, 80_640.0, 161_280.0];

/// Label set partitioning all series.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet,)]
pub struct RepoLabels
{
    pub owner: String,
    pub repo:  String,
}

impl RepoLabels
{
    pub fn new(owner: impl Into<String,>, repo: impl Into<String,>,) -> Self
    {
        Self {
            owner: owner.into(), repo: repo.into(),
        }
    }
}

/// The gauges published per repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum GaugeKind
{
    OpenIssues,
    OpenPullRequests,
    Stars,
    Forks,
    Subscribers,
}

impl GaugeKind
{
    pub const ALL: [Self; 5] =
        [Self::OpenIssues, Self::OpenPullRequests, Self::Stars, Self::Forks, Self::Subscribers];

    /// Registered series name.
    pub fn name(self,) -> &'static str
    {
        match self {
            Self::OpenIssues => "repo_open_issues",
            Self::OpenPullRequests => "repo_open_pull_requests",
            Self::Stars => "repo_stars",
            Self::Forks => "repo_forks",
            Self::Subscribers => "repo_subscribers",
        }
    }

    fn help(self,) -> &'static str
    {
        match self {
            Self::OpenIssues => "Number of open issues",
            Self::OpenPullRequests => "Number of open pull requests",
            Self::Stars => "Number of stars",
            Self::Forks => "Number of forks",
            Self::Subscribers => "Number of subscribers",
        }
    }
}

/// Name of the issue-close duration histogram.
pub const CLOSE_DURATION_SERIES: &str = "repo_issue_close_duration";

/// Metric families of the exporter.
pub struct RepoMetrics
{
    open_issues:          Family<RepoLabels, Gauge,>,
    open_pull_requests:   Family<RepoLabels, Gauge,>,
    stars:                Family<RepoLabels, Gauge,>,
    forks:                Family<RepoLabels, Gauge,>,
    subscribers:          Family<RepoLabels, Gauge,>,
    issue_close_duration: Family<RepoLabels, Histogram,>,
}

impl RepoMetrics
{
    /// Creates the families and registers them with `registry`.
    pub fn new(registry: &mut Registry,) -> Self
    {
        let metrics = Self {
            open_issues:          Family::default(),
            open_pull_requests:   Family::default(),
            stars:                Family::default(),
            forks:                Family::default(),
            subscribers:          Family::default(),
            issue_close_duration: Family::new_with_constructor(|| {
                Histogram::new(CLOSE_DURATION_BUCKETS.iter().copied(),)
            },),
        };

        for kind in GaugeKind::ALL {
            registry.register(kind.name(), kind.help(), metrics.gauge_family(kind,).clone(),);
        }
        registry.register(
            CLOSE_DURATION_SERIES,
            "Duration from issue open to close in minutes",
            metrics.issue_close_duration.clone(),
        );

        metrics
    }

    fn gauge_family(&self, kind: GaugeKind,) -> &Family<RepoLabels, Gauge,>
    {
        match kind {
            GaugeKind::OpenIssues => &self.open_issues,
            GaugeKind::OpenPullRequests => &self.open_pull_requests,
            GaugeKind::Stars => &self.stars,
            GaugeKind::Forks => &self.forks,
            GaugeKind::Subscribers => &self.subscribers,
        }
    }

    /// Overwrites a gauge for `labels`.
    pub fn set_gauge(&self, kind: GaugeKind, labels: &RepoLabels, value: u64,)
    {
        let value = i64::try_from(value,).unwrap_or(i64::MAX,);
        self.gauge_family(kind,).get_or_create(labels,).set(value,);
    }

    /// Current gauge value for `labels`, zero when never set.
    pub fn gauge_value(&self, kind: GaugeKind, labels: &RepoLabels,) -> i64
    {
        self.gauge_family(kind,).get_or_create(labels,).get()
    }

    /// Records one issue-close duration for `labels`.
    pub fn observe_close_duration(&self, labels: &RepoLabels, minutes: f64,)
    {
        self.issue_close_duration.get_or_create(labels,).observe(minutes,);
    }

    /// Publishes a snapshot: all gauges are overwritten, every close duration
    /// is appended to the histogram.
    pub fn publish(&self, labels: &RepoLabels, snapshot: &RepoMetricsSnapshot,)
    {
        self.set_gauge(GaugeKind::OpenIssues, labels, snapshot.open_issues,);
        self.set_gauge(GaugeKind::OpenPullRequests, labels, snapshot.open_pull_requests,);
        self.set_gauge(GaugeKind::Stars, labels, snapshot.stars,);
        self.set_gauge(GaugeKind::Forks, labels, snapshot.forks,);
        self.set_gauge(GaugeKind::Subscribers, labels, snapshot.subscribers,);
        for minutes in snapshot.close_duration_minutes() {
            self.observe_close_duration(labels, minutes,);
        }
    }
}
