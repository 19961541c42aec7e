// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! In-memory doubles of the hosting API shared by unit tests.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, TimeZone, Utc};

use crate::{
    client::{
        ApiFactory, IssueState, ListPage, RawIssue, RawPullRequest, RepoSummary, RepositoryApi,
    },
    credential::Credential,
    error::Error,
};

/// Fixed reference instant used by fixtures.
pub fn base_time() -> DateTime<Utc,>
{
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0,).unwrap()
}

pub fn open_issue(number: u64,) -> RawIssue
{
    RawIssue {
        number,
        state: IssueState::Open,
        created_at: base_time() - TimeDelta::days(3,),
        closed_at: None,
        pull_request: None,
    }
}

/// Issue closed `closed_offset_minutes` after [`base_time`] that stayed open
/// for `lifetime_minutes`.
pub fn closed_issue(number: u64, closed_offset_minutes: i64, lifetime_minutes: i64,) -> RawIssue
{
    let closed_at = base_time() + TimeDelta::minutes(closed_offset_minutes,);
    RawIssue {
        number,
        state: IssueState::Closed,
        created_at: closed_at - TimeDelta::minutes(lifetime_minutes,),
        closed_at: Some(closed_at,),
        pull_request: None,
    }
}

pub fn pr_backed_issue(number: u64,) -> RawIssue
{
    RawIssue {
        pull_request: Some(serde_json::json!({ "url": format!("https://example.invalid/pulls/{number}") }),),
        ..open_issue(number,)
    }
}

/// Scripted [`RepositoryApi`].
#[derive(Default)]
pub struct FakeApi
{
    summary:             RepoSummary,
    issue_pages:         Vec<Vec<RawIssue,>,>,
    pull_request_pages:  Vec<Vec<RawPullRequest,>,>,
    fail_issues_at_page: Option<u32,>,
    fail_repository:     bool,
    latency:             Option<Duration,>,
    requests:            AtomicUsize,
}

impl FakeApi
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn with_summary(mut self, summary: RepoSummary,) -> Self
    {
        self.summary = summary;
        self
    }

    pub fn with_issue_pages(mut self, pages: Vec<Vec<RawIssue,>,>,) -> Self
    {
        self.issue_pages = pages;
        self
    }

    pub fn with_pull_request_pages(mut self, pages: Vec<Vec<RawPullRequest,>,>,) -> Self
    {
        self.pull_request_pages = pages;
        self
    }

    pub fn failing_issues_at_page(mut self, page: u32,) -> Self
    {
        self.fail_issues_at_page = Some(page,);
        self
    }

    pub fn failing_repository(mut self,) -> Self
    {
        self.fail_repository = true;
        self
    }

    pub fn with_latency(mut self, latency: Duration,) -> Self
    {
        self.latency = Some(latency,);
        self
    }

    /// Number of API calls served so far.
    pub fn requests(&self,) -> usize
    {
        self.requests.load(Ordering::SeqCst,)
    }

    async fn serve(&self,)
    {
        self.requests.fetch_add(1, Ordering::SeqCst,);
        if let Some(latency,) = self.latency {
            tokio::time::sleep(latency,).await;
        }
    }
}

fn page_of<T: Clone,>(pages: &[Vec<T,>], page: u32,) -> ListPage<T,>
{
    let index = page as usize - 1;
    let items = pages.get(index,).cloned().unwrap_or_default();
    let next_page = if index + 1 < pages.len() { Some(page + 1,) } else { None };
    ListPage {
        items, next_page,
    }
}

#[async_trait]
impl RepositoryApi for FakeApi
{
    async fn repository(&self, _owner: &str, _repo: &str,) -> Result<RepoSummary, Error,>
    {
        self.serve().await;
        if self.fail_repository {
            return Err(Error::remote("403 rate limit exceeded",),);
        }
        Ok(self.summary,)
    }

    async fn open_pull_requests(
        &self,
        _owner: &str,
        _repo: &str,
        page: u32,
        _per_page: u8,
    ) -> Result<ListPage<RawPullRequest,>, Error,>
    {
        self.serve().await;
        Ok(page_of(&self.pull_request_pages, page,),)
    }

    async fn issues(
        &self,
        _owner: &str,
        _repo: &str,
        page: u32,
        _per_page: u8,
    ) -> Result<ListPage<RawIssue,>, Error,>
    {
        self.serve().await;
        if self.fail_issues_at_page == Some(page,) {
            return Err(Error::remote(format!("502 Bad Gateway on page {page}"),),);
        }
        Ok(page_of(&self.issue_pages, page,),)
    }
}

/// [`ApiFactory`] handing out one shared [`FakeApi`] and recording the
/// credentials it was asked to connect with.
pub struct FakeFactory
{
    api:         Arc<FakeApi,>,
    credentials: Mutex<Vec<Credential,>,>,
}

impl FakeFactory
{
    pub fn new(api: FakeApi,) -> Self
    {
        Self {
            api: Arc::new(api,), credentials: Mutex::new(Vec::new(),),
        }
    }

    pub fn api(&self,) -> &FakeApi
    {
        &self.api
    }

    pub fn credentials(&self,) -> Vec<Credential,>
    {
        self.credentials.lock().unwrap_or_else(PoisonError::into_inner,).clone()
    }
}

impl ApiFactory for FakeFactory
{
    fn connect(&self, credential: &Credential,) -> Result<Arc<dyn RepositoryApi,>, Error,>
    {
        self.credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .push(credential.clone(),);
        Ok(self.api.clone(),)
    }
}
