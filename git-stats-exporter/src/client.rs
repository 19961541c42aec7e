// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

/// Remote metrics client for the repository hosting API.
///
/// Fetches the repository summary together with the complete paginated
/// lists of open pull requests and issues. Any failure aborts the whole fetch;
/// partial results are never returned.
use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::{Octocrab, Page};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{credential::Credential, error::Error};

/// Items requested per page.
pub const DEFAULT_PAGE_SIZE: u8 = 30;
/// Pages fetched per collection before the listing counts as non-terminating.
pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// Repository level counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize,)]
pub struct RepoSummary
{
    #[serde(default)]
    pub stargazers_count:  u64,
    #[serde(default)]
    pub forks_count:       u64,
    #[serde(default)]
    pub subscribers_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,)]
#[serde(rename_all = "lowercase")]
pub enum IssueState
{
    Open,
    Closed,
}

/// Issue as returned by the issue listing.
///
/// The listing also returns pull requests; those carry a `pull_request`
/// object and are dropped by [`MetricsClient::fetch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize,)]
pub struct RawIssue
{
    pub number:       u64,
    pub state:        IssueState,
    pub created_at:   DateTime<Utc,>,
    #[serde(default)]
    pub closed_at:    Option<DateTime<Utc,>,>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value,>,
}

impl RawIssue
{
    pub fn is_pull_request(&self,) -> bool
    {
        self.pull_request.is_some()
    }
}

/// Pull request as returned by the open pull request listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize,)]
pub struct RawPullRequest
{
    pub number: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, PartialEq,)]
pub struct ListPage<T,>
{
    pub items:     Vec<T,>,
    /// Page number to request next; `None` or `Some(0)` ends the listing.
    pub next_page: Option<u32,>,
}

/// Raw access to the hosting API, one request per call.
#[async_trait]
pub trait RepositoryApi: Send + Sync
{
    async fn repository(&self, owner: &str, repo: &str,) -> Result<RepoSummary, Error,>;

    async fn open_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u8,
    ) -> Result<ListPage<RawPullRequest,>, Error,>;

    /// Lists issues in all states, pull requests included.
    async fn issues(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u8,
    ) -> Result<ListPage<RawIssue,>, Error,>;
}

/// Builds API handles for a resolved credential.
pub trait ApiFactory: Send + Sync
{
    /// # Errors
    ///
    /// Returns [`Error::Credential`] for malformed tokens and
    /// [`Error::Remote`] when the HTTP client cannot be constructed.
    fn connect(&self, credential: &Credential,) -> Result<Arc<dyn RepositoryApi,>, Error,>;
}

#[derive(Debug, Serialize,)]
struct ListParams<'a,>
{
    state:    &'a str,
    per_page: u8,
    page:     u32,
}

/// [`RepositoryApi`] backed by octocrab.
#[derive(Clone,)]
pub struct GitHubApi
{
    octocrab: Octocrab,
}

impl GitHubApi
{
    pub fn new(octocrab: Octocrab,) -> Self
    {
        Self {
            octocrab,
        }
    }

    async fn list<T,>(
        &self,
        route: String,
        params: &ListParams<'_,>,
    ) -> Result<ListPage<T,>, Error,>
    where
        T: serde::de::DeserializeOwned,
    {
        let page: Page<T,> = self
            .octocrab
            .get(&route, Some(params,),)
            .await
            .map_err(|e| Error::remote(format!("GET {route} page {} failed: {e}", params.page),),)?;

        let next_page = page.next.as_ref().and_then(|uri| page_from_query(uri.query(),),);
        Ok(ListPage {
            items: page.items, next_page,
        },)
    }
}

#[async_trait]
impl RepositoryApi for GitHubApi
{
    async fn repository(&self, owner: &str, repo: &str,) -> Result<RepoSummary, Error,>
    {
        let route = format!("/repos/{owner}/{repo}");
        self.octocrab
            .get(&route, None::<&(),>,)
            .await
            .map_err(|e| Error::remote(format!("GET {route} failed: {e}"),),)
    }

    async fn open_pull_requests(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u8,
    ) -> Result<ListPage<RawPullRequest,>, Error,>
    {
        let params = ListParams {
            state: "open", per_page, page,
        };
        self.list(format!("/repos/{owner}/{repo}/pulls"), &params,).await
    }

    async fn issues(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u8,
    ) -> Result<ListPage<RawIssue,>, Error,>
    {
        let params = ListParams {
            state: "all", per_page, page,
        };
        self.list(format!("/repos/{owner}/{repo}/issues"), &params,).await
    }
}

/// Extracts the `page` parameter from a `Link` target query string.
fn page_from_query(query: Option<&str,>,) -> Option<u32,>
{
    query?
        .split('&',)
        .find_map(|pair| pair.strip_prefix("page=",),)
        .and_then(|value| value.parse().ok(),)
}

/// [`ApiFactory`] producing octocrab clients.
#[derive(Debug, Clone, Default,)]
pub struct GitHubApiFactory
{
    base_uri: Option<String,>,
}

impl GitHubApiFactory
{
    /// `base_uri` overrides `https://api.github.com`, e.g. for GitHub
    /// Enterprise.
    pub fn new(base_uri: Option<String,>,) -> Self
    {
        Self {
            base_uri,
        }
    }
}

impl ApiFactory for GitHubApiFactory
{
    fn connect(&self, credential: &Credential,) -> Result<Arc<dyn RepositoryApi,>, Error,>
    {
        let mut builder = Octocrab::builder();
        if let Some(token,) = credential.token()? {
            builder = builder.personal_token(token,);
        }
        if let Some(base_uri,) = self.base_uri.as_deref() {
            builder = builder
                .base_uri(base_uri,)
                .map_err(|e| Error::validation(format!("invalid api_base {base_uri}: {e}"),),)?;
        }
        let octocrab = builder
            .build()
            .map_err(|e| Error::remote(format!("failed to initialize GitHub client: {e}"),),)?;
        Ok(Arc::new(GitHubApi::new(octocrab,),),)
    }
}

/// Fetches every page of a listing in order.
///
/// Pages are requested strictly sequentially starting at page 1 and their
/// items concatenated in page order. The listing ends when a page reports
/// no next page.
///
/// # Errors
///
/// Propagates the first page error. Returns [`Error::Pagination`] when the
/// next page does not advance past the current one or `max_pages` pages
/// did not reach the end.
pub async fn collect_pages<T, F, Fut,>(
    collection: &'static str,
    max_pages: u32,
    mut fetch_page: F,
) -> Result<Vec<T,>, Error,>
where
    F: FnMut(u32,) -> Fut,
    Fut: Future<Output = Result<ListPage<T,>, Error,>,>,
{
    let mut items = Vec::new();
    let mut page = 1u32;
    let mut fetched = 0u32;

    loop {
        let ListPage {
            items: batch,
            next_page,
        } = fetch_page(page,).await?;
        fetched += 1;
        debug!(collection, page, count = batch.len(), "fetched page");
        items.extend(batch,);

        match next_page {
            None | Some(0,) => return Ok(items,),
            Some(next,) if next <= page || fetched >= max_pages => {
                return Err(Error::Pagination {
                    collection,
                    pages: fetched,
                },);
            }
            Some(next,) => page = next,
        }
    }
}

/// Limits applied to one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub struct FetchOptions
{
    pub page_size:    u8,
    pub max_pages:    u32,
    /// Per-request limit; `None` relies on cancellation alone.
    pub call_timeout: Option<Duration,>,
}

impl Default for FetchOptions
{
    fn default() -> Self
    {
        Self {
            page_size: DEFAULT_PAGE_SIZE, max_pages: DEFAULT_MAX_PAGES, call_timeout: None,
        }
    }
}

/// Everything fetched for one repository in one cycle.
#[derive(Debug, Clone, PartialEq,)]
pub struct RepoData
{
    pub summary:       RepoSummary,
    pub pull_requests: Vec<RawPullRequest,>,
    /// Issues only; pull-request-backed entries are already removed.
    pub issues:        Vec<RawIssue,>,
}

/// Fetches [`RepoData`] through a [`RepositoryApi`].
#[derive(Clone,)]
pub struct MetricsClient
{
    api:     Arc<dyn RepositoryApi,>,
    options: FetchOptions,
}

impl MetricsClient
{
    pub fn new(api: Arc<dyn RepositoryApi,>, options: FetchOptions,) -> Self
    {
        Self {
            api, options,
        }
    }

    /// Fetches summary, open pull requests and issues of `owner/repo`.
    ///
    /// The two listings are paginated independently and concurrently.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `cancel` fires, [`Error::Remote`]
    /// for request failures and timeouts, and [`Error::Pagination`] for
    /// non-terminating listings.
    pub async fn fetch(
        &self,
        owner: &str,
        repo: &str,
        cancel: &CancellationToken,
    ) -> Result<RepoData, Error,>
    {
        let api: &dyn RepositoryApi = self.api.as_ref();
        let per_page = self.options.page_size;
        let max_pages = self.options.max_pages;

        let summary = self.guard(cancel, api.repository(owner, repo,),).await?;

        let pull_requests = collect_pages("pull requests", max_pages, move |page| {
            self.guard(cancel, api.open_pull_requests(owner, repo, page, per_page,),)
        },);
        let issues = async move {
            let all = collect_pages("issues", max_pages, move |page| {
                self.guard(cancel, api.issues(owner, repo, page, per_page,),)
            },)
            .await?;
            Ok::<_, Error,>(
                all.into_iter().filter(|issue| !issue.is_pull_request(),).collect::<Vec<_,>>(),
            )
        };

        let (pull_requests, issues,): (Vec<RawPullRequest,>, Vec<RawIssue,>,) =
            tokio::try_join!(pull_requests, issues)?;

        debug!(
            owner,
            repo,
            pull_requests = pull_requests.len(),
            issues = issues.len(),
            "fetched repository data"
        );

        Ok(RepoData {
            summary, pull_requests, issues,
        },)
    }

    async fn guard<T, Fut,>(&self, cancel: &CancellationToken, request: Fut,) -> Result<T, Error,>
    where
        Fut: Future<Output = Result<T, Error,>,>,
    {
        let limited = async {
            match self.options.call_timeout {
                Some(limit,) => match tokio::time::timeout(limit, request,).await {
                    Ok(result,) => result,
                    Err(_,) => Err(Error::remote(format!(
                        "request timed out after {}ms",
                        limit.as_millis()
                    ),),),
                },
                None => request.await,
            }
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = limited => result,
        }
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path, query_param},
    };

    use super::*;
    use crate::testing::{FakeApi, closed_issue, open_issue, pr_backed_issue};

    fn pages_of(sizes: &[usize],) -> Vec<ListPage<usize,>,>
    {
        let mut next_item = 0usize;
        let total = sizes.len();
        sizes
            .iter()
            .enumerate()
            .map(|(index, size,)| {
                let items = (next_item..next_item + size).collect();
                next_item += size;
                let next_page = if index + 1 < total { Some(index as u32 + 2,) } else { None };
                ListPage {
                    items, next_page,
                }
            },)
            .collect()
    }

    fn run_pages(pages: Vec<ListPage<usize,>,>, max_pages: u32,) -> Result<Vec<usize,>, Error,>
    {
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime",);
        runtime.block_on(collect_pages("items", max_pages, |page| {
            let result = pages
                .get(page as usize - 1,)
                .cloned()
                .ok_or_else(|| Error::remote(format!("page {page} out of range"),),);
            async move { result }
        },),)
    }

    proptest! {
        #[test]
        fn pagination_concatenates_pages_in_order(sizes in proptest::collection::vec(0usize..30, 1..12)) {
            let expected: Vec<usize> = (0..sizes.iter().sum()).collect();
            let items = run_pages(pages_of(&sizes), DEFAULT_MAX_PAGES).expect("pagination failed");
            prop_assert_eq!(items, expected);
        }
    }

    #[test]
    fn zero_next_page_terminates()
    {
        let pages = vec![ListPage {
            items: vec![1, 2,], next_page: Some(0,),
        }];
        assert_eq!(run_pages(pages, 10,).expect("pagination failed",), vec![1, 2]);
    }

    #[test]
    fn stalled_indicator_is_a_pagination_error()
    {
        let requests = AtomicU32::new(0,);
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime",);
        let result = runtime.block_on(collect_pages("issues", 50, |page| {
            requests.fetch_add(1, Ordering::SeqCst,);
            async move {
                Ok(ListPage {
                    items: vec![page], next_page: Some(page,),
                },)
            }
        },),);

        match result {
            Err(Error::Pagination {
                collection,
                pages,
            },) => {
                assert_eq!(collection, "issues");
                assert_eq!(pages, 1);
            }
            other => panic!("expected pagination error, got {other:?}"),
        }
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn page_cap_is_enforced()
    {
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime",);
        let result = runtime.block_on(collect_pages("issues", 5, |page| async move {
            Ok(ListPage {
                items: vec![page], next_page: Some(page + 1,),
            },)
        },),);
        assert!(matches!(result, Err(Error::Pagination { pages: 5, .. })));
    }

    #[test]
    fn page_error_aborts_listing()
    {
        let runtime = tokio::runtime::Builder::new_current_thread().build().expect("runtime",);
        let result: Result<Vec<u32,>, Error,> =
            runtime.block_on(collect_pages("issues", 5, |page| async move {
                if page == 2 {
                    Err(Error::remote("502 Bad Gateway",),)
                } else {
                    Ok(ListPage {
                        items: vec![page], next_page: Some(page + 1,),
                    },)
                }
            },),);
        assert!(matches!(result, Err(Error::Remote { .. })));
    }

    #[test]
    fn page_parameter_is_parsed_from_query()
    {
        assert_eq!(page_from_query(Some("state=all&per_page=30&page=4"),), Some(4));
        assert_eq!(page_from_query(Some("per_page=30"),), None);
        assert_eq!(page_from_query(None,), None);
    }

    #[tokio::test]
    async fn fetch_excludes_pull_request_backed_issues()
    {
        let api = FakeApi::new()
            .with_issue_pages(vec![
                vec![open_issue(1,), pr_backed_issue(2,)],
                vec![closed_issue(3, 0, 120,), pr_backed_issue(4,)],
            ],)
            .with_pull_request_pages(vec![vec![RawPullRequest {
                number: 2,
            }]],);
        let client = MetricsClient::new(Arc::new(api,), FetchOptions::default(),);

        let data = client
            .fetch("acme", "widgets", &CancellationToken::new(),)
            .await
            .expect("fetch failed",);

        let numbers: Vec<u64,> = data.issues.iter().map(|issue| issue.number,).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert!(data.issues.iter().all(|issue| !issue.is_pull_request()));
        assert_eq!(data.pull_requests.len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_returns_no_partial_data()
    {
        let api = FakeApi::new().failing_issues_at_page(2,).with_issue_pages(vec![
            vec![open_issue(1,)],
            vec![open_issue(2,)],
        ],);
        let client = MetricsClient::new(Arc::new(api,), FetchOptions::default(),);

        let result = client.fetch("acme", "widgets", &CancellationToken::new(),).await;
        assert!(matches!(result, Err(Error::Remote { .. })));
    }

    #[tokio::test]
    async fn cancelled_fetch_reports_cancellation()
    {
        let client = MetricsClient::new(Arc::new(FakeApi::new(),), FetchOptions::default(),);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client.fetch("acme", "widgets", &cancel,).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_during_pagination_stops_fetch()
    {
        let api = Arc::new(
            FakeApi::new()
                .with_issue_pages(vec![
                    vec![open_issue(1,)],
                    vec![open_issue(2,)],
                    vec![open_issue(3,)],
                    vec![open_issue(4,)],
                ],)
                .with_latency(Duration::from_millis(50,),),
        );
        let client = MetricsClient::new(api.clone(), FetchOptions::default(),);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(80,),).await;
            trigger.cancel();
        },);

        let result = client.fetch("acme", "widgets", &cancel,).await;

        assert!(matches!(result, Err(Error::Cancelled)), "{result:?}");
        let requests = api.requests();
        assert!(requests >= 2, "cancelled before paging started: {requests}");
        assert!(requests < 6, "every page was fetched: {requests}");
    }

    #[tokio::test]
    async fn slow_request_times_out()
    {
        let api = FakeApi::new().with_latency(Duration::from_millis(200,),);
        let options = FetchOptions {
            call_timeout: Some(Duration::from_millis(10,),), ..FetchOptions::default()
        };
        let client = MetricsClient::new(Arc::new(api,), options,);

        let result = client.fetch("acme", "widgets", &CancellationToken::new(),).await;
        match result {
            Err(Error::Remote {
                message,
            },) => assert!(message.contains("timed out")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn github_api_follows_link_header_pagination()
    {
        let server = MockServer::start().await;
        let base = server.uri();

        Mock::given(method("GET",),)
            .and(path("/repos/acme/widgets",),)
            .respond_with(ResponseTemplate::new(200,).set_body_json(serde_json::json!({
                "stargazers_count": 10,
                "forks_count": 4,
                "subscribers_count": 1
            }),),)
            .mount(&server,)
            .await;

        Mock::given(method("GET",),)
            .and(path("/repos/acme/widgets/issues",),)
            .and(query_param("page", "1",),)
            .respond_with(
                ResponseTemplate::new(200,)
                    .insert_header(
                        "Link",
                        format!(
                            "<{base}/repos/acme/widgets/issues?state=all&per_page=30&page=2>; rel=\"next\""
                        )
                        .as_str(),
                    )
                    .set_body_json(serde_json::json!([
                        {"number": 1, "state": "open", "created_at": "2024-01-01T00:00:00Z"},
                        {"number": 2, "state": "open", "created_at": "2024-01-02T00:00:00Z",
                         "pull_request": {"url": "https://example.invalid/pulls/2"}}
                    ]),),
            )
            .mount(&server,)
            .await;

        Mock::given(method("GET",),)
            .and(path("/repos/acme/widgets/issues",),)
            .and(query_param("page", "2",),)
            .respond_with(ResponseTemplate::new(200,).set_body_json(serde_json::json!([
                {"number": 3, "state": "closed", "created_at": "2024-01-01T00:00:00Z",
                 "closed_at": "2024-01-01T02:00:00Z"}
            ]),),)
            .mount(&server,)
            .await;

        Mock::given(method("GET",),)
            .and(path("/repos/acme/widgets/pulls",),)
            .and(query_param("state", "open",),)
            .respond_with(
                ResponseTemplate::new(200,).set_body_json(serde_json::json!([{"number": 2}]),),
            )
            .mount(&server,)
            .await;

        let api = GitHubApiFactory::new(Some(base,),)
            .connect(&Credential::Anonymous,)
            .expect("client construction failed",);
        let client = MetricsClient::new(api, FetchOptions::default(),);

        let data = client
            .fetch("acme", "widgets", &CancellationToken::new(),)
            .await
            .expect("fetch failed",);

        assert_eq!(data.summary, RepoSummary {
            stargazers_count:  10,
            forks_count:       4,
            subscribers_count: 1,
        });
        let numbers: Vec<u64,> = data.issues.iter().map(|issue| issue.number,).collect();
        assert_eq!(numbers, vec![1, 3]);
        assert_eq!(data.pull_requests, vec![RawPullRequest {
            number: 2
        }]);
    }

    #[tokio::test]
    async fn github_api_surfaces_http_errors()
    {
        let server = MockServer::start().await;
        Mock::given(method("GET",),)
            .and(path("/repos/acme/widgets",),)
            .respond_with(ResponseTemplate::new(404,).set_body_json(serde_json::json!({
                "message": "Not Found",
                "documentation_url": "https://docs.github.com/rest"
            }),),)
            .mount(&server,)
            .await;

        let api = GitHubApiFactory::new(Some(server.uri(),),)
            .connect(&Credential::Anonymous,)
            .expect("client construction failed",);
        let result = api.repository("acme", "widgets",).await;
        assert!(matches!(result, Err(Error::Remote { .. })));
    }

    #[test]
    fn malformed_token_is_rejected_before_connecting()
    {
        let factory = GitHubApiFactory::default();
        let result = factory.connect(&Credential::Token(vec![0xff, 0xfe],),);
        assert!(matches!(result, Err(Error::Credential { .. })));
    }
}
