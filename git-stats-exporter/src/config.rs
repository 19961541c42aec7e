// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Configuration document of the exporter.
//!
//! The YAML document carries the exporter settings, the secrets that supply
//! API tokens and the watched repository resources. [`parse_config`]
//! validates the whole document up front so the daemon never starts with a
//! resource it cannot reconcile.

use std::{collections::BTreeSet, fs, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    aggregate::FirstSyncPolicy,
    client::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE, GitHubApiFactory},
    controller::ReconcileSettings,
    credential::{ConfigSecretStore, TokenSource},
    error::{Error, io_error},
    resource::{InMemoryResourceStore, RepoSpec, ResourceKey},
    retry::RetryConfig,
    slug::resource_name,
};

/// Namespace of resources and secrets that do not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

const NAME_PATTERN: &str = r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$";
const OWNER_PATTERN: &str = r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,38})$";
const REPO_PATTERN: &str = r"^[A-Za-z0-9_.-]{1,100}$";

/// Root configuration document.
///
/// # Examples
///
/// ```
/// use git_stats_exporter::config::parse_config;
///
/// let yaml = r#"
/// repositories:
///   - owner: acme
///     repo: widgets
/// "#;
/// let config = parse_config(yaml,).expect("valid configuration",);
/// assert_eq!(config.watches().expect("watches")[0].key.to_string(), "default/acme-widgets");
/// ```
#[derive(Debug, Clone, Deserialize, Serialize,)]
pub struct ExporterConfig
{
    #[serde(default)]
    pub settings:     Settings,
    #[serde(default)]
    pub secrets:      Vec<SecretEntry,>,
    #[serde(default)]
    pub repositories: Vec<RepositoryEntry,>,
}

/// Exporter-wide settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize,)]
#[serde(default)]
pub struct Settings
{
    /// Address of the scrape endpoint.
    pub listen:                     SocketAddr,
    pub resync_interval_secs:       u64,
    /// Per-request timeout of anonymous cycles; zero disables it.
    pub anonymous_timeout_secs:     u64,
    pub authenticated_timeout_secs: Option<u64,>,
    pub page_size:                  u8,
    pub max_pages:                  u32,
    /// Upper bound of concurrently running cycles.
    pub workers:                    usize,
    /// Base URI of a GitHub Enterprise instance.
    pub api_base:                   Option<String,>,
    pub first_sync:                 FirstSyncPolicy,
    pub retry:                      RetryConfig,
}

impl Default for Settings
{
    fn default() -> Self
    {
        Self {
            listen:                     SocketAddr::from(([0, 0, 0, 0], 8080,),),
            resync_interval_secs:       300,
            anonymous_timeout_secs:     15,
            authenticated_timeout_secs: None,
            page_size:                  DEFAULT_PAGE_SIZE,
            max_pages:                  DEFAULT_MAX_PAGES,
            workers:                    4,
            api_base:                   None,
            first_sync:                 FirstSyncPolicy::default(),
            retry:                      RetryConfig::default(),
        }
    }
}

/// Named secret supplying the `token` entry from one source.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize,)]
pub struct SecretEntry
{
    #[serde(default)]
    pub namespace: Option<String,>,
    pub name:      String,
    /// Environment variable holding the token.
    #[serde(default)]
    pub env:       Option<String,>,
    /// File holding the token.
    #[serde(default)]
    pub file:      Option<PathBuf,>,
}

impl SecretEntry
{
    fn namespace(&self,) -> &str
    {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE,)
    }

    fn source(&self,) -> Result<TokenSource, Error,>
    {
        match (&self.env, &self.file,) {
            (Some(variable,), None,) => Ok(TokenSource::Env(variable.clone(),),),
            (None, Some(path,),) => Ok(TokenSource::File(path.clone(),),),
            _ => Err(Error::validation(format!(
                "secret \"{}/{}\" must set exactly one of `env` or `file`",
                self.namespace(),
                self.name
            ),),),
        }
    }
}

/// Watched repository resource as written by the operator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize,)]
pub struct RepositoryEntry
{
    #[serde(default)]
    pub namespace:      Option<String,>,
    /// Resource name; derived from owner and repository when absent.
    #[serde(default)]
    pub name:           Option<String,>,
    pub owner:          String,
    #[serde(alias = "repository")]
    pub repo:           String,
    #[serde(default, alias = "credentialRef")]
    pub credential_ref: Option<String,>,
}

/// Normalized and validated repository resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize,)]
pub struct WatchEntry
{
    pub key:  ResourceKey,
    pub spec: RepoSpec,
}

struct Patterns
{
    name:  Regex,
    owner: Regex,
    repo:  Regex,
}

impl Patterns
{
    fn compile() -> Result<Self, Error,>
    {
        let compile = |pattern: &str| {
            Regex::new(pattern,)
                .map_err(|error| Error::validation(format!("invalid name pattern: {error}"),),)
        };
        Ok(Self {
            name: compile(NAME_PATTERN,)?, owner: compile(OWNER_PATTERN,)?, repo: compile(REPO_PATTERN,)?,
        },)
    }
}

impl ExporterConfig
{
    /// Returns the validated watch list in document order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for empty lists, malformed names and
    /// duplicate resource keys.
    pub fn watches(&self,) -> Result<Vec<WatchEntry,>, Error,>
    {
        if self.repositories.is_empty() {
            return Err(Error::validation("configuration must list at least one repository",),);
        }

        let patterns = Patterns::compile()?;
        let mut seen = BTreeSet::new();
        let mut watches = Vec::with_capacity(self.repositories.len(),);

        for (index, entry,) in self.repositories.iter().enumerate() {
            let watch = normalize_repository(index, entry, &patterns,)?;
            if !seen.insert(watch.key.clone(),) {
                return Err(Error::validation(format!("duplicate repository resource \"{}\"", watch.key),),);
            }
            watches.push(watch,);
        }

        Ok(watches,)
    }

    /// Builds the secret store backed by the configured sources.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed or duplicate secrets.
    pub fn secret_store(&self,) -> Result<ConfigSecretStore, Error,>
    {
        let patterns = Patterns::compile()?;
        let mut seen = BTreeSet::new();
        let mut store = ConfigSecretStore::new();

        for entry in &self.secrets {
            let namespace = entry.namespace();
            check_name(&patterns, "secret namespace", namespace,)?;
            check_name(&patterns, "secret name", &entry.name,)?;
            if !seen.insert((namespace.to_owned(), entry.name.clone(),),) {
                return Err(Error::validation(format!(
                    "duplicate secret \"{namespace}/{}\"",
                    entry.name
                ),),);
            }
            store.insert(namespace, &entry.name, entry.source()?,);
        }

        Ok(store,)
    }

    /// Seeds a resource store with every watched repository.
    ///
    /// # Errors
    ///
    /// Propagates validation failures of [`watches`](Self::watches).
    pub fn resource_store(&self,) -> Result<InMemoryResourceStore, Error,>
    {
        let store = InMemoryResourceStore::new();
        for watch in self.watches()? {
            store.apply(watch.key, watch.spec,);
        }
        Ok(store,)
    }

    pub fn api_factory(&self,) -> GitHubApiFactory
    {
        GitHubApiFactory::new(self.settings.api_base.clone(),)
    }

    /// Translates the settings into reconciliation knobs.
    pub fn reconcile_settings(&self,) -> ReconcileSettings
    {
        let settings = &self.settings;
        ReconcileSettings {
            resync_interval:       Duration::from_secs(settings.resync_interval_secs,),
            anonymous_timeout:     (settings.anonymous_timeout_secs > 0)
                .then(|| Duration::from_secs(settings.anonymous_timeout_secs,),),
            authenticated_timeout: settings
                .authenticated_timeout_secs
                .filter(|secs| *secs > 0,)
                .map(Duration::from_secs,),
            page_size:             settings.page_size,
            max_pages:             settings.max_pages,
            first_sync:            settings.first_sync,
            status_retry:          ReconcileSettings::default().status_retry,
        }
    }

    /// Validates every section of the document.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::Validation`] encountered.
    pub fn validate(&self,) -> Result<(), Error,>
    {
        self.settings.validate()?;
        self.secret_store()?;
        self.watches()?;
        Ok((),)
    }
}

impl Settings
{
    fn validate(&self,) -> Result<(), Error,>
    {
        if self.resync_interval_secs == 0 {
            return Err(Error::validation("settings.resync_interval_secs must be positive",),);
        }
        if !(1..=100).contains(&self.page_size,) {
            return Err(Error::validation(format!(
                "settings.page_size must be within 1..=100, got {}",
                self.page_size
            ),),);
        }
        if self.max_pages == 0 {
            return Err(Error::validation("settings.max_pages must be positive",),);
        }
        if self.workers == 0 {
            return Err(Error::validation("settings.workers must be positive",),);
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::validation("settings.retry.max_attempts must be positive",),);
        }
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            return Err(Error::validation("settings.retry.backoff_factor must be at least 1.0",),);
        }
        if self.api_base.as_deref().is_some_and(|base| base.trim().is_empty(),) {
            return Err(Error::validation("settings.api_base must not be blank",),);
        }
        Ok((),)
    }
}

fn check_name(patterns: &Patterns, what: &str, value: &str,) -> Result<(), Error,>
{
    if patterns.name.is_match(value,) {
        Ok((),)
    } else {
        Err(Error::validation(format!(
            "{what} \"{value}\" must be a lowercase alphanumeric label of at most 63 characters"
        ),),)
    }
}

fn normalize_repository(
    index: usize,
    entry: &RepositoryEntry,
    patterns: &Patterns,
) -> Result<WatchEntry, Error,>
{
    let owner = entry.owner.trim();
    let repo = entry.repo.trim();
    if !patterns.owner.is_match(owner,) {
        return Err(Error::validation(format!("repositories[{index}]: invalid owner \"{owner}\""),),);
    }
    if !patterns.repo.is_match(repo,) || repo == "." || repo == ".." {
        return Err(Error::validation(format!(
            "repositories[{index}]: invalid repository name \"{repo}\""
        ),),);
    }

    let namespace = entry.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE,);
    let name = match &entry.name {
        Some(name,) => name.clone(),
        None => resource_name(owner, repo,).ok_or_else(|| {
            Error::validation(format!("repositories[{index}]: unable to derive a resource name"),)
        },)?,
    };
    check_name(patterns, "resource namespace", namespace,)?;
    check_name(patterns, "resource name", &name,)?;

    let credential_ref = match entry.credential_ref.as_deref().map(str::trim,) {
        None | Some("",) => None,
        Some(reference,) => {
            check_name(patterns, "credential reference", reference,)?;
            Some(reference.to_owned(),)
        }
    };

    Ok(WatchEntry {
        key:  ResourceKey::new(namespace, name,),
        spec: RepoSpec {
            owner: owner.to_owned(), repo: repo.to_owned(), credential_ref,
        },
    },)
}

/// Parses and validates a configuration document.
///
/// # Errors
///
/// Returns [`Error::Parse`] for malformed YAML and [`Error::Validation`] for
/// semantically invalid documents.
pub fn parse_config(contents: &str,) -> Result<ExporterConfig, Error,>
{
    let config: ExporterConfig = serde_yaml::from_str(contents,)?;
    config.validate()?;
    Ok(config,)
}

/// Loads and validates the configuration document at `path`.
///
/// # Errors
///
/// Returns [`Error::Io`] when the file cannot be read, otherwise the errors
/// of [`parse_config`].
pub fn load_config(path: &Path,) -> Result<ExporterConfig, Error,>
{
    let contents = fs::read_to_string(path,).map_err(|source| io_error(path, source,),)?;
    parse_config(&contents,)
}
