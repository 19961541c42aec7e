// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
// SPDX-License-Identifier: MIT

//! Credential resolution for watched repositories.
//!
//! A resource either names a secret in its own namespace or accesses the
//! hosting API anonymously. The secret must carry the token under the
//! [`TOKEN_KEY`] entry.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs,
    path::PathBuf,
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use tracing::debug;

use crate::error::Error;

/// Entry of a secret holding the API token.
pub const TOKEN_KEY: &str = "token";

/// Authentication mode resolved once per cycle.
#[derive(Clone, PartialEq, Eq,)]
pub enum Credential
{
    /// Unauthenticated access with the anonymous rate limit.
    Anonymous,
    /// Personal access token bytes exactly as stored in the secret.
    Token(Vec<u8,>,),
}

impl Credential
{
    pub fn is_anonymous(&self,) -> bool
    {
        matches!(self, Self::Anonymous)
    }

    /// Returns the token as a trimmed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Credential`] when the token is not UTF-8 or blank.
    pub fn token(&self,) -> Result<Option<String,>, Error,>
    {
        match self {
            Self::Anonymous => Ok(None,),
            Self::Token(bytes,) => {
                let text = std::str::from_utf8(bytes,)
                    .map_err(|_| Error::credential("token is not valid UTF-8",),)?;
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return Err(Error::credential("token is empty",),);
                }
                Ok(Some(trimmed.to_owned(),),)
            }
        }
    }
}

impl fmt::Debug for Credential
{
    fn fmt(&self, f: &mut fmt::Formatter<'_,>,) -> fmt::Result
    {
        match self {
            Self::Anonymous => f.write_str("Anonymous",),
            Self::Token(_,) => f.write_str("Token(<redacted>)",),
        }
    }
}

/// Opaque secret contents keyed by entry name.
#[derive(Clone, Default, PartialEq, Eq,)]
pub struct Secret
{
    pub data: BTreeMap<String, Vec<u8,>,>,
}

impl Secret
{
    /// Secret with a single [`TOKEN_KEY`] entry.
    pub fn with_token(token: impl Into<Vec<u8,>,>,) -> Self
    {
        let mut data = BTreeMap::new();
        data.insert(TOKEN_KEY.to_owned(), token.into(),);
        Self {
            data,
        }
    }
}

impl fmt::Debug for Secret
{
    fn fmt(&self, f: &mut fmt::Formatter<'_,>,) -> fmt::Result
    {
        f.debug_struct("Secret",).field("keys", &self.data.keys().collect::<Vec<_,>>(),).finish()
    }
}

/// Store providing secrets by namespace and name.
#[async_trait]
pub trait SecretStore: Send + Sync
{
    /// Fetches a secret; `Ok(None)` when it does not exist.
    async fn get(&self, namespace: &str, name: &str,) -> Result<Option<Secret,>, Error,>;
}

/// Resolves the credential for a resource.
///
/// An absent reference yields [`Credential::Anonymous`].
///
/// # Errors
///
/// Returns [`Error::Credential`] when the referenced secret does not exist
/// or carries no non-empty [`TOKEN_KEY`] entry.
pub async fn resolve_credential(
    secrets: &dyn SecretStore,
    namespace: &str,
    credential_ref: Option<&str,>,
) -> Result<Credential, Error,>
{
    let Some(name,) = credential_ref else {
        return Ok(Credential::Anonymous,);
    };

    let secret = secrets
        .get(namespace, name,)
        .await?
        .ok_or_else(|| Error::credential(format!("secret {namespace}/{name} not found"),),)?;

    let token = secret.data.get(TOKEN_KEY,).ok_or_else(|| {
        Error::credential(format!("secret {namespace}/{name} has no `{TOKEN_KEY}` key"),)
    },)?;

    let credential = Credential::Token(token.clone(),);
    credential.token()?;
    debug!(namespace, secret = name, "resolved token credential");
    Ok(credential,)
}

/// [`SecretStore`] holding fixed secrets, used by tests and embedders.
#[derive(Default)]
pub struct InMemorySecretStore
{
    secrets: Mutex<HashMap<(String, String,), Secret,>,>,
}

impl InMemorySecretStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn insert(&self, namespace: &str, name: &str, secret: Secret,)
    {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner,)
            .insert((namespace.to_owned(), name.to_owned(),), secret,);
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore
{
    async fn get(&self, namespace: &str, name: &str,) -> Result<Option<Secret,>, Error,>
    {
        let secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner,);
        Ok(secrets.get(&(namespace.to_owned(), name.to_owned(),),).cloned(),)
    }
}

/// Where a configured secret reads its token from.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum TokenSource
{
    /// Environment variable holding the token.
    Env(String,),
    /// File whose contents are the token.
    File(PathBuf,),
}

/// [`SecretStore`] backed by configuration entries.
///
/// Sources are read at lookup time so a rotated token is picked up by the
/// next cycle. An unset variable or unreadable file yields a secret without
/// the token entry, which fails credential resolution for that cycle only.
#[derive(Debug, Default)]
pub struct ConfigSecretStore
{
    sources: HashMap<(String, String,), TokenSource,>,
}

impl ConfigSecretStore
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn insert(&mut self, namespace: &str, name: &str, source: TokenSource,)
    {
        self.sources.insert((namespace.to_owned(), name.to_owned(),), source,);
    }
}

#[async_trait]
impl SecretStore for ConfigSecretStore
{
    async fn get(&self, namespace: &str, name: &str,) -> Result<Option<Secret,>, Error,>
    {
        let Some(source,) = self.sources.get(&(namespace.to_owned(), name.to_owned(),),) else {
            return Ok(None,);
        };

        let token = match source {
            TokenSource::Env(variable,) => std::env::var_os(variable,)
                .map(|value| value.to_string_lossy().into_owned().into_bytes(),),
            TokenSource::File(path,) => match fs::read(path,) {
                Ok(bytes,) => Some(bytes,),
                Err(error,) => {
                    debug!(path = %path.display(), %error, "token file unreadable");
                    None
                }
            },
        };

        Ok(Some(token.map(Secret::with_token,).unwrap_or_default(),),)
    }
}

#[cfg(test)]
mod tests
{
    use std::io::Write;

    use super::*;

    #[tokio::test]
    async fn absent_reference_is_anonymous()
    {
        let store = InMemorySecretStore::new();
        let credential =
            resolve_credential(&store, "default", None,).await.expect("resolution failed",);
        assert!(credential.is_anonymous());
    }

    #[tokio::test]
    async fn token_is_read_from_referenced_secret()
    {
        let store = InMemorySecretStore::new();
        store.insert("default", "gh-token", Secret::with_token("ghp_secret\n",),);

        let credential = resolve_credential(&store, "default", Some("gh-token",),)
            .await
            .expect("resolution failed",);
        assert_eq!(credential.token().expect("valid token",).as_deref(), Some("ghp_secret"));
    }

    #[tokio::test]
    async fn missing_secret_is_fatal()
    {
        let store = InMemorySecretStore::new();
        let error = resolve_credential(&store, "default", Some("gh-token",),)
            .await
            .expect_err("missing secret must fail",);
        assert!(matches!(error, Error::Credential { .. }));
    }

    #[tokio::test]
    async fn missing_token_key_is_fatal()
    {
        let store = InMemorySecretStore::new();
        let mut secret = Secret::default();
        secret.data.insert("password".to_owned(), b"hunter2".to_vec(),);
        store.insert("default", "gh-token", secret,);

        let error = resolve_credential(&store, "default", Some("gh-token",),)
            .await
            .expect_err("missing key must fail",);
        match error {
            Error::Credential {
                message,
            } => assert!(message.contains("has no `token` key")),
            other => panic!("expected credential error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn secret_in_other_namespace_is_not_visible()
    {
        let store = InMemorySecretStore::new();
        store.insert("other", "gh-token", Secret::with_token("ghp_secret",),);
        let result = resolve_credential(&store, "default", Some("gh-token",),).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn blank_token_is_malformed()
    {
        let store = InMemorySecretStore::new();
        store.insert("default", "gh-token", Secret::with_token("  \n",),);
        let result = resolve_credential(&store, "default", Some("gh-token",),).await;
        assert!(matches!(result, Err(Error::Credential { .. })));
    }

    #[test]
    fn debug_output_redacts_token()
    {
        let credential = Credential::Token(b"ghp_secret".to_vec(),);
        assert_eq!(format!("{credential:?}"), "Token(<redacted>)");
        let secret = Secret::with_token("ghp_secret",);
        assert!(!format!("{secret:?}").contains("ghp_secret"));
    }

    #[tokio::test]
    async fn config_store_reads_token_file()
    {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile",);
        writeln!(file, "ghp_from_file").expect("write token",);

        let mut store = ConfigSecretStore::new();
        store.insert("default", "gh-token", TokenSource::File(file.path().to_path_buf(),),);

        let credential = resolve_credential(&store, "default", Some("gh-token",),)
            .await
            .expect("resolution failed",);
        assert_eq!(credential.token().expect("token",).as_deref(), Some("ghp_from_file"));
    }

    #[tokio::test]
    async fn config_store_unset_variable_lacks_token_key()
    {
        let mut store = ConfigSecretStore::new();
        store.insert(
            "default",
            "gh-token",
            TokenSource::Env("GIT_STATS_EXPORTER_TEST_UNSET_VARIABLE".to_owned(),),
        );

        let secret = store
            .get("default", "gh-token",)
            .await
            .expect("lookup failed",)
            .expect("configured secret must exist",);
        assert!(secret.data.is_empty());
        assert!(store.get("default", "unknown",).await.expect("lookup failed",).is_none());
    }
}
