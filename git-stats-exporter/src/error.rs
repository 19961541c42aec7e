#![allow(non_shorthand_field_patterns)]
#![doc = "Error handling primitives shared across the exporter crate."]
// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
//
// SPDX-License-Identifier: MIT

//! The derive emitted by [`masterror::Error`] expands pattern matches that
//! trigger the `non_shorthand_field_patterns` lint. The lint is disabled for
//! the module to keep the generated implementations warning-free.
//!
//! Variants follow the failure classes of a reconciliation cycle: credential
//! resolution, remote API access and pagination anomalies are fatal for the
//! cycle that hit them and leave both metrics and resource status untouched.
//! A deleted resource is not an error at all and never reaches this type.

use std::path::{Path, PathBuf};

/// Unified error type returned by the configuration loader, the
/// reconciliation engine and the CLI.
#[derive(Debug, masterror::Error)]
pub enum Error {
    /// Wraps I/O errors that occur while reading configuration or secret
    /// files.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// Location of the file.
        path:   PathBuf,
        /// Underlying I/O error.
        source: std::io::Error
    },
    /// Wraps YAML decoding errors.
    #[error("failed to parse configuration: {source}")]
    Parse {
        /// Source decoding error from serde_yaml.
        source: serde_yaml::Error
    },
    /// Returned when the configuration violates invariants.
    #[error("invalid configuration: {message}")]
    Validation {
        /// Human readable message describing the validation problem.
        message: String
    },
    /// Wraps JSON encoding and decoding errors.
    #[error("failed to serialize output: {source}")]
    Serialize {
        /// Underlying serialization error.
        source: serde_json::Error
    },
    /// The credential referenced by a resource is missing or malformed.
    #[error("credential resolution failed: {message}")]
    Credential {
        /// Human readable description without secret material.
        message: String
    },
    /// Network, rate-limit or HTTP status failure reported by the hosting
    /// API.
    #[error("remote API request failed: {message}")]
    Remote {
        /// Human readable message describing the failure.
        message: String
    },
    /// The next-page indicator did not terminate.
    #[error("pagination of {collection} did not terminate after {pages} pages")]
    Pagination {
        /// Collection being listed, e.g. `issues`.
        collection: &'static str,
        /// Number of pages fetched before giving up.
        pages:      u32
    },
    /// The cycle was cancelled before publication.
    #[error("reconciliation cycle cancelled")]
    Cancelled,
    /// A status write lost an optimistic-concurrency race.
    #[error("resource {key} was modified concurrently")]
    Conflict {
        /// Rendered resource key.
        key: String
    },
    /// Failure reported by the resource store.
    #[error("resource store error: {message}")]
    Store {
        /// Human readable message describing the failure.
        message: String
    },
    /// Failures of process level services such as the scrape endpoint.
    #[error("service error: {message}")]
    Service {
        /// Human readable message describing the service error.
        message: String
    }
}

impl Error {
    /// Constructs a validation error from the provided displayable value.
    pub fn validation<M>(message: M) -> Self
    where
        M: Into<String>
    {
        Self::Validation {
            message: message.into()
        }
    }

    /// Constructs a credential resolution error.
    pub fn credential<M>(message: M) -> Self
    where
        M: Into<String>
    {
        Self::Credential {
            message: message.into()
        }
    }

    /// Constructs a remote API error.
    pub fn remote<M>(message: M) -> Self
    where
        M: Into<String>
    {
        Self::Remote {
            message: message.into()
        }
    }

    /// Constructs a resource store error.
    pub fn store<M>(message: M) -> Self
    where
        M: Into<String>
    {
        Self::Store {
            message: message.into()
        }
    }

    /// Constructs a service error from the provided displayable value.
    pub fn service<M>(message: M) -> Self
    where
        M: Into<String>
    {
        Self::Service {
            message: message.into()
        }
    }

    /// Returns `true` for failures attributed to the hosting API, including
    /// pagination anomalies.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. } | Self::Pagination { .. })
    }

    /// Returns `true` when the error is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Formats the error for diagnostics without the variant name.
    ///
    /// The returned string matches the [`std::fmt::Display`] implementation.
    pub fn to_display_string(&self) -> String {
        format!("{self}")
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(source: serde_yaml::Error) -> Self {
        Self::Parse {
            source
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialize {
            source
        }
    }
}

/// Creates an [`Error::Io`] variant capturing the failing path and source.
///
/// # Parameters
///
/// * `path` - Location of the file that triggered the error.
/// * `source` - I/O error reported by the operating system.
pub fn io_error(path: &Path, source: std::io::Error) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source
    }
}
