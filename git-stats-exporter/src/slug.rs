// SPDX-FileCopyrightText: 2025 RAprogramm <andrey.rozanov.vl@gmail.com>
//
// SPDX-License-Identifier: MIT

//! Derivation of default resource names from repository coordinates.
//!
//! Names contain only lowercase ASCII alphanumerics separated by single
//! hyphens and never exceed [`MAX_NAME_LEN`], so they satisfy the same
//! naming rule as explicitly configured resource names.

/// Longest permitted resource name.
pub const MAX_NAME_LEN: usize = 63;

/// Builds the default name `owner-repo` for a watched repository.
///
/// Returns `None` when neither part contains a usable character.
///
/// # Examples
///
/// ```
/// use git_stats_exporter::slug::resource_name;
///
/// assert_eq!(resource_name("Acme", "widgets.rs").as_deref(), Some("acme-widgets-rs"));
/// ```
pub fn resource_name(owner: &str, repo: &str,) -> Option<String,>
{
    let mut name = String::with_capacity(owner.len() + repo.len() + 1,);
    for part in [owner, repo] {
        push_normalized(&mut name, part,);
    }

    name.truncate(MAX_NAME_LEN,);
    while name.ends_with('-',) {
        name.pop();
    }
    if name.is_empty() { None } else { Some(name,) }
}

fn push_normalized(name: &mut String, part: &str,)
{
    let mut pending_separator = !name.is_empty();
    for candidate in part.trim().chars() {
        if candidate.is_ascii_alphanumeric() {
            if pending_separator && !name.is_empty() {
                name.push('-',);
            }
            name.push(candidate.to_ascii_lowercase(),);
            pending_separator = false;
        } else {
            pending_separator = true;
        }
    }
}
