//! Cache path planning.
//!
//! Pure functions: the same workspace state always yields the same paths in
//! the same order, with duplicates removed (first occurrence wins).

use std::collections::HashSet;

use reqwest::Url;

use crate::models::workspace::WorkspaceState;

/// Broad patterns purged by the periodic stale-cache cleanup.
pub const STALE_PATHS: [&str; 5] = [
    "/builds/*",
    "/workspaces/*",
    "/multiplayer/*",
    "/api/workspace/*/status",
    "/api/multiplayer/*/status",
];

/// Every cache path a workspace may own.
#[must_use]
pub fn paths_for(workspace: &WorkspaceState) -> Vec<String> {
    let ws = &workspace.id;
    let company = &workspace.company_id;

    let mut paths = vec![
        format!("/builds/{company}/{ws}/*"),
        format!("/workspaces/{company}/{ws}/*"),
        format!("/api/workspace/{ws}/*"),
        format!("/api/workspace/{ws}/status"),
        format!("/api/workspace/{ws}/preview"),
    ];

    if let Some(path) = workspace
        .published_url
        .as_deref()
        .and_then(published_path)
    {
        paths.push(path);
    }

    paths.extend(session_paths(&workspace.session_ids));
    dedup(paths)
}

/// The pair of paths owned by each session, de-duplicated.
#[must_use]
pub fn session_paths(session_ids: &[String]) -> Vec<String> {
    dedup(
        session_ids
            .iter()
            .flat_map(|sid| {
                [
                    format!("/multiplayer/session/{sid}/*"),
                    format!("/api/multiplayer/session/{sid}/*"),
                ]
            })
            .collect(),
    )
}

/// Broad stale-cache patterns.
#[must_use]
pub fn stale_paths() -> Vec<String> {
    STALE_PATHS.iter().map(|p| (*p).to_owned()).collect()
}

/// Path component of a published URL plus `*`.
///
/// Relative URLs are resolved against a dummy origin. An absolute URL with
/// no path after its authority (`https://host`) contributes nothing; an
/// explicit `/` yields `/*`.
fn published_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let url = match Url::parse(raw) {
        Ok(url) => {
            if !has_path_component(raw) {
                return None;
            }
            url
        }
        Err(_) => Url::parse("http://localhost/")
            .and_then(|base| base.join(raw))
            .ok()?,
    };
    if url.cannot_be_a_base() {
        return None;
    }
    Some(format!("{}*", url.path()))
}

/// Whether an absolute URL spells out a path after its authority.
fn has_path_component(raw: &str) -> bool {
    let Some((_, rest)) = raw.split_once("://") else {
        return true;
    };
    rest.find(['/', '?', '#'])
        .is_some_and(|idx| rest[idx..].starts_with('/'))
}

fn dedup(paths: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(paths.len());
    paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}
