use anyhow::{Context, Result};
use indexmap::IndexSet;
use std::path::Path;
use tracing::info;

use super::fetcher::MfapiClient;

/// Comma list → ordered unique codes. Whitespace and empties are dropped.
pub fn parse_scheme_codes(raw: &str) -> IndexSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// One scheme code per line; blank lines ignored. An unreadable file is a
/// configuration error and must abort the run before any work starts.
pub fn load_scheme_file(path: &Path) -> Result<IndexSet<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("unreadable schemes file {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Resolves the working set: an explicit list wins over a file, which wins
/// over the full upstream catalog.
pub async fn resolve_schemes(
    codes: Option<&str>,
    file: Option<&Path>,
    client: &MfapiClient,
) -> Result<IndexSet<String>> {
    if let Some(raw) = codes {
        let set = parse_scheme_codes(raw);
        if !set.is_empty() {
            return Ok(set);
        }
    }
    if let Some(path) = file {
        return load_scheme_file(path);
    }

    let catalog = client
        .list_schemes()
        .await
        .context("fetching scheme catalog")?;
    info!(schemes = catalog.len(), "loaded scheme catalog");
    Ok(catalog.into_iter().map(|s| s.code).collect())
}
