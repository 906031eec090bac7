use bigdecimal::BigDecimal;
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::str::FromStr;
use tracing::warn;

use super::error_log::{ErrorLogger, ErrorStage};
use super::fetcher::{RawNavEntry, SchemeFetch};
use crate::database_ops::nav_store::{NavRow, NAV_SOURCE};

/// Upstream's fixed date format (e.g. "27-06-2024").
pub const NAV_DATE_FORMAT: &str = "%d-%m-%Y";

const SCHEME_NAME_MAX: usize = 500;
const CATEGORY_MAX: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct CleanParams {
    pub only_latest: bool,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

/// Turns a raw fetch into normalized rows. Malformed entries are skipped
/// individually — one bad record never costs the scheme its good ones.
/// Range filters are inclusive and apply even to the `only_latest` pick.
pub fn clean_nav_history(
    fetch: &SchemeFetch,
    scheme_id: &str,
    params: &CleanParams,
    errors: &ErrorLogger,
) -> Vec<NavRow> {
    if fetch.entries.is_empty() {
        return Vec::new();
    }

    // Upstream serves newest-first: the latest pick is the head, and the
    // reversed walk yields rows in chronological ascending order.
    let selected: Vec<&RawNavEntry> = if params.only_latest {
        fetch.entries.iter().take(1).collect()
    } else {
        fetch.entries.iter().rev().collect()
    };

    let aum = parse_aum(fetch.meta.aum.as_deref());
    let scheme_name = clamp_opt(fetch.meta.scheme_name.as_deref(), SCHEME_NAME_MAX);
    let category = clamp_opt(fetch.meta.scheme_category.as_deref(), CATEGORY_MAX);

    let mut seen_dates: HashSet<NaiveDate> = HashSet::new();
    let mut rows = Vec::with_capacity(selected.len());

    for (idx, entry) in selected.iter().enumerate() {
        let Some(date_str) = entry.date.as_deref().map(str::trim).filter(|s| !s.is_empty())
        else {
            skip_entry(errors, scheme_id, idx, entry, "missing date");
            continue;
        };
        let Some(nav_str) = entry.nav.as_deref().map(str::trim).filter(|s| !s.is_empty()) else {
            skip_entry(errors, scheme_id, idx, entry, "missing nav");
            continue;
        };

        let date = match NaiveDate::parse_from_str(date_str, NAV_DATE_FORMAT) {
            Ok(d) => d,
            Err(e) => {
                skip_entry(
                    errors,
                    scheme_id,
                    idx,
                    entry,
                    &format!("invalid date {date_str:?}: {e}"),
                );
                continue;
            }
        };

        if params.since.is_some_and(|s| date < s) {
            continue;
        }
        if params.until.is_some_and(|u| date > u) {
            continue;
        }
        // First occurrence wins; later duplicates for the same date drop.
        if seen_dates.contains(&date) {
            continue;
        }

        let nav = match BigDecimal::from_str(nav_str) {
            Ok(n) => n,
            Err(e) => {
                skip_entry(
                    errors,
                    scheme_id,
                    idx,
                    entry,
                    &format!("invalid nav {nav_str:?}: {e}"),
                );
                continue;
            }
        };

        seen_dates.insert(date);
        rows.push(NavRow {
            scheme_id: scheme_id.to_string(),
            date,
            nav,
            aum: aum.clone(),
            scheme_name: scheme_name.clone(),
            category: category.clone(),
            source: NAV_SOURCE,
            updated_at: Utc::now(),
        });
    }

    rows
}

fn skip_entry(
    errors: &ErrorLogger,
    scheme_id: &str,
    idx: usize,
    entry: &RawNavEntry,
    reason: &str,
) {
    warn!(scheme = scheme_id, index = idx, reason, "skipping malformed nav entry");
    errors.log(
        scheme_id,
        ErrorStage::Clean,
        Some(&format!("{entry:?}")),
        "parse",
        reason,
    );
}

/// Upstream uses "NA" and empty strings for missing AUM; anything that
/// fails to parse becomes absent rather than an error.
fn parse_aum(raw: Option<&str>) -> Option<BigDecimal> {
    let raw = raw?.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("na") {
        return None;
    }
    BigDecimal::from_str(raw).ok()
}

fn clamp_opt(raw: Option<&str>, max_chars: usize) -> Option<String> {
    let t = raw?.trim();
    if t.is_empty() {
        return None;
    }
    if t.chars().count() <= max_chars {
        Some(t.to_string())
    } else {
        Some(t.chars().take(max_chars).collect())
    }
}
