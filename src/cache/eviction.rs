//! Eviction scoring.
//!
//! Each entry gets a retention score combining recency, age and frequency:
//!
//! ```text
//! score = 0.3 * access_count * ACCESS_WEIGHT - 0.4 * idle - 0.3 * age
//! ```
//!
//! with `idle` and `age` in seconds. Lower scores are evicted first, so a
//! frequently reused old entry outlives a stale, rarely used new one. Eviction
//! stops once the projected size is at most [`EVICTION_TARGET_RATIO`] of the
//! budget.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::index::CacheEntry;

/// Fraction of the size budget eviction shrinks the cache to.
pub const EVICTION_TARGET_RATIO: f64 = 0.7;

/// Seconds of idleness one recorded access is worth.
pub const ACCESS_WEIGHT_SECS: f64 = 3600.0;

const IDLE_WEIGHT: f64 = 0.4;
const AGE_WEIGHT: f64 = 0.3;
const FREQUENCY_WEIGHT: f64 = 0.3;

/// Retention score of `entry` at `now`. Higher means keep longer.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn retention_score(entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
    let idle = seconds_since(entry.last_accessed_at, now);
    let age = seconds_since(entry.created_at, now);
    FREQUENCY_WEIGHT * entry.access_count as f64 * ACCESS_WEIGHT_SECS
        - IDLE_WEIGHT * idle
        - AGE_WEIGHT * age
}

/// Byte size eviction shrinks to for a budget of `max_bytes`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#[must_use]
pub fn target_bytes(max_bytes: u64) -> u64 {
    (max_bytes as f64 * EVICTION_TARGET_RATIO) as u64
}

/// Picks the keys to evict so that `incoming` more bytes fit.
///
/// Returns nothing when `current + incoming` is within `max_bytes`. Otherwise
/// entries are removed lowest score first until the projected size is at most
/// [`target_bytes`].
pub fn select_victims<'a>(
    entries: impl IntoIterator<Item = &'a CacheEntry>,
    incoming: u64,
    max_bytes: u64,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut scored: Vec<(f64, &CacheEntry)> = entries
        .into_iter()
        .map(|entry| (retention_score(entry, now), entry))
        .collect();

    let mut total: u64 = scored.iter().map(|(_, e)| e.size_bytes).sum();
    if total.saturating_add(incoming) <= max_bytes {
        return Vec::new();
    }

    scored.sort_by(|(a_score, a), (b_score, b)| {
        a_score
            .partial_cmp(b_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
            .then_with(|| a.key.cmp(&b.key))
    });

    let target = target_bytes(max_bytes);
    let mut victims = Vec::new();
    for (_, entry) in scored {
        if total.saturating_add(incoming) <= target {
            break;
        }
        total = total.saturating_sub(entry.size_bytes);
        victims.push(entry.key.clone());
    }
    victims
}

#[allow(clippy::cast_precision_loss)]
fn seconds_since(then: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - then).num_milliseconds().max(0) as f64 / 1000.0
}
