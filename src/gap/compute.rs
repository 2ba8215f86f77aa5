use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use super::{Gap, GapStatus, OPEN_END};
use crate::error::Result;

/// Outcome of folding one pass's processed ids into the previous gap list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GapUpdate {
    /// New ordered gap list, all open.
    pub gaps: Vec<Gap>,
    /// Previous gaps that contained processed ids and were split.
    pub consumed: Vec<Gap>,
    /// Empty gaps past the grace period; their ids are skipped for good.
    pub resolved: Vec<Gap>,
    pub max_seen_id: i64,
}

/// Folds processed ids into the previous gaps.
///
/// A gap holding processed ids is replaced by the holes between them. Holes
/// carved from a bounded gap inherit its create time so their grace period
/// keeps running; holes carved from the head gap start aging at `now`, and a
/// new head begins right after the highest id processed in it.
///
/// A bounded gap with no processed ids is resolved once it is older than
/// `grace` and `recheck(start, end)` reports no committed rows in it.
pub fn compute_gaps(
    previous: &[Gap],
    processed: &BTreeSet<i64>,
    previous_max_seen: i64,
    now: DateTime<Utc>,
    grace: Duration,
    recheck: &mut dyn FnMut(i64, i64) -> Result<i64>,
) -> Result<GapUpdate> {
    let mut update = GapUpdate {
        max_seen_id: previous_max_seen,
        ..GapUpdate::default()
    };

    for gap in previous {
        let ids: Vec<i64> = processed.range(gap.start_id..=gap.end_id).copied().collect();

        if ids.is_empty() {
            if !gap.is_head() && now - gap.create_time >= grace {
                let rows = recheck(gap.start_id, gap.end_id)?;
                if rows == 0 {
                    let mut resolved = gap.clone();
                    resolved.status = GapStatus::Resolved;
                    resolved.last_updated = now;
                    update.resolved.push(resolved);
                    continue;
                }
            }
            let mut kept = gap.clone();
            kept.status = GapStatus::Open;
            update.gaps.push(kept);
            continue;
        }

        let hole_time = if gap.is_head() { now } else { gap.create_time };
        // ids at or below the highest one seen were never issued to this head
        let mut next = if gap.is_head() {
            gap.start_id.max(previous_max_seen + 1)
        } else {
            gap.start_id
        };
        for id in &ids {
            if *id > next {
                update.gaps.push(Gap::new(next, id - 1, hole_time));
            }
            next = next.max(id + 1);
        }
        if gap.is_head() {
            update.gaps.push(Gap::new(next, OPEN_END, now));
        } else if next <= gap.end_id {
            update.gaps.push(Gap::new(next, gap.end_id, hole_time));
        }
        if let Some(max) = ids.last() {
            update.max_seen_id = update.max_seen_id.max(*max);
        }
        update.consumed.push(gap.clone());
    }

    Ok(update)
}
