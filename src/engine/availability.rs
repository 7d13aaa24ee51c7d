//! Free-slot computation and utilization math on sorted interval lists.

use crate::clock::MS_PER_MINUTE;
use crate::model::{Ms, ResourceState, Span};

/// Free intervals of a resource within the query window: the window minus
/// every active booking clamped into it.
pub fn free_spans(rs: &ResourceState, query: &Span) -> Vec<Span> {
    let busy = clamped_active(rs, query);
    subtract_intervals(&[*query], &busy)
}

/// Minutes of the window occupied by active bookings, overlaps merged so
/// a pending and a confirmed booking on the same slot count once.
pub fn busy_minutes(rs: &ResourceState, window: &Span) -> i64 {
    clamped_active(rs, window)
        .iter()
        .map(|s| s.duration_ms() / MS_PER_MINUTE)
        .sum()
}

/// Busy minutes over capacity minutes as a percentage. A zero or negative
/// capacity (no resources in the category) reads as 0, never a divide error.
pub fn utilization_pct(busy_minutes: i64, capacity_minutes: i64) -> f64 {
    if capacity_minutes <= 0 {
        return 0.0;
    }
    busy_minutes as f64 / capacity_minutes as f64 * 100.0
}

/// Whether any active booking covers the instant.
pub fn is_busy_at(rs: &ResourceState, now: Ms) -> bool {
    rs.overlapping(&Span::new(now, now + 1))
        .any(|b| b.status.is_active())
}

fn clamped_active(rs: &ResourceState, window: &Span) -> Vec<Span> {
    let mut busy: Vec<Span> = rs
        .overlapping(window)
        .filter(|b| b.status.is_active())
        .map(|b| {
            Span::new(
                b.span.start.max(window.start),
                b.span.end.min(window.end),
            )
        })
        .collect();
    busy.sort_by_key(|s| s.start);
    merge_overlapping(&busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Subtract sorted disjoint `to_remove` intervals from sorted `base`.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
