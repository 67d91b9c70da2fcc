use chrono::{DateTime, Duration, Utc};

/// How far back the first sync of a connection may reach.
///
/// This is a local policy choice bounding the size of the first sync; the
/// marketplace itself offers no "claims since" filter.
pub const CUTOFF_FLOOR_DAYS: i64 = 7;

/// Earliest `date_created` considered in scope for a tenant.
///
/// `connected_at`, never older than [`CUTOFF_FLOOR_DAYS`] before `now`. A
/// missing or future `connected_at` yields the floor.
pub fn resolve_cutoff(connected_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = now - Duration::days(CUTOFF_FLOOR_DAYS);
    match connected_at {
        Some(connected) if connected <= now => connected.max(floor),
        _ => floor,
    }
}
