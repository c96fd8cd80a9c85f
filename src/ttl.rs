//! TTL calculator: pure functions computing remaining lifetime from a
//! [`Rule`] and a creation instant (`spec.md` §4.2).

use chrono::{Local, NaiveTime, TimeZone};

use crate::rule::{ExpiresAt, Rule};

const ONE_DAY_MS: i64 = 86_400_000;

/// Current wall-clock time, epoch milliseconds.
pub fn epoch_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `ttl(rule, created, now) -> ms`, per `spec.md` §4.2.
///
/// - Clock skew (`now < created`): `0`.
/// - `expiresIn`: `max(expiresIn - (now - created), 0)`.
/// - `expiresAt`: `0` once more than a day has elapsed since `created`, or
///   once `now` has passed the next occurrence of the daily clock on or
///   after `created`'s calendar day; otherwise the remaining gap.
/// - Neither set: `0`.
pub fn ttl_for_rule<V, C>(rule: &Rule<V, C>, created: i64, now: i64) -> u64 {
    if now < created {
        return 0;
    }

    if let Some(expires_in) = rule.expires_in {
        let elapsed = now - created;
        let remaining = expires_in.as_millis() as i64 - elapsed;
        return remaining.max(0) as u64;
    }

    if let Some(expires_at) = &rule.expires_at {
        if now - created > ONE_DAY_MS {
            return 0;
        }
        let expires = next_occurrence(expires_at, created);
        return if now >= expires { 0 } else { (expires - now) as u64 };
    }

    0
}

/// The next local-civil-time instant matching `expires_at` on or after
/// `created`'s calendar day, rolling over to the following day if the daily
/// clock has already passed by `created` (`spec.md` §4.2 and the DST caveat
/// in §9, which this intentionally does not correct for).
fn next_occurrence(expires_at: &ExpiresAt, created_ms: i64) -> i64 {
    let created_dt = match Local.timestamp_millis_opt(created_ms) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => return created_ms,
    };

    let day = created_dt.date_naive();
    let naive_time = NaiveTime::from_hms_opt(expires_at.hour, expires_at.minute, 0).unwrap_or_default();
    let naive_dt = day.and_time(naive_time);

    let mut expires = match Local.from_local_datetime(&naive_dt) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => created_dt,
    };

    if expires <= created_dt {
        expires += chrono::Duration::days(1);
    }

    expires.timestamp_millis()
}

/// Whether a cached entry is stale under `rule`, per `spec.md` §4.3: "A
/// cached entry is stale iff `staleIn` is configured and `now - stored >=
/// staleIn`."
pub(crate) fn is_stale<V, C>(rule: &Rule<V, C>, stored: i64, ttl: u64, now: i64) -> bool {
    use crate::rule::StaleIn;
    match &rule.stale_in {
        Some(StaleIn::Millis(d)) => now - stored >= d.as_millis() as i64,
        Some(StaleIn::Func(f)) => now - stored >= f(stored, ttl) as i64,
        None => false,
    }
}
