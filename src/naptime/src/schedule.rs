use crate::model::{ScheduleOperation, SleepScheduleSpec};
use controller_core::{Error, Result};

use chrono::{DateTime, FixedOffset, Utc};
use std::str::FromStr;
use std::time::Duration;

/// Floor for the requeue interval so a misconfigured expression cannot turn
/// the reconciler into a busy loop.
pub const MIN_REQUEUE: Duration = Duration::from_secs(1);

/// Used when a schedule has no future occurrence at all (possible with
/// year-bounded expressions).
const FALLBACK_REQUEUE: Duration = Duration::from_secs(3600);

/// The decision of the scheduling calculator for one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleVerdict {
    /// Whether an action is due now.
    pub is_to_execute: bool,
    /// The action the verdict refers to.
    pub operation: ScheduleOperation,
    /// When executing, the occurrence being consumed (to persist as the last
    /// schedule time); otherwise the next upcoming occurrence.
    pub next_schedule: Option<DateTime<Utc>>,
    /// How long until the reconciler should run again.
    pub requeue_after: Duration,
}

enum ScheduleTz {
    Named(chrono_tz::Tz),
    Fixed(FixedOffset),
}

/// Decides whether to act now and computes the next reconciliation deadline.
///
/// The next occurrence of each schedule is computed strictly after the last
/// scheduled time (or the object creation time on the first cycle). The
/// earliest candidate that has already elapsed triggers execution; at most
/// one occurrence is consumed per invocation, so a backlog accumulated while
/// the controller was down is drained one step at a time.
pub fn evaluate(
    spec: &SleepScheduleSpec,
    last_schedule: Option<DateTime<Utc>>,
    created: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<ScheduleVerdict> {
    let tz = parse_time_zone(spec.time_zone.as_deref())?;
    let sleep = parse_cron(&spec.sleep_schedule)?;
    let wake = spec.wake_schedule.as_deref().map(parse_cron).transpose()?;

    let since = last_schedule.unwrap_or(created);
    let mut candidates: Vec<(DateTime<Utc>, ScheduleOperation)> = Vec::new();
    if let Some(at) = next_occurrence(&sleep, &tz, since) {
        candidates.push((at, ScheduleOperation::Sleep));
    }
    if let Some(wake) = &wake {
        if let Some(at) = next_occurrence(wake, &tz, since) {
            candidates.push((at, ScheduleOperation::WakeUp));
        }
    }
    candidates.sort_by_key(|(at, _)| *at);

    // The requeue interval is always measured to the next occurrence in the
    // future, independently of which occurrence is consumed now.
    let mut upcoming = next_occurrence(&sleep, &tz, now);
    if let Some(wake) = &wake {
        upcoming = [upcoming, next_occurrence(wake, &tz, now)]
            .into_iter()
            .flatten()
            .min();
    }

    match candidates.first().copied() {
        Some((at, operation)) if at <= now => Ok(ScheduleVerdict {
            is_to_execute: true,
            operation,
            next_schedule: Some(at),
            requeue_after: upcoming.map_or(FALLBACK_REQUEUE, |next| clamp_requeue(next - now)),
        }),
        Some((at, operation)) => Ok(ScheduleVerdict {
            is_to_execute: false,
            operation,
            next_schedule: Some(at),
            requeue_after: clamp_requeue(at - now),
        }),
        None => Ok(ScheduleVerdict {
            is_to_execute: false,
            operation: ScheduleOperation::Sleep,
            next_schedule: None,
            requeue_after: FALLBACK_REQUEUE,
        }),
    }
}

/// Parses a cron expression, accepting the classic five-field crontab form
/// by prepending a zero seconds field.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let trimmed = expr.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|err| Error::InvalidParameters(err.into()))
}

fn next_occurrence(schedule: &cron::Schedule, tz: &ScheduleTz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match tz {
        ScheduleTz::Named(tz) => schedule
            .after(&after.with_timezone(tz))
            .next()
            .map(|at| at.with_timezone(&Utc)),
        ScheduleTz::Fixed(offset) => schedule
            .after(&after.with_timezone(offset))
            .next()
            .map(|at| at.with_timezone(&Utc)),
    }
}

fn parse_time_zone(tz: Option<&str>) -> Result<ScheduleTz> {
    let Some(tz) = tz else {
        return Ok(ScheduleTz::Named(chrono_tz::Tz::UTC));
    };
    match tz.parse::<chrono_tz::Tz>() {
        Ok(tz) => Ok(ScheduleTz::Named(tz)),
        Err(err) => {
            if let Some(offset) = parse_fixed_offset(tz) {
                Ok(ScheduleTz::Fixed(offset))
            } else {
                Err(Error::InvalidParameters(err.into()))
            }
        }
    }
}

fn parse_fixed_offset(offset: &str) -> Option<FixedOffset> {
    if offset.eq_ignore_ascii_case("Z")
        || offset.eq_ignore_ascii_case("UTC")
        || offset.eq_ignore_ascii_case("GMT")
    {
        return FixedOffset::east_opt(0);
    }
    let offset = if offset.starts_with("UTC") || offset.starts_with("GMT") {
        &offset[3..]
    } else {
        offset
    };

    // Extract the signless part of the offset
    let is_negative = offset.starts_with('-');
    let offset = if is_negative || offset.starts_with('+') {
        &offset[1..]
    } else {
        offset
    };

    // Split the signless offset into hours and minutes
    let mut iter = offset.split(':');
    let hours: i32 = iter.next()?.parse().ok()?;
    let minutes: i32 = iter.next().unwrap_or("0").parse().ok()?;

    let mut total_seconds = hours * 3600 + minutes * 60;
    if is_negative {
        total_seconds = -total_seconds;
    }

    FixedOffset::east_opt(total_seconds)
}

fn clamp_requeue(until: chrono::Duration) -> Duration {
    until.to_std().map_or(MIN_REQUEUE, |d| d.max(MIN_REQUEUE))
}
