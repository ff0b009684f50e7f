use std::collections::VecDeque;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use serde::Serialize;

use crate::routines::{RoutineMisfirePolicy, RoutineSchedule, RoutineTriggerType};

/// Upper bound on occurrences walked for a single cron routine in one pass.
/// A year of per-minute firings; anything beyond is counted as dropped.
const MAX_CRON_SCAN: u64 = 366 * 24 * 60;

const CRON_SEARCH_YEARS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("interval_seconds must be > 0")]
    InvalidInterval,
    #[error("invalid cron expression `{expression}`: {detail}")]
    InvalidCron { expression: String, detail: String },
    #[error("unsupported timezone `{timezone}`; use UTC or a fixed offset like +02:00")]
    InvalidTimezone { timezone: String },
}

pub fn parse_timezone(raw: &str) -> Result<FixedOffset, ScheduleError> {
    let invalid = || ScheduleError::InvalidTimezone {
        timezone: raw.to_string(),
    };
    let mut value = raw.trim();
    if value.is_empty()
        || value == "Z"
        || value.eq_ignore_ascii_case("utc")
        || value.eq_ignore_ascii_case("gmt")
    {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }
    for prefix in ["UTC", "utc", "GMT", "gmt"] {
        if let Some(rest) = value.strip_prefix(prefix) {
            value = rest;
            break;
        }
    }
    let (sign, rest) = if let Some(rest) = value.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = value.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(invalid());
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((hours, minutes)) => (hours, minutes),
        None if rest.len() == 4 => rest.split_at(2),
        None if !rest.is_empty() && rest.len() <= 2 => (rest, "0"),
        None => return Err(invalid()),
    };
    let hours = hours.parse::<i32>().map_err(|_| invalid())?;
    let minutes = minutes.parse::<i32>().map_err(|_| invalid())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(invalid());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }
}

/// Five-field cron expression: minute hour day-of-month month day-of-week.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let invalid = |detail: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            detail,
        };
        let fields = expression.split_whitespace().collect::<Vec<_>>();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }
        let minutes = parse_field(fields[0], 0, 59, "minute").map_err(&invalid)?;
        let hours = parse_field(fields[1], 0, 23, "hour").map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], 1, 31, "day-of-month").map_err(&invalid)?;
        let months = parse_field(fields[3], 1, 12, "month").map_err(&invalid)?;
        let mut days_of_week = parse_field(fields[4], 0, 7, "day-of-week").map_err(&invalid)?;
        // 7 is an alias for Sunday.
        if days_of_week.contains(7) {
            days_of_week = FieldSet((days_of_week.0 | 1) & !(1u64 << 7));
        }
        Ok(Self {
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// First matching minute strictly after `after`, in `after`'s offset.
    pub fn next_after(&self, after: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let offset = *after.offset();
        let start = after
            .naive_local()
            .with_second(0)?
            .with_nanosecond(0)?
            .checked_add_signed(Duration::minutes(1))?;
        let limit = start.checked_add_signed(Duration::days(366 * CRON_SEARCH_YEARS))?;
        let mut cursor = start;
        while cursor <= limit {
            let date = cursor.date();
            if !self.months.contains(date.month()) {
                cursor = first_of_next_month(date)?;
                continue;
            }
            if !self.day_matches(date) {
                cursor = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(cursor.hour()) {
                cursor = date
                    .and_hms_opt(cursor.hour(), 0, 0)?
                    .checked_add_signed(Duration::hours(1))?;
                continue;
            }
            if !self.minutes.contains(cursor.minute()) {
                cursor = cursor.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return offset.from_local_datetime(&cursor).single();
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(raw: &str, min: u32, max: u32, name: &str) -> Result<FieldSet, String> {
    let mut bits = 0u64;
    for part in raw.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .map_err(|_| format!("{name}: invalid step `{step}`"))?;
                if step == 0 {
                    return Err(format!("{name}: step must be > 0"));
                }
                (range, step)
            }
            None => (part, 1),
        };
        let number = |value: &str| {
            value
                .parse::<u32>()
                .ok()
                .filter(|value| (min..=max).contains(value))
                .ok_or_else(|| format!("{name}: `{value}` outside {min}-{max}"))
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            let (lo, hi) = (number(lo)?, number(hi)?);
            if lo > hi {
                return Err(format!("{name}: descending range `{range}`"));
            }
            (lo, hi)
        } else {
            let value = number(range)?;
            // `5/15` means every 15 starting at 5.
            if part.contains('/') {
                (value, max)
            } else {
                (value, value)
            }
        };
        let mut value = start;
        while value <= end {
            bits |= 1u64 << value;
            value += step;
        }
    }
    Ok(FieldSet(bits))
}

/// A routine schedule bound to its timezone.
#[derive(Debug, Clone)]
pub enum CompiledSchedule {
    Interval { interval_ms: u64 },
    Cron { expr: CronExpr, offset: FixedOffset },
}

impl CompiledSchedule {
    pub fn compile(schedule: &RoutineSchedule, timezone: &str) -> Result<Self, ScheduleError> {
        let offset = parse_timezone(timezone)?;
        match schedule {
            RoutineSchedule::IntervalSeconds { seconds } => {
                if *seconds == 0 {
                    return Err(ScheduleError::InvalidInterval);
                }
                Ok(Self::Interval {
                    interval_ms: seconds.saturating_mul(1000),
                })
            }
            RoutineSchedule::Cron { expression } => Ok(Self::Cron {
                expr: CronExpr::parse(expression)?,
                offset,
            }),
        }
    }

    pub fn next_after(&self, after_ms: u64) -> Option<u64> {
        match self {
            Self::Interval { interval_ms } => after_ms.checked_add(*interval_ms),
            Self::Cron { expr, offset } => {
                let after = Utc
                    .timestamp_millis_opt(i64::try_from(after_ms).ok()?)
                    .single()?
                    .with_timezone(offset);
                let next = expr.next_after(after)?;
                u64::try_from(next.timestamp_millis()).ok()
            }
        }
    }

    /// Occurrences in `[next_fire_at_ms, now_ms]`, keeping only the newest
    /// `keep` timestamps.
    pub fn due_occurrences(&self, next_fire_at_ms: u64, now_ms: u64, keep: usize) -> DueOccurrences {
        if now_ms < next_fire_at_ms {
            return DueOccurrences {
                total: 0,
                newest: Vec::new(),
                next_fire_at_ms: Some(next_fire_at_ms),
                overdue: false,
            };
        }
        match self {
            Self::Interval { interval_ms } => {
                let interval_ms = (*interval_ms).max(1);
                let total = (now_ms - next_fire_at_ms) / interval_ms + 1;
                let first_kept = total.saturating_sub(keep as u64);
                let newest = (first_kept..total)
                    .map(|idx| next_fire_at_ms + idx * interval_ms)
                    .collect();
                DueOccurrences {
                    total,
                    newest,
                    next_fire_at_ms: next_fire_at_ms.checked_add(total.saturating_mul(interval_ms)),
                    overdue: now_ms - next_fire_at_ms > interval_ms,
                }
            }
            Self::Cron { .. } => {
                let mut newest = VecDeque::with_capacity(keep.min(64));
                let mut total = 0u64;
                let mut overdue = false;
                let mut cursor = Some(next_fire_at_ms);
                while let Some(at) = cursor {
                    if at > now_ms {
                        break;
                    }
                    total += 1;
                    // The oldest occurrence is more than one period late once
                    // the one after it is already in the past.
                    if total == 2 {
                        overdue = at < now_ms;
                    }
                    if keep > 0 {
                        if newest.len() == keep {
                            newest.pop_front();
                        }
                        newest.push_back(at);
                    }
                    if total >= MAX_CRON_SCAN {
                        tracing::warn!(next_fire_at_ms, now_ms, "cron backlog scan capped");
                        cursor = self.next_after(now_ms);
                        break;
                    }
                    cursor = self.next_after(at);
                }
                DueOccurrences {
                    total,
                    newest: newest.into_iter().collect(),
                    next_fire_at_ms: cursor,
                    overdue,
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueOccurrences {
    pub total: u64,
    /// Ascending.
    pub newest: Vec<u64>,
    pub next_fire_at_ms: Option<u64>,
    /// The oldest due occurrence is late by more than one schedule period.
    pub overdue: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRun {
    pub scheduled_for_ms: u64,
    pub trigger_type: RoutineTriggerType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MisfirePlan {
    /// Oldest first.
    pub runs: Vec<PlannedRun>,
    pub dropped: u64,
    pub misfired: bool,
}

/// How many due occurrences are worth retaining for `policy`.
pub fn retained_occurrences(policy: &RoutineMisfirePolicy, max_runs_per_trigger: Option<u32>) -> usize {
    match policy {
        RoutineMisfirePolicy::Skip | RoutineMisfirePolicy::RunOnce => 1,
        RoutineMisfirePolicy::CatchUp { max_runs } => catch_up_limit(*max_runs, max_runs_per_trigger),
    }
}

fn catch_up_limit(max_runs: u32, max_runs_per_trigger: Option<u32>) -> usize {
    let limit = match max_runs_per_trigger {
        Some(budget) => max_runs.min(budget),
        None => max_runs,
    };
    limit.max(1) as usize
}

/// Resolves what to launch for the due occurrences plus any occurrences left
/// over from a failed launch. A routine misfires when its oldest due
/// occurrence is late by more than one period or a failed launch is pending;
/// catch-up keeps the newest and launches them oldest first.
pub fn resolve_misfire(
    policy: &RoutineMisfirePolicy,
    due: &DueOccurrences,
    retry_occurrences: &[u64],
    max_runs_per_trigger: Option<u32>,
) -> MisfirePlan {
    let mut candidates = retry_occurrences
        .iter()
        .copied()
        .chain(due.newest.iter().copied())
        .collect::<Vec<_>>();
    candidates.sort_unstable();
    candidates.dedup();
    let pending = due.total + retry_occurrences.len() as u64;
    if pending == 0 || candidates.is_empty() {
        return MisfirePlan::default();
    }
    let misfired = due.overdue || !retry_occurrences.is_empty();
    if !misfired {
        let runs = candidates
            .iter()
            .map(|scheduled_for_ms| PlannedRun {
                scheduled_for_ms: *scheduled_for_ms,
                trigger_type: RoutineTriggerType::Scheduled,
            })
            .collect::<Vec<_>>();
        return MisfirePlan {
            dropped: pending.saturating_sub(runs.len() as u64),
            runs,
            misfired,
        };
    }
    let (kept, trigger_type) = match policy {
        RoutineMisfirePolicy::Skip => (0, RoutineTriggerType::Scheduled),
        RoutineMisfirePolicy::RunOnce => (1, RoutineTriggerType::RunOnce),
        RoutineMisfirePolicy::CatchUp { max_runs } => (
            catch_up_limit(*max_runs, max_runs_per_trigger).min(candidates.len()),
            RoutineTriggerType::CatchUp,
        ),
    };
    let runs = candidates[candidates.len() - kept..]
        .iter()
        .map(|scheduled_for_ms| PlannedRun {
            scheduled_for_ms: *scheduled_for_ms,
            trigger_type,
        })
        .collect::<Vec<_>>();
    MisfirePlan {
        dropped: pending.saturating_sub(runs.len() as u64),
        runs,
        misfired,
    }
}
