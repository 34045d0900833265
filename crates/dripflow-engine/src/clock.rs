//! Recurring campaign clock — next-run computation for broadcast
//! schedules and due-time computation for sequence step offsets.
//! All evaluation happens in UTC.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};

use dripflow_core::{Schedule, ScheduleKind, SequenceStep, TimeUnit, parse_time_of_day};

/// Next trigger timestamp for a broadcast schedule, strictly after
/// `now`. None once the schedule has ended (past `end_date`, or a
/// `once` schedule that already fired).
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(end) = schedule.end_date
        && end <= now
    {
        return None;
    }

    let candidate = match schedule.kind {
        ScheduleKind::Once => {
            if schedule.start_date > now {
                Some(schedule.start_date)
            } else {
                None
            }
        }
        ScheduleKind::Daily => {
            let (hour, minute) = schedule_time(schedule);
            let mut candidate = at_time(now, hour, minute)?;
            if candidate <= now {
                candidate += Duration::days(1);
            }
            while candidate < schedule.start_date {
                candidate += Duration::days(1);
            }
            Some(candidate)
        }
        ScheduleKind::Weekly => {
            let (hour, minute) = schedule_time(schedule);
            let base = if schedule.start_date > now {
                schedule.start_date
            } else {
                now
            };
            // Scan up to a full week past the base day; ties always
            // resolve to the next occurrence, never "now".
            let mut found = None;
            for offset in 0..=7 {
                let day = base + Duration::days(offset);
                if !schedule
                    .days_of_week
                    .contains(&day.weekday().num_days_from_sunday())
                {
                    continue;
                }
                if let Some(candidate) = at_time(day, hour, minute)
                    && candidate > now
                    && candidate >= schedule.start_date
                {
                    found = Some(candidate);
                    break;
                }
            }
            found
        }
    }?;

    match schedule.end_date {
        Some(end) if candidate > end => None,
        _ => Some(candidate),
    }
}

/// Due time of a sequence step relative to `from` (the previous
/// step's send time, or enrollment time for step 0).
///
/// Minute and hour offsets add directly. Day offsets add calendar
/// days, then pin `time_of_day` when set, rolling one more day
/// forward if the pinned instant is not in the future.
pub fn next_step_due(from: DateTime<Utc>, step: &SequenceStep) -> DateTime<Utc> {
    let value = step.interval.value as i64;
    match step.interval.unit {
        TimeUnit::Minutes => from + Duration::minutes(value),
        TimeUnit::Hours => from + Duration::hours(value),
        TimeUnit::Days => {
            let mut due = from + Duration::days(value);
            if let Some((hour, minute)) = step.time_of_day.as_deref().and_then(parse_time_of_day) {
                due = at_time(due, hour, minute).unwrap_or(due);
                if due <= from {
                    due += Duration::days(1);
                }
            }
            due
        }
    }
}

fn schedule_time(schedule: &Schedule) -> (u32, u32) {
    schedule
        .time_of_day
        .as_deref()
        .and_then(parse_time_of_day)
        .unwrap_or((schedule.start_date.hour(), schedule.start_date.minute()))
}

fn at_time(day: DateTime<Utc>, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    Utc.with_ymd_and_hms(day.year(), day.month(), day.day(), hour, minute, 0)
        .single()
}
