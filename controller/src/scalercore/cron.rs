use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Local, Timelike};
use cron::Schedule;

/// Splits an optional trailing year off a cron expression and parses
/// the remaining 5 fields as standard cron, with seconds pinned to zero.
pub fn parse_standard_with_year(schedule: &str) -> Result<(Option<i32>, Schedule)> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() > 5 {
        let year = fields[fields.len() - 1]
            .parse::<i32>()
            .with_context(|| format!("Invalid year in schedule `{}`", schedule))?;
        let standard = fields[..fields.len() - 1].join(" ");
        let sched = Schedule::from_str(&format!("0 {}", standard))
            .with_context(|| format!("Invalid schedule `{}`", schedule))?;
        return Ok((Some(year), sched));
    }
    let sched = Schedule::from_str(&format!("0 {}", schedule))
        .with_context(|| format!("Invalid schedule `{}`", schedule))?;
    Ok((None, sched))
}

/// Walks the schedule from one hour before `now` and returns the last
/// firing instant at or before `now` and the first one after it,
/// when the schedule is active at `now`.
///
/// A schedule is active when `now` trails the last firing by at most a
/// minute and either the next firing is at most a minute ahead or the
/// last firing shares the wall-clock minute with `now`. The minute
/// equality covers instants that fall exactly on the final minute of
/// a window, where the next firing is already a day away.
pub(super) fn final_match_and_mismatch(
    schedule: &Schedule,
    year: Option<i32>,
    now: DateTime<Local>,
) -> Option<(DateTime<Local>, DateTime<Local>)> {
    if let Some(year) = year {
        if now.year() != year {
            return None;
        }
    }
    let init = hour_start(now - Duration::hours(1));
    let mut mis_match = init;
    let mut t = init;
    let final_match = loop {
        if t <= now {
            mis_match = t;
            t = schedule.after(&t).next()?;
            continue;
        }
        break t;
    };
    if now - mis_match <= Duration::minutes(1)
        && (final_match - now <= Duration::minutes(1) || mis_match.minute() == now.minute())
    {
        return Some((mis_match, final_match));
    }
    None
}

fn hour_start(t: DateTime<Local>) -> DateTime<Local> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parses_standard_five_field_schedule() -> Result<()> {
        let (year, schedule) = parse_standard_with_year("0-4 9-10 * * *")?;
        assert_eq!(year, None);
        let next = schedule.after(&local(2023, 5, 2, 8, 30, 0)).next().unwrap();
        assert_eq!(next, local(2023, 5, 2, 9, 0, 0));
        Ok(())
    }

    #[test]
    fn parses_year_suffixed_schedule() -> Result<()> {
        let (year, schedule) = parse_standard_with_year("* 20-22 1 10 * 2023")?;
        assert_eq!(year, Some(2023));
        let next = schedule.after(&local(2023, 9, 30, 12, 0, 0)).next().unwrap();
        assert_eq!(next, local(2023, 10, 1, 20, 0, 0));
        Ok(())
    }

    #[test]
    fn year_suffix_survives_a_parse_and_walk_round_trip() -> Result<()> {
        // the year-separated form keeps the same firing instants
        // as the plain form, only guarded to one year
        let (_, plain) = parse_standard_with_year("30 14 * * *")?;
        let (year, guarded) = parse_standard_with_year("30 14 * * * 2023")?;
        assert_eq!(year, Some(2023));
        let from = local(2023, 3, 1, 0, 0, 0);
        let plain_fires: Vec<_> = plain.after(&from).take(5).collect();
        let guarded_fires: Vec<_> = guarded.after(&from).take(5).collect();
        assert_eq!(plain_fires, guarded_fires);
        Ok(())
    }

    #[test]
    fn rejects_malformed_schedules() {
        assert!(parse_standard_with_year("not a schedule").is_err());
        assert!(parse_standard_with_year("0-4 9-10 * * * twenty23").is_err());
    }

    #[test]
    fn window_entry_is_active() {
        let (year, schedule) = parse_standard_with_year("0-4 9-10 * * *").unwrap();
        let now = local(2023, 5, 2, 9, 0, 1);
        let (mis_match, final_match) =
            final_match_and_mismatch(&schedule, year, now).expect("should be active");
        assert_eq!(mis_match, local(2023, 5, 2, 9, 0, 0));
        assert_eq!(final_match, local(2023, 5, 2, 9, 1, 0));
    }

    #[test]
    fn instant_outside_window_is_inactive() {
        let (year, schedule) = parse_standard_with_year("5-59 10-12 * * *").unwrap();
        let now = local(2023, 5, 2, 9, 0, 1);
        assert!(final_match_and_mismatch(&schedule, year, now).is_none());
    }

    #[test]
    fn final_minute_of_window_is_active() {
        // at 22:04:59 the next firing is a day away,
        // the minute equality keeps the window open
        let (year, schedule) = parse_standard_with_year("0-4 22 * * *").unwrap();
        let now = local(2023, 5, 2, 22, 4, 59);
        let (mis_match, _) =
            final_match_and_mismatch(&schedule, year, now).expect("should be active");
        assert_eq!(mis_match, local(2023, 5, 2, 22, 4, 0));
    }

    #[test]
    fn window_closes_one_minute_after_last_firing() {
        let (year, schedule) = parse_standard_with_year("0-4 22 * * *").unwrap();
        let now = local(2023, 5, 2, 22, 5, 0);
        assert!(final_match_and_mismatch(&schedule, year, now).is_none());
    }

    #[test]
    fn wrong_year_is_inactive() {
        let (year, schedule) = parse_standard_with_year("* 20-22 1 10 * 2023").unwrap();
        let now = local(2024, 10, 1, 20, 0, 1);
        assert!(final_match_and_mismatch(&schedule, year, now).is_none());
    }

    #[test]
    fn minute_59_entry_is_active() {
        let (year, schedule) = parse_standard_with_year("55-59 23 * * *").unwrap();
        let now = local(2023, 5, 2, 23, 59, 2);
        assert!(final_match_and_mismatch(&schedule, year, now).is_some());
    }
}
