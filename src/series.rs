//! Series timer matching and expansion

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use tracing::debug;

use crate::epg::normalize_channel_number;
use crate::models::{timer_id, ProgramInfo, SeriesTimerInfo, TimerInfo};
use crate::timer::check_viability;

/// Allowed drift between a rule's time of day and an airing's start
pub const TIME_OF_DAY_SLACK_MINUTES: i64 = 5;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Whether a program satisfies every restriction of a series rule
pub fn matches(rule: &SeriesTimerInfo, program: &ProgramInfo) -> bool {
    matches_channel(rule, program)
        && matches_series(rule, program)
        && matches_time(rule, program.start_date)
        && (rule.days.is_empty() || rule.days.contains(&program.start_date.weekday()))
        && !(rule.record_new_only && program.is_repeat)
}

fn matches_channel(rule: &SeriesTimerInfo, program: &ProgramInfo) -> bool {
    if rule.record_any_channel {
        return true;
    }
    rule.channel_id
        .as_deref()
        .map(|c| normalize_channel_number(c) == normalize_channel_number(&program.channel_id))
        .unwrap_or(false)
}

fn matches_series(rule: &SeriesTimerInfo, program: &ProgramInfo) -> bool {
    match &rule.series_id {
        Some(series_id) => program.series_id.as_deref() == Some(series_id.as_str()),
        None => rule.name.trim().eq_ignore_ascii_case(program.name.trim()),
    }
}

fn matches_time(rule: &SeriesTimerInfo, start: DateTime<Utc>) -> bool {
    if rule.record_any_time {
        return true;
    }
    let diff = (minute_of_day(start) - minute_of_day(rule.start_date)).abs();
    diff.min(MINUTES_PER_DAY - diff) <= TIME_OF_DAY_SLACK_MINUTES
}

fn minute_of_day(dt: DateTime<Utc>) -> i64 {
    i64::from(dt.hour()) * 60 + i64::from(dt.minute())
}

/// Turn programs matched by any rule into concrete timers.
///
/// Timers whose id is in `existing`, or that a rule lists as skipped, are
/// not produced. When several rules match an airing the first one whose
/// padding leaves a viable timer at `now` wins. Each airing yields at most
/// one timer.
pub fn expand(
    rules: &[SeriesTimerInfo],
    programs: &[ProgramInfo],
    existing: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<TimerInfo> {
    let mut produced: HashSet<String> = HashSet::new();
    let mut timers = Vec::new();

    for program in programs {
        let id = timer_id(&program.id, &program.channel_id, program.start_date);
        if existing.contains(&id) || produced.contains(&id) {
            continue;
        }
        if rules.iter().any(|r| r.skipped_timer_ids.contains(&id)) {
            debug!("Skipping {} ({}), cancelled by the user", program.name, id);
            continue;
        }

        let timer = rules
            .iter()
            .filter(|r| matches(r, program))
            .find_map(|rule| {
                let mut timer = TimerInfo::for_program(program)
                    .with_padding(rule.pre_padding_seconds, rule.post_padding_seconds);
                timer.series_timer_id = Some(rule.id.clone());
                match check_viability(&timer, now) {
                    Ok(()) => Some(timer),
                    Err(reason) => {
                        debug!(
                            "Series rule {} matched {} but it cannot be scheduled: {}",
                            rule.id, timer.name, reason
                        );
                        None
                    }
                }
            });

        if let Some(timer) = timer {
            produced.insert(timer.id.clone());
            timers.push(timer);
        }
    }

    timers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Weekday};

    fn now() -> DateTime<Utc> {
        // Monday
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    fn airing(id: &str, channel: &str, name: &str, start: DateTime<Utc>) -> ProgramInfo {
        let mut program = ProgramInfo::new(id, channel, name, start, start + Duration::minutes(30));
        program.series_id = Some("SH01234567".to_string());
        program.is_series = true;
        program
    }

    fn evening(days: i64) -> DateTime<Utc> {
        now() + Duration::days(days) + Duration::hours(8)
    }

    #[test]
    fn test_name_match_is_case_insensitive() {
        let rule = SeriesTimerInfo::new("r1", "evening news");
        assert!(matches(&rule, &airing("EP1", "5", "Evening News", evening(0))));
        assert!(!matches(&rule, &airing("EP2", "5", "Morning News", evening(0))));
    }

    #[test]
    fn test_series_id_takes_precedence_over_name() {
        let mut rule = SeriesTimerInfo::new("r1", "Something Else");
        rule.series_id = Some("SH01234567".to_string());
        assert!(matches(&rule, &airing("EP1", "5", "Evening News", evening(0))));

        rule.series_id = Some("SH99999999".to_string());
        assert!(!matches(&rule, &airing("EP1", "5", "Evening News", evening(0))));
    }

    #[test]
    fn test_channel_time_and_day_restrictions() {
        let mut rule = SeriesTimerInfo::new("r1", "Evening News");
        rule.record_any_channel = false;
        rule.channel_id = Some("005".to_string());
        rule.record_any_time = false;
        rule.start_date = Utc.with_ymd_and_hms(2026, 1, 1, 20, 3, 0).unwrap();
        rule.days = vec![Weekday::Mon, Weekday::Tue];

        assert!(matches(&rule, &airing("EP1", "5", "Evening News", evening(0))));
        assert!(!matches(&rule, &airing("EP1", "7", "Evening News", evening(0))));
        assert!(!matches(
            &rule,
            &airing("EP1", "5", "Evening News", evening(0) + Duration::hours(1))
        ));
        // Wednesday
        assert!(!matches(&rule, &airing("EP1", "5", "Evening News", evening(2))));
    }

    #[test]
    fn test_new_only_skips_repeats() {
        let mut rule = SeriesTimerInfo::new("r1", "Evening News");
        rule.record_new_only = true;

        let mut repeat = airing("EP1", "5", "Evening News", evening(0));
        repeat.is_repeat = true;
        assert!(!matches(&rule, &repeat));

        repeat.is_repeat = false;
        assert!(matches(&rule, &repeat));
    }

    #[test]
    fn test_expand_applies_padding_and_rule_id() {
        let mut rule = SeriesTimerInfo::new("r1", "Evening News");
        rule.pre_padding_seconds = 60;
        rule.post_padding_seconds = 120;

        let programs = vec![
            airing("EP1", "5", "Evening News", evening(0)),
            airing("EP2", "5", "Evening News", evening(1)),
            airing("SP1", "7", "Game Night", evening(0)),
        ];
        let timers = expand(&[rule], &programs, &HashSet::new(), now());

        assert_eq!(timers.len(), 2);
        assert!(timers.iter().all(|t| t.series_timer_id.as_deref() == Some("r1")));
        assert_eq!(timers[0].pre_padding_seconds, 60);
        assert_eq!(timers[0].post_padding_seconds, 120);
    }

    #[test]
    fn test_expand_never_duplicates() {
        let rules = vec![
            SeriesTimerInfo::new("r1", "Evening News"),
            SeriesTimerInfo::new("r2", "evening news"),
        ];
        let program = airing("EP1", "5", "Evening News", evening(0));
        let programs = vec![program.clone(), program.clone()];

        let first = expand(&rules, &programs, &HashSet::new(), now());
        assert_eq!(first.len(), 1);

        let existing: HashSet<String> = first.iter().map(|t| t.id.clone()).collect();
        assert!(expand(&rules, &programs, &existing, now()).is_empty());
    }

    #[test]
    fn test_expand_falls_back_to_next_viable_rule() {
        let start = now() + Duration::seconds(30);
        let mut early = SeriesTimerInfo::new("early", "Evening News");
        early.pre_padding_seconds = 600;
        let plain = SeriesTimerInfo::new("plain", "Evening News");

        let timers = expand(
            &[early, plain],
            &[airing("EP1", "5", "Evening News", start)],
            &HashSet::new(),
            now(),
        );

        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].series_timer_id.as_deref(), Some("plain"));
        assert_eq!(timers[0].pre_padding_seconds, 0);
    }

    #[test]
    fn test_expand_honours_skipped_airings() {
        let program = airing("EP1", "5", "Evening News", evening(0));
        let mut rule = SeriesTimerInfo::new("r1", "Evening News");
        rule.skipped_timer_ids = vec![timer_id("EP1", "5", evening(0))];
        let other = SeriesTimerInfo::new("r2", "Evening News");

        let timers = expand(
            &[rule, other],
            &[program, airing("EP2", "5", "Evening News", evening(1))],
            &HashSet::new(),
            now(),
        );
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].program_id, "EP2");
    }

    #[test]
    fn test_expand_skips_elapsed_airings() {
        let rule = SeriesTimerInfo::new("r1", "Evening News");
        let past = airing("EP1", "5", "Evening News", now() - Duration::hours(2));
        assert!(expand(&[rule], &[past], &HashSet::new(), now()).is_empty());
    }
}
