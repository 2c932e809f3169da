//! A recurring daily job and its wall-clock arithmetic.

use crate::config::JobConfig;
use crate::core::RunKey;
use crate::errors::ConfigError;
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

/// Where a job stands in its daily cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Never fires on schedule.
    Disabled,
    /// Waiting for today's fire time.
    Armed,
    /// Fire time reached; fires on the next tick.
    Due,
    /// Already fired today.
    Fired,
}

/// Read-only view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    /// Job name.
    pub name: String,
    /// Whether the job fires on schedule.
    pub enabled: bool,
    /// Local fire time.
    pub time_of_day: NaiveTime,
    /// IANA timezone name.
    pub timezone: String,
    /// Current phase.
    pub phase: JobPhase,
    /// Local date of the last scheduled fire.
    pub last_fired: Option<NaiveDate>,
    /// Next scheduled fire instant, resolved against DST.
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// A job that fires once per local calendar day.
///
/// Due-ness is recomputed from the wall clock on every tick: a job is due
/// when the local time of day has reached its fire time and it has not
/// fired yet on the local date. A skipped local hour therefore delays the
/// fire to the first tick after the skip, and a repeated hour cannot fire
/// twice because the last fired date has already advanced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    name: String,
    time_of_day: NaiveTime,
    timezone: Tz,
    run_key_template: Option<String>,
    enabled: bool,
    last_fired: Option<NaiveDate>,
}

impl ScheduledJob {
    /// Builds a job from its configuration.
    pub fn from_config(config: &JobConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            name: config.name.clone(),
            time_of_day: config.parse_time_of_day()?,
            timezone: config.parse_timezone()?,
            run_key_template: config.run_key_template.clone(),
            enabled: config.enabled,
            last_fired: None,
        })
    }

    /// Job name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local fire time.
    #[must_use]
    pub fn time_of_day(&self) -> NaiveTime {
        self.time_of_day
    }

    /// The job's timezone.
    #[must_use]
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Whether the job fires on schedule.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables scheduled fires.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Local date of the last scheduled fire.
    #[must_use]
    pub fn last_fired(&self) -> Option<NaiveDate> {
        self.last_fired
    }

    /// Overwrites the last fired date.
    pub fn set_last_fired(&mut self, date: Option<NaiveDate>) {
        self.last_fired = date;
    }

    /// Local date in the job's zone at `now`.
    #[must_use]
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.timezone).date_naive()
    }

    fn fired_on_or_after(&self, date: NaiveDate) -> bool {
        self.last_fired.is_some_and(|fired| fired >= date)
    }

    /// Returns the local date to fire for, if the job is due at `now`.
    #[must_use]
    pub fn due_date(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        if !self.enabled {
            return None;
        }
        let local = now.with_timezone(&self.timezone);
        let today = local.date_naive();
        (!self.fired_on_or_after(today) && local.time() >= self.time_of_day).then_some(today)
    }

    /// Returns the job's phase at `now`.
    #[must_use]
    pub fn phase(&self, now: DateTime<Utc>) -> JobPhase {
        if !self.enabled {
            JobPhase::Disabled
        } else if self.fired_on_or_after(self.local_date(now)) {
            JobPhase::Fired
        } else if self.due_date(now).is_some() {
            JobPhase::Due
        } else {
            JobPhase::Armed
        }
    }

    /// Next instant the job becomes due, `now` itself if it is due already.
    #[must_use]
    pub fn next_fire_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        if self.due_date(now).is_some() {
            return Some(now);
        }
        let today = self.local_date(now);
        let date = if self.fired_on_or_after(today) {
            today.succ_opt()?
        } else {
            today
        };
        self.resolve(date.and_time(self.time_of_day))
    }

    /// Maps a local fire time to UTC.
    ///
    /// An ambiguous time resolves to its first occurrence. A time inside a
    /// DST gap resolves to the first valid minute after the gap.
    fn resolve(&self, local: NaiveDateTime) -> Option<DateTime<Utc>> {
        match self.timezone.from_local_datetime(&local) {
            LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => Some(at.with_timezone(&Utc)),
            LocalResult::None => {
                let mut probe = local.with_second(0)?;
                for _ in 0..(24 * 60) {
                    probe += Duration::minutes(1);
                    if let Some(at) = self.timezone.from_local_datetime(&probe).earliest() {
                        return Some(at.with_timezone(&Utc));
                    }
                }
                None
            }
        }
    }

    /// Run key for the fire on `date`.
    ///
    /// `{date}` in the template is replaced with the ISO date; a template
    /// without the placeholder gets `:<date>` appended. Without a template
    /// the job name is used.
    #[must_use]
    pub fn run_key(&self, date: NaiveDate) -> RunKey {
        let template = self.run_key_template.as_deref().unwrap_or(&self.name);
        let date = date.format("%Y-%m-%d").to_string();
        if template.contains("{date}") {
            RunKey::new(template.replace("{date}", &date))
        } else {
            RunKey::new(format!("{template}:{date}"))
        }
    }

    /// Returns a status view at `now`.
    #[must_use]
    pub fn status(&self, now: DateTime<Utc>) -> JobStatus {
        JobStatus {
            name: self.name.clone(),
            enabled: self.enabled,
            time_of_day: self.time_of_day,
            timezone: self.timezone.name().to_string(),
            phase: self.phase(now),
            last_fired: self.last_fired,
            next_fire_at: self.next_fire_at(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::utc;

    fn job(time: &str, tz: &str) -> ScheduledJob {
        ScheduledJob::from_config(&JobConfig::new("scan", time, tz)).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_due_after_local_time() {
        let job = job("14:00", "Europe/Berlin");
        // 12:59 UTC is 13:59 CET in winter.
        assert_eq!(job.due_date(utc(2026, 1, 15, 12, 59)), None);
        assert_eq!(job.due_date(utc(2026, 1, 15, 13, 0)), Some(date(2026, 1, 15)));
        assert_eq!(job.phase(utc(2026, 1, 15, 12, 0)), JobPhase::Armed);
        assert_eq!(job.phase(utc(2026, 1, 15, 13, 30)), JobPhase::Due);
    }

    #[test]
    fn test_fired_today_not_due_again() {
        let mut job = job("14:00", "Europe/Berlin");
        job.set_last_fired(Some(date(2026, 1, 15)));
        assert_eq!(job.due_date(utc(2026, 1, 15, 20, 0)), None);
        assert_eq!(job.phase(utc(2026, 1, 15, 20, 0)), JobPhase::Fired);
        assert_eq!(job.due_date(utc(2026, 1, 16, 13, 0)), Some(date(2026, 1, 16)));
    }

    #[test]
    fn test_local_date_differs_from_utc_date() {
        let job = job("08:00", "Asia/Tokyo");
        // 23:30 UTC on the 15th is 08:30 on the 16th in Tokyo.
        assert_eq!(job.due_date(utc(2026, 1, 15, 23, 30)), Some(date(2026, 1, 16)));
    }

    #[test]
    fn test_disabled_never_due() {
        let mut job = job("00:00", "UTC");
        job.set_enabled(false);
        assert_eq!(job.due_date(utc(2026, 1, 15, 12, 0)), None);
        assert_eq!(job.phase(utc(2026, 1, 15, 12, 0)), JobPhase::Disabled);
        assert_eq!(job.next_fire_at(utc(2026, 1, 15, 12, 0)), None);
    }

    #[test]
    fn test_next_fire_in_spring_gap() {
        let job = job("02:30", "Europe/Berlin");
        // 02:30 does not exist on 2026-03-29; the gap ends at 03:00 CEST.
        assert_eq!(job.next_fire_at(utc(2026, 3, 28, 23, 0)), Some(utc(2026, 3, 29, 1, 0)));
    }

    #[test]
    fn test_next_fire_ambiguous_takes_first() {
        let job = job("02:30", "Europe/Berlin");
        // 02:30 occurs twice on 2026-10-25; the first is 00:30 UTC.
        assert_eq!(job.next_fire_at(utc(2026, 10, 24, 22, 0)), Some(utc(2026, 10, 25, 0, 30)));
    }

    #[test]
    fn test_next_fire_tomorrow_after_firing() {
        let mut job = job("09:00", "UTC");
        job.set_last_fired(Some(date(2026, 5, 1)));
        assert_eq!(job.next_fire_at(utc(2026, 5, 1, 10, 0)), Some(utc(2026, 5, 2, 9, 0)));
    }

    #[test]
    fn test_run_key_template() {
        let plain = job("09:00", "UTC");
        assert_eq!(plain.run_key(date(2026, 3, 2)).as_str(), "scan:2026-03-02");

        let templated = ScheduledJob::from_config(
            &JobConfig::new("scan", "09:00", "UTC").with_run_key_template("primary-{date}"),
        )
        .unwrap();
        assert_eq!(templated.run_key(date(2026, 3, 2)).as_str(), "primary-2026-03-02");

        let prefixed = ScheduledJob::from_config(
            &JobConfig::new("scan", "09:00", "UTC").with_run_key_template("second-look"),
        )
        .unwrap();
        assert_eq!(prefixed.run_key(date(2026, 3, 2)).as_str(), "second-look:2026-03-02");
    }

    #[test]
    fn test_status_view() {
        let job = job("14:00", "Europe/Berlin");
        let status = job.status(utc(2026, 1, 15, 12, 0));
        assert_eq!(status.timezone, "Europe/Berlin");
        assert_eq!(status.phase, JobPhase::Armed);
        assert_eq!(status.next_fire_at, Some(utc(2026, 1, 15, 13, 0)));
    }
}
