//! Cron expression parsing for builder and GC schedules.
//!
//! Standard 5-field grammar (minute, hour, day-of-month, month, day-of-week)
//! plus the usual `@hourly` style conveniences and `@every <seconds>`.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CronError {
    #[error("cron expression must have 5 fields, got {0}")]
    WrongFieldCount(usize),
    #[error("invalid cron field: {0}")]
    InvalidField(String),
    #[error("cron field value {value} outside {min}..={max}")]
    OutOfRange { value: u32, min: u32, max: u32 },
    #[error("unknown cron shorthand: {0}")]
    UnknownShorthand(String),
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    values: BTreeSet<u32>,
    /// A bare `*`; matters for the day-of-month/day-of-week union rule.
    any: bool,
}

impl Field {
    fn parse(input: &str, min: u32, max: u32) -> Result<Self, CronError> {
        let mut values = BTreeSet::new();
        let any = input == "*";

        for part in input.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| CronError::InvalidField(part.to_string()))?;
                    if step == 0 {
                        return Err(CronError::InvalidField(part.to_string()));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let a = a
                    .parse()
                    .map_err(|_| CronError::InvalidField(part.to_string()))?;
                let b = b
                    .parse()
                    .map_err(|_| CronError::InvalidField(part.to_string()))?;
                (a, b)
            } else {
                let v: u32 = range
                    .parse()
                    .map_err(|_| CronError::InvalidField(part.to_string()))?;
                (v, v)
            };

            for value in (start..=end).step_by(step as usize) {
                // Day-of-week 7 is an alias for Sunday
                let value = if max == 6 && value == 7 { 0 } else { value };
                if value < min || value > max {
                    return Err(CronError::OutOfRange { value, min, max });
                }
                values.insert(value);
            }
        }

        if values.is_empty() {
            return Err(CronError::InvalidField(input.to_string()));
        }

        Ok(Field { values, any })
    }

    fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CronRule {
    Fields {
        minute: Field,
        hour: Field,
        day_of_month: Field,
        month: Field,
        day_of_week: Field,
    },
    Every(Duration),
}

impl FromStr for CronRule {
    type Err = CronError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();

        if let Some(rest) = input.strip_prefix("@every ") {
            let secs: u64 = rest
                .trim()
                .trim_end_matches('s')
                .parse()
                .map_err(|_| CronError::InvalidField(rest.to_string()))?;
            if secs == 0 {
                return Err(CronError::InvalidField(rest.to_string()));
            }
            return Ok(CronRule::Every(Duration::from_secs(secs)));
        }

        let expanded = match input {
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            "@yearly" | "@annually" => "0 0 1 1 *",
            other if other.starts_with('@') => {
                return Err(CronError::UnknownShorthand(other.to_string()));
            }
            other => other,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::WrongFieldCount(fields.len()));
        }

        Ok(CronRule::Fields {
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day_of_month: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            day_of_week: Field::parse(fields[4], 0, 6)?,
        })
    }
}

impl CronRule {
    /// Earliest trigger strictly after `now`, minute resolution.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            CronRule::Every(interval) => now + chrono::Duration::from_std(*interval).unwrap(),
            CronRule::Fields {
                minute,
                hour,
                day_of_month,
                month,
                day_of_week,
            } => {
                let mut candidate = (now + chrono::Duration::minutes(1))
                    .with_second(0)
                    .unwrap()
                    .with_nanosecond(0)
                    .unwrap();

                // Bounded walk: any valid expression fires within 4 years
                for _ in 0..(4 * 366 * 24 * 60) {
                    let dom_ok = day_of_month.matches(candidate.day());
                    let dow_ok = day_of_week.matches(candidate.weekday().num_days_from_sunday());

                    // Vixie cron: when both day fields are restricted, either
                    // one matching is enough
                    let day_ok = if !day_of_month.any && !day_of_week.any {
                        dom_ok || dow_ok
                    } else {
                        dom_ok && dow_ok
                    };

                    if month.matches(candidate.month())
                        && day_ok
                        && hour.matches(candidate.hour())
                        && minute.matches(candidate.minute())
                    {
                        return candidate;
                    }

                    candidate += chrono::Duration::minutes(1);
                }

                candidate
            }
        }
    }

    /// Trigger timestamp in the format the metadata store compares with
    /// `datetime('now')`.
    pub fn next_trigger_column(&self, now: DateTime<Utc>) -> String {
        self.next_after(now).format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

/// Surface for the rule validation endpoint: Ok or a human message.
pub fn validate(expression: &str) -> Result<(), String> {
    expression
        .parse::<CronRule>()
        .map(|_| ())
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 30).unwrap()
    }

    #[test]
    fn every_minute() {
        let rule: CronRule = "* * * * *".parse().unwrap();
        let next = rule.next_after(at(2026, 3, 10, 12, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 12, 1, 0).unwrap());
    }

    #[test]
    fn daily_at_two() {
        let rule: CronRule = "0 2 * * *".parse().unwrap();
        let next = rule.next_after(at(2026, 3, 10, 12, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 11, 2, 0, 0).unwrap());

        let next = rule.next_after(at(2026, 3, 10, 1, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 10, 2, 0, 0).unwrap());
    }

    #[test]
    fn steps_and_ranges() {
        let rule: CronRule = "*/15 9-17 * * 1-5".parse().unwrap();
        // 2026-03-14 is a Saturday; next weekday slot is Monday 09:00
        let next = rule.next_after(at(2026, 3, 13, 17, 50));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 16, 9, 0, 0).unwrap());
    }

    #[test]
    fn day_of_week_union_with_day_of_month() {
        // Both restricted: fires on the 15th OR on Mondays
        let rule: CronRule = "0 0 15 * 1".parse().unwrap();
        // 2026-03-10 is a Tuesday; Monday 2026-03-16 comes after the 15th
        let next = rule.next_after(at(2026, 3, 10, 0, 0));
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn shorthands() {
        assert_eq!(
            "@hourly".parse::<CronRule>().unwrap(),
            "0 * * * *".parse::<CronRule>().unwrap()
        );
        assert_eq!(
            "@daily".parse::<CronRule>().unwrap(),
            "0 0 * * *".parse::<CronRule>().unwrap()
        );
        assert_eq!(
            "@weekly".parse::<CronRule>().unwrap(),
            "0 0 * * 0".parse::<CronRule>().unwrap()
        );

        let rule: CronRule = "@every 90".parse().unwrap();
        let next = rule.next_after(at(2026, 3, 10, 12, 0));
        assert_eq!(next, at(2026, 3, 10, 12, 0) + chrono::Duration::seconds(90));
    }

    #[test]
    fn sunday_aliases() {
        let with_seven: CronRule = "0 0 * * 7".parse().unwrap();
        let with_zero: CronRule = "0 0 * * 0".parse().unwrap();
        assert_eq!(
            with_seven.next_after(at(2026, 3, 10, 0, 0)),
            with_zero.next_after(at(2026, 3, 10, 0, 0))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(validate("* * * *").is_err());
        assert!(validate("61 * * * *").is_err());
        assert!(validate("* * * * * *").is_err());
        assert!(validate("@fortnightly").is_err());
        assert!(validate("a b c d e").is_err());
        assert!(validate("*/0 * * * *").is_err());

        assert!(validate("*/5 * * * *").is_ok());
        assert!(validate("@every 30").is_ok());
    }

    #[test]
    fn trigger_column_format() {
        let rule: CronRule = "0 2 * * *".parse().unwrap();
        let column = rule.next_trigger_column(at(2026, 3, 10, 12, 0));
        assert_eq!(column, "2026-03-11 02:00:00");
    }
}
