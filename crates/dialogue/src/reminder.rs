//! Daily spoken reminders
//!
//! A reminder repeats every day at a wall-clock time (UTC). Its first due instant is computed
//! from the timestamp of the utterance that created it, so resolution stays deterministic.

use time::{Duration, OffsetDateTime, Time};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reminder {
    pub message: String,
    pub at: Time,
    /// Next instant the reminder is spoken
    pub next_due: OffsetDateTime,
}

impl Reminder {
    /// Schedule `message` daily at `at`, first occurring after `from`.
    pub fn new(message: impl Into<String>, at: Time, from: OffsetDateTime) -> Self {
        Self {
            message: message.into(),
            at,
            next_due: next_occurrence(at, from),
        }
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.next_due <= now
    }

    /// Move `next_due` past `now`, skipping missed days.
    pub fn advance(&mut self, now: OffsetDateTime) {
        while self.next_due <= now {
            self.next_due += Duration::days(1);
        }
    }

    pub fn spoken(&self) -> String {
        format!("Reminder: {}", self.message)
    }
}

/// First instant strictly after `after` whose time of day is `at`.
pub fn next_occurrence(at: Time, after: OffsetDateTime) -> OffsetDateTime {
    let candidate = after.replace_time(at);
    if candidate > after {
        candidate
    } else {
        candidate + Duration::days(1)
    }
}

/// Parse `H:MM` or `HH:MM` (24 hour clock).
pub fn parse_clock(raw: &str) -> Option<Time> {
    let (hour, minute) = raw.trim().split_once(':')?;
    if minute.len() != 2 {
        return None;
    }
    let hour: u8 = hour.parse().ok()?;
    let minute: u8 = minute.parse().ok()?;
    Time::from_hms(hour, minute, 0).ok()
}

pub fn clock(at: Time) -> String {
    format!("{:02}:{:02}", at.hour(), at.minute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u8, m: u8) -> Time {
        Time::from_hms(h, m, 0).unwrap()
    }

    // 2024-01-01 14:05:00 UTC
    fn afternoon() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_704_117_900).unwrap()
    }

    #[test]
    fn test_parse_clock() {
        assert_eq!(parse_clock("18:30"), Some(at(18, 30)));
        assert_eq!(parse_clock(" 7:05 "), Some(at(7, 5)));
        assert_eq!(parse_clock("24:00"), None);
        assert_eq!(parse_clock("12:7"), None);
        assert_eq!(parse_clock("noon"), None);
        assert_eq!(clock(at(7, 5)), "07:05");
    }

    #[test]
    fn test_next_occurrence_rolls_to_tomorrow() {
        let now = afternoon();
        let later = next_occurrence(at(18, 0), now);
        assert_eq!(later.date(), now.date());
        assert_eq!(later.hour(), 18);

        let earlier = next_occurrence(at(9, 0), now);
        assert_eq!(earlier.date(), now.date().next_day().unwrap());

        // the same minute is already over
        let same = next_occurrence(at(14, 5), now);
        assert_eq!(same - now, Duration::days(1));
    }

    #[test]
    fn test_advance_skips_missed_days() {
        let start = afternoon();
        let mut reminder = Reminder::new("water the plants", at(15, 0), start);
        assert!(!reminder.is_due(start));

        let three_days_later = start + Duration::days(3);
        assert!(reminder.is_due(three_days_later));
        reminder.advance(three_days_later);
        assert!(reminder.next_due > three_days_later);
        assert!(reminder.next_due - three_days_later <= Duration::days(1));
        assert_eq!(reminder.spoken(), "Reminder: water the plants");
    }
}
