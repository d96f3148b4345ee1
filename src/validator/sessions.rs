//! Trading-hours calendars.
//!
//! A session whose end precedes its start crosses midnight; the portion
//! after midnight belongs to the previous exchange day, so a Friday night
//! session still trades in the early hours of Saturday.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

/// One continuous trading window, bounds inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradingSession {
    #[serde(default)]
    pub name: String,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TradingSession {
    pub fn new(name: impl Into<String>, start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            name: name.into(),
            start,
            end,
        }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.end < self.start
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

/// Sessions of the Chinese commodity futures exchanges, night session included.
pub fn china_futures_sessions() -> Vec<TradingSession> {
    vec![
        TradingSession::new("morning_1", hm(9, 0), hm(10, 15)),
        TradingSession::new("morning_2", hm(10, 30), hm(11, 30)),
        TradingSession::new("afternoon", hm(13, 30), hm(15, 0)),
        TradingSession::new("night", hm(21, 0), hm(2, 30)),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCalendar {
    sessions: Vec<TradingSession>,
    weekdays_only: bool,
}

impl SessionCalendar {
    pub fn new(sessions: Vec<TradingSession>, weekdays_only: bool) -> Self {
        Self {
            sessions,
            weekdays_only,
        }
    }

    pub fn china_futures() -> Self {
        Self::new(china_futures_sessions(), true)
    }

    pub fn sessions(&self) -> &[TradingSession] {
        &self.sessions
    }

    /// Whether `at` (exchange local time) falls inside any session.
    pub fn is_open(&self, at: NaiveDateTime) -> bool {
        let t = at.time();
        let date = at.date();

        self.sessions.iter().any(|s| {
            if !s.crosses_midnight() {
                s.start <= t && t <= s.end && self.day_allowed(Some(date))
            } else if t >= s.start {
                self.day_allowed(Some(date))
            } else if t <= s.end {
                self.day_allowed(date.pred_opt())
            } else {
                false
            }
        })
    }

    fn day_allowed(&self, date: Option<NaiveDate>) -> bool {
        if !self.weekdays_only {
            return true;
        }
        match date {
            Some(d) => !matches!(d.weekday(), Weekday::Sat | Weekday::Sun),
            None => false,
        }
    }
}

impl Default for SessionCalendar {
    fn default() -> Self {
        Self::china_futures()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, hh: u32, mm: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(hh, mm, 0)
            .unwrap()
    }

    #[test]
    fn test_day_sessions() {
        let cal = SessionCalendar::china_futures();
        // 2024-06-12 is a Wednesday
        assert!(cal.is_open(at(2024, 6, 12, 9, 0)));
        assert!(cal.is_open(at(2024, 6, 12, 10, 15)));
        assert!(!cal.is_open(at(2024, 6, 12, 10, 20)));
        assert!(cal.is_open(at(2024, 6, 12, 14, 59)));
        assert!(!cal.is_open(at(2024, 6, 12, 15, 1)));
        assert!(!cal.is_open(at(2024, 6, 12, 12, 0)));
    }

    #[test]
    fn test_night_session_crosses_midnight() {
        let cal = SessionCalendar::china_futures();
        assert!(cal.is_open(at(2024, 6, 12, 21, 5)));
        assert!(cal.is_open(at(2024, 6, 12, 23, 59)));
        assert!(cal.is_open(at(2024, 6, 13, 1, 30)));
        assert!(!cal.is_open(at(2024, 6, 13, 2, 31)));
    }

    #[test]
    fn test_weekend_closed_but_friday_night_tail_open() {
        let cal = SessionCalendar::china_futures();
        // 2024-06-15 Saturday, 2024-06-16 Sunday, 2024-06-17 Monday
        assert!(cal.is_open(at(2024, 6, 15, 1, 0)));
        assert!(!cal.is_open(at(2024, 6, 15, 9, 30)));
        assert!(!cal.is_open(at(2024, 6, 16, 21, 30)));
        assert!(!cal.is_open(at(2024, 6, 17, 0, 30)));
        assert!(cal.is_open(at(2024, 6, 17, 9, 30)));
    }

    #[test]
    fn test_all_days_calendar() {
        let cal = SessionCalendar::new(vec![TradingSession::new("all", hm(0, 0), hm(23, 59))], false);
        assert!(cal.is_open(at(2024, 6, 16, 12, 0)));
    }
}
