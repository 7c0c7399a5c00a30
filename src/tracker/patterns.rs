//! Line grammar for state machine log events
//!
//! ```text
//! [SM:Name] INIT: state=Off
//! [SM:Name] TRANSITION: Off -> Idle | trigger=power_on
//! [SM:Name] STATE: current=Idle
//! [SM:Name] BLOCKED: trigger='start' from=Idle to=Cooling reason=door_open
//! [SM:Name] IGNORED: trigger='stop' state=Off reason=no_transition
//! ```
//!
//! Field values may be bare or single/double quoted. Lines may carry a glog
//! header (`I20240115 10:30:45.123456  1234 file.cc:42] ...`), which is
//! stripped before matching and supplies the event timestamp.

use std::sync::LazyLock;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use regex::Regex;

static GLOG_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[IEWF](\d{8}) (\d{2}:\d{2}:\d{2}\.\d+)\s+\d+\s+\S+\] (.*)$")
        .expect("glog header pattern is valid")
});

static INIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[SM:(\w+)\] INIT: state=['"]?(\w+)['"]?"#).expect("INIT pattern is valid")
});

static TRANSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[SM:(\w+)\] TRANSITION: (\w+) -> (\w+) \| trigger=['"]?(\w+)['"]?"#)
        .expect("TRANSITION pattern is valid")
});

static STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[SM:(\w+)\] STATE: current=['"]?(\w+)['"]?"#).expect("STATE pattern is valid")
});

static BLOCKED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        concat!(
            r#"\[SM:(\w+)\] BLOCKED: trigger=['"]?(\w+)['"]? from=['"]?(\w+)['"]?"#,
            r#" to=['"]?(\w+)['"]? reason=['"]?(\w+)['"]?"#,
        ),
    )
    .expect("BLOCKED pattern is valid")
});

static IGNORED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        concat!(
            r#"\[SM:(\w+)\] IGNORED: trigger=['"]?(\w+)['"]? state=['"]?(\w+)['"]?"#,
            r#" reason=['"]?(\w+)['"]?"#,
        ),
    )
    .expect("IGNORED pattern is valid")
});

/// Fields captured from one recognized line
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Matched {
    Init {
        machine: String,
        state: String,
    },
    Transition {
        machine: String,
        from: String,
        to: String,
        trigger: String,
    },
    State {
        machine: String,
        state: String,
    },
    Blocked {
        machine: String,
        trigger: String,
        from: String,
        to: String,
        reason: String,
    },
    Ignored {
        machine: String,
        trigger: String,
        state: String,
        reason: String,
    },
}

/// Split off a glog header, returning its timestamp and the message body
pub(super) fn strip_header(line: &str) -> (Option<DateTime<Local>>, &str) {
    let Some(caps) = GLOG_HEADER.captures(line) else {
        return (None, line);
    };
    let body = caps.get(3).map_or(line, |m| m.as_str());
    let timestamp = match (caps.get(1), caps.get(2)) {
        (Some(date), Some(time)) => parse_glog_time(date.as_str(), time.as_str()),
        _ => None,
    };
    (timestamp, body)
}

fn parse_glog_time(date: &str, time: &str) -> Option<DateTime<Local>> {
    let date = NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
}

/// Match a message body against the event families, first match wins
pub(super) fn match_event(body: &str) -> Option<Matched> {
    let group = |caps: &regex::Captures<'_>, i: usize| {
        caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default()
    };

    if let Some(c) = INIT.captures(body) {
        return Some(Matched::Init {
            machine: group(&c, 1),
            state: group(&c, 2),
        });
    }
    if let Some(c) = TRANSITION.captures(body) {
        return Some(Matched::Transition {
            machine: group(&c, 1),
            from: group(&c, 2),
            to: group(&c, 3),
            trigger: group(&c, 4),
        });
    }
    if let Some(c) = STATE.captures(body) {
        return Some(Matched::State {
            machine: group(&c, 1),
            state: group(&c, 2),
        });
    }
    if let Some(c) = BLOCKED.captures(body) {
        return Some(Matched::Blocked {
            machine: group(&c, 1),
            trigger: group(&c, 2),
            from: group(&c, 3),
            to: group(&c, 4),
            reason: group(&c, 5),
        });
    }
    if let Some(c) = IGNORED.captures(body) {
        return Some(Matched::Ignored {
            machine: group(&c, 1),
            trigger: group(&c, 2),
            state: group(&c, 3),
            reason: group(&c, 4),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_strip_glog_header() {
        let (ts, body) = strip_header(
            "I20240115 10:30:45.123456  1234 climate.cpp:42] [SM:Climate] STATE: current=IDLE",
        );
        assert_eq!(body, "[SM:Climate] STATE: current=IDLE");
        let ts = ts.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 1, 15));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (10, 30, 45));
    }

    #[test]
    fn test_plain_line_has_no_header() {
        let (ts, body) = strip_header("[SM:Climate] STATE: current=IDLE");
        assert!(ts.is_none());
        assert_eq!(body, "[SM:Climate] STATE: current=IDLE");
    }

    #[test]
    fn test_quoted_and_bare_fields() {
        let quoted = match_event("[SM:Door] TRANSITION: CLOSED -> OPEN | trigger='unlock'");
        let bare = match_event("[SM:Door] TRANSITION: CLOSED -> OPEN | trigger=unlock");
        assert_eq!(quoted, bare);
        assert_eq!(
            bare,
            Some(Matched::Transition {
                machine: "Door".into(),
                from: "CLOSED".into(),
                to: "OPEN".into(),
                trigger: "unlock".into(),
            })
        );
    }

    #[test]
    fn test_blocked_and_ignored() {
        assert_eq!(
            match_event("[SM:Door] BLOCKED: trigger='open' from=CLOSED to=OPEN reason=moving"),
            Some(Matched::Blocked {
                machine: "Door".into(),
                trigger: "open".into(),
                from: "CLOSED".into(),
                to: "OPEN".into(),
                reason: "moving".into(),
            })
        );
        assert_eq!(
            match_event("[SM:Door] IGNORED: trigger='close' state=CLOSED reason=no_transition"),
            Some(Matched::Ignored {
                machine: "Door".into(),
                trigger: "close".into(),
                state: "CLOSED".into(),
                reason: "no_transition".into(),
            })
        );
    }

    #[test]
    fn test_unrelated_lines() {
        assert_eq!(match_event("Connected to databroker at localhost:55555"), None);
        assert_eq!(match_event("[SM:Door] UNKNOWN: state=X"), None);
    }
}
