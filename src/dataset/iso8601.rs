//! ISO-8601 date/time parsing into structured parts.
//!
//! Accepts `YYYY[-MM[-DD[(T| )HH[:MM[:SS[.ffffff]]]][Z|±HH[:MM]]]]]` and a
//! separate time-only form. Separators are optional, fractions are
//! right-padded with zeros to six digits and truncated to microseconds, and
//! missing fields stay `None`. The timezone is captured as literal text but
//! never applied to the wall-clock fields; consumers treat the result as a
//! local naive time. Input that does not match yields `None`, never an
//! error.

use std::sync::LazyLock;

use regex::Regex;

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        (?P<year>[0-9]{4})
        (?:-?(?P<month>[0-9]{1,2})
            (?:-?(?P<day>[0-9]{1,2})
                (?:
                    (?P<separator>T|\ )?
                    (?P<hour>[0-9]{2})
                    (?::?(?P<minute>[0-9]{2})
                        (?::?(?P<second>[0-9]{2})
                            (?:\.(?P<fraction>[0-9]+))?
                        )?
                    )?
                    (?P<timezone>Z|[-+][0-9]{2}(?::?[0-9]{2})?)?
                )?
            )?
        )?
        $",
    )
    .expect("iso8601 date pattern")
});

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^
        (?P<hour>[0-9]{2})
        (?::?(?P<minute>[0-9]{2})
            (?::?(?P<second>[0-9]{2})
                (?:\.(?P<fraction>[0-9]+))?
            )?
        )?
        (?P<timezone>Z|[-+][0-9]{2}(?::?[0-9]{2})?)?
        $",
    )
    .expect("iso8601 time pattern")
});

/// Parsed date/time parts. Fields missing from the input are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DateTimeParts {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
    pub separator: Option<String>,
    pub hour: Option<u32>,
    pub minute: Option<u32>,
    pub second: Option<u32>,
    /// Microseconds (fraction padded/truncated to 6 digits).
    pub fraction: Option<u32>,
    /// Literal timezone text (`Z`, `+05`, `-03:00`), not applied.
    pub timezone: Option<String>,
}

/// Parse an ISO-8601 date or datetime string.
pub fn parse_datetime(value: &str) -> Option<DateTimeParts> {
    let captures = DATE_RE.captures(value)?;
    Some(DateTimeParts {
        year: group(&captures, "year"),
        month: group(&captures, "month"),
        day: group(&captures, "day"),
        separator: text(&captures, "separator"),
        hour: group(&captures, "hour"),
        minute: group(&captures, "minute"),
        second: group(&captures, "second"),
        fraction: fraction(&captures),
        timezone: text(&captures, "timezone"),
    })
}

/// Parse an ISO-8601 time-only string.
pub fn parse_time(value: &str) -> Option<DateTimeParts> {
    let captures = TIME_RE.captures(value)?;
    Some(DateTimeParts {
        hour: group(&captures, "hour"),
        minute: group(&captures, "minute"),
        second: group(&captures, "second"),
        fraction: fraction(&captures),
        timezone: text(&captures, "timezone"),
        ..DateTimeParts::default()
    })
}

fn group<T: std::str::FromStr>(captures: &regex::Captures<'_>, name: &str) -> Option<T> {
    captures.name(name).and_then(|m| m.as_str().parse().ok())
}

fn text(captures: &regex::Captures<'_>, name: &str) -> Option<String> {
    captures.name(name).map(|m| m.as_str().to_string())
}

fn fraction(captures: &regex::Captures<'_>) -> Option<u32> {
    let digits = captures.name("fraction")?.as_str();
    let padded = format!("{:0<6}", digits);
    padded[..6].parse().ok()
}
