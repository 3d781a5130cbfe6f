use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SECOND_RANGE: (u32, u32) = (0, 59);
pub const MINUTE_RANGE: (u32, u32) = (0, 59);
pub const HOUR_RANGE: (u32, u32) = (0, 23);

/// Rejected schedule or filter input. Raised when an expression is created
/// or edited, before it ever reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("empty expression")]
    Empty,
    #[error("malformed expression part: {0:?}")]
    Syntax(String),
    #[error("value {value} outside allowed range {lo}-{hi}")]
    OutOfRange { value: u32, lo: u32, hi: u32 },
    #[error("range start {0} is greater than range end {1}")]
    InvertedRange(u32, u32),
    #[error("step must be at least 1")]
    ZeroStep,
    #[error("interval amount must be at least 1")]
    ZeroAmount,
    #[error("active-hours window {0}-{0} is ambiguous")]
    EmptyWindow(u32),
    #[error("date range start {0} is after end {1}")]
    InvertedDates(NaiveDate, NaiveDate),
    #[error("invalid date: {0:?}")]
    BadDate(String),
    #[error("unknown match mode: {0:?}")]
    BadMode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    All,
    Step(u32),
    Value(u32),
    Range(u32, u32),
    RangeStep(u32, u32, u32),
}

/// One cron-style sub-expression over a fixed integer range, e.g. an hour
/// field over 0-23. Parsed terms are kept verbatim so that any accepted
/// text reserializes byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldExpr {
    lo: u32,
    hi: u32,
    terms: Vec<Term>,
}

impl FieldExpr {
    pub fn parse(text: &str, lo: u32, hi: u32) -> Result<Self, ValidationError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ValidationError::Empty);
        }
        let mut terms = Vec::new();
        for part in text.split(',') {
            terms.push(parse_term(part.trim(), lo, hi)?);
        }
        Ok(Self { lo, hi, terms })
    }

    pub fn all(lo: u32, hi: u32) -> Self {
        Self {
            lo,
            hi,
            terms: vec![Term::All],
        }
    }

    /// Build the hour expression for an active-hours window.
    ///
    /// `from == to == 0` means the whole day. A window crossing midnight is
    /// encoded as two ranges, e.g. 22..2 becomes `22-23,0-2` (both ends
    /// inclusive). Equal non-zero bounds are rejected rather than guessed.
    pub fn active_hours(from: u32, to: u32) -> Result<Self, ValidationError> {
        let (lo, hi) = HOUR_RANGE;
        for value in [from, to] {
            if value > hi {
                return Err(ValidationError::OutOfRange { value, lo, hi });
            }
        }
        if from == 0 && to == 0 {
            return Ok(Self::all(lo, hi));
        }
        if from == to {
            return Err(ValidationError::EmptyWindow(from));
        }
        let terms = if from < to {
            vec![Term::Range(from, to)]
        } else {
            vec![Term::Range(from, hi), Term::Range(lo, to)]
        };
        Ok(Self { lo, hi, terms })
    }

    pub fn matches(&self, value: u32) -> bool {
        if value < self.lo || value > self.hi {
            return false;
        }
        self.terms.iter().any(|term| match *term {
            Term::All => true,
            Term::Step(step) => (value - self.lo) % step == 0,
            Term::Value(v) => value == v,
            Term::Range(a, b) => value >= a && value <= b,
            Term::RangeStep(a, b, step) => value >= a && value <= b && (value - a) % step == 0,
        })
    }

    /// Enumerate matching values in ascending order, optionally capped.
    /// Previews use the cap; the match test never does.
    pub fn expand(&self, max_items: Option<usize>) -> Vec<u32> {
        let mut values: Vec<u32> = (self.lo..=self.hi).filter(|v| self.matches(*v)).collect();
        if let Some(max) = max_items {
            values.truncate(max);
        }
        values
    }
}

fn parse_term(part: &str, lo: u32, hi: u32) -> Result<Term, ValidationError> {
    if part.is_empty() {
        return Err(ValidationError::Empty);
    }
    if part == "*" {
        return Ok(Term::All);
    }
    let (body, step) = match part.split_once('/') {
        Some((body, step_str)) => {
            let step = step_str
                .parse::<u32>()
                .map_err(|_| ValidationError::Syntax(part.to_string()))?;
            if step == 0 {
                return Err(ValidationError::ZeroStep);
            }
            (body, Some(step))
        }
        None => (part, None),
    };

    if body == "*" {
        return match step {
            Some(step) => Ok(Term::Step(step)),
            None => Ok(Term::All),
        };
    }

    if let Some((a_str, b_str)) = body.split_once('-') {
        let a = parse_value(a_str, lo, hi)?;
        let b = parse_value(b_str, lo, hi)?;
        if a > b {
            return Err(ValidationError::InvertedRange(a, b));
        }
        return match step {
            Some(step) => Ok(Term::RangeStep(a, b, step)),
            None => Ok(Term::Range(a, b)),
        };
    }

    if step.is_some() {
        // bare value with a step ("5/2") is not part of the grammar
        return Err(ValidationError::Syntax(part.to_string()));
    }
    Ok(Term::Value(parse_value(body, lo, hi)?))
}

fn parse_value(text: &str, lo: u32, hi: u32) -> Result<u32, ValidationError> {
    let value = text
        .trim()
        .parse::<u32>()
        .map_err(|_| ValidationError::Syntax(text.to_string()))?;
    if value < lo || value > hi {
        return Err(ValidationError::OutOfRange { value, lo, hi });
    }
    Ok(value)
}

impl fmt::Display for FieldExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match *term {
                Term::All => write!(f, "*")?,
                Term::Step(step) => write!(f, "*/{step}")?,
                Term::Value(v) => write!(f, "{v}")?,
                Term::Range(a, b) => write!(f, "{a}-{b}")?,
                Term::RangeStep(a, b, step) => write!(f, "{a}-{b}/{step}")?,
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
}

impl IntervalUnit {
    pub fn seconds(self) -> i64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3600,
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalUnit::Seconds => write!(f, "seconds"),
            IntervalUnit::Minutes => write!(f, "minutes"),
            IntervalUnit::Hours => write!(f, "hours"),
        }
    }
}

/// When a schedule fires: either clock-aligned cron fields or a fixed
/// interval anchored to a start instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Cron {
        #[serde(default = "default_second", with = "second_text")]
        second: FieldExpr,
        #[serde(default = "default_minute", with = "minute_text")]
        minute: FieldExpr,
        #[serde(default = "default_hour", with = "hour_text")]
        hour: FieldExpr,
    },
    Interval {
        amount: u32,
        unit: IntervalUnit,
        anchor: NaiveDateTime,
    },
}

fn default_second() -> FieldExpr {
    FieldExpr {
        lo: SECOND_RANGE.0,
        hi: SECOND_RANGE.1,
        terms: vec![Term::Value(0)],
    }
}

fn default_minute() -> FieldExpr {
    FieldExpr::all(MINUTE_RANGE.0, MINUTE_RANGE.1)
}

fn default_hour() -> FieldExpr {
    FieldExpr::all(HOUR_RANGE.0, HOUR_RANGE.1)
}

macro_rules! field_text {
    ($name:ident, $range:expr) => {
        mod $name {
            use super::FieldExpr;
            use serde::{Deserialize, Deserializer, Serializer, de::Error};

            pub fn serialize<S: Serializer>(
                expr: &FieldExpr,
                serializer: S,
            ) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&expr.to_string())
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                deserializer: D,
            ) -> Result<FieldExpr, D::Error> {
                let text = String::deserialize(deserializer)?;
                FieldExpr::parse(&text, $range.0, $range.1).map_err(D::Error::custom)
            }
        }
    };
}

field_text!(second_text, super::SECOND_RANGE);
field_text!(minute_text, super::MINUTE_RANGE);
field_text!(hour_text, super::HOUR_RANGE);

impl Trigger {
    pub fn cron(second: &str, minute: &str, hour: &str) -> Result<Self, ValidationError> {
        Ok(Trigger::Cron {
            second: FieldExpr::parse(second, SECOND_RANGE.0, SECOND_RANGE.1)?,
            minute: FieldExpr::parse(minute, MINUTE_RANGE.0, MINUTE_RANGE.1)?,
            hour: FieldExpr::parse(hour, HOUR_RANGE.0, HOUR_RANGE.1)?,
        })
    }

    pub fn interval(
        amount: u32,
        unit: IntervalUnit,
        anchor: NaiveDateTime,
    ) -> Result<Self, ValidationError> {
        if amount == 0 {
            return Err(ValidationError::ZeroAmount);
        }
        Ok(Trigger::Interval {
            amount,
            unit,
            anchor,
        })
    }

    /// Whether the trigger fires at `at`, evaluated at whole-second
    /// granularity (the tick cadence). Pure: no state is advanced.
    pub fn matches(&self, at: NaiveDateTime) -> bool {
        match self {
            Trigger::Cron {
                second,
                minute,
                hour,
            } => second.matches(at.second()) && minute.matches(at.minute()) && hour.matches(at.hour()),
            Trigger::Interval {
                amount,
                unit,
                anchor,
            } => {
                let period = i64::from(*amount) * unit.seconds();
                if period <= 0 {
                    return false;
                }
                let delta = at.and_utc().timestamp() - anchor.and_utc().timestamp();
                delta >= 0 && delta % period == 0
            }
        }
    }

    /// Sample fire instants for previews. Cron triggers are expanded over
    /// `date`; interval triggers walk forward from their anchor.
    pub fn preview(&self, date: NaiveDate, max_items: usize) -> Vec<NaiveDateTime> {
        match self {
            Trigger::Cron {
                second,
                minute,
                hour,
            } => {
                let mut out = Vec::new();
                'outer: for h in hour.expand(None) {
                    for m in minute.expand(None) {
                        for s in second.expand(None) {
                            if out.len() >= max_items {
                                break 'outer;
                            }
                            if let Some(at) = date.and_hms_opt(h, m, s) {
                                out.push(at);
                            }
                        }
                    }
                }
                out
            }
            Trigger::Interval {
                amount,
                unit,
                anchor,
            } => {
                let period = Duration::seconds(i64::from(*amount) * unit.seconds());
                (0..max_items as i32)
                    .map(|k| *anchor + period * k)
                    .collect()
            }
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron {
                second,
                minute,
                hour,
            } => write!(f, "cron sec={second} min={minute} hour={hour}"),
            Trigger::Interval {
                amount,
                unit,
                anchor,
            } => write!(f, "every {amount} {unit} from {anchor}"),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One schedule entry attached to a camera or export. Disabled rules are
/// kept in config but never matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRule {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub trigger: Trigger,
}
