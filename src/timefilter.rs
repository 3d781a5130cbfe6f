use crate::schedule::{FieldExpr, HOUR_RANGE, MINUTE_RANGE, ValidationError};
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use std::collections::HashSet;

/// Which dates of a sequence a filter applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum DateSpan {
    All,
    Single(NaiveDate),
    Range { from: NaiveDate, to: NaiveDate },
    Dates(Vec<NaiveDate>),
}

impl DateSpan {
    pub fn contains(&self, date: NaiveDate) -> bool {
        match self {
            DateSpan::All => true,
            DateSpan::Single(day) => *day == date,
            DateSpan::Range { from, to } => date >= *from && date <= *to,
            DateSpan::Dates(days) => days.contains(&date),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MatchMode {
    /// Keep items whose minute-truncated timestamp equals a slot.
    Exact,
    /// Keep, per slot, the single closest item within the window.
    Nearest { window: Duration },
}

/// A validated time filter: date span plus cron-style hour/minute masks.
/// Construction fails fast on bad masks or an inverted date range, so a
/// spec that reaches `select` is always valid.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterSpec {
    pub span: DateSpan,
    pub hour: FieldExpr,
    pub minute: FieldExpr,
    pub mode: MatchMode,
}

impl FilterSpec {
    pub fn new(
        span: DateSpan,
        hour: &str,
        minute: &str,
        mode: MatchMode,
    ) -> Result<Self, ValidationError> {
        if let DateSpan::Range { from, to } = &span {
            if from > to {
                return Err(ValidationError::InvertedDates(*from, *to));
            }
        }
        Ok(Self {
            span,
            hour: FieldExpr::parse(hour, HOUR_RANGE.0, HOUR_RANGE.1)?,
            minute: FieldExpr::parse(minute, MINUTE_RANGE.0, MINUTE_RANGE.1)?,
            mode,
        })
    }

    /// Target instants: the hour x minute cross product expanded (uncapped)
    /// over every date present in the filtered input, ascending.
    fn slots(&self, dates: &[NaiveDate]) -> Vec<NaiveDateTime> {
        let hours = self.hour.expand(None);
        let minutes = self.minute.expand(None);
        let mut slots = Vec::with_capacity(dates.len() * hours.len() * minutes.len());
        for date in dates {
            for hour in &hours {
                for minute in &minutes {
                    if let Some(at) = date.and_hms_opt(*hour, *minute, 0) {
                        slots.push(at);
                    }
                }
            }
        }
        slots
    }

    /// Select the matching subset of a timestamped sequence. Output is
    /// always timestamp-ordered; empty input yields an empty result.
    pub fn select<T: Clone>(&self, items: &[(NaiveDateTime, T)]) -> Vec<T> {
        // date filtering first, keeping input order for tie-breaking
        let mut candidates: Vec<(NaiveDateTime, usize)> = items
            .iter()
            .enumerate()
            .filter(|(_, (at, _))| self.span.contains(at.date()))
            .map(|(idx, (at, _))| (*at, idx))
            .collect();
        candidates.sort_by_key(|(at, idx)| (*at, *idx));
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut dates: Vec<NaiveDate> = candidates.iter().map(|(at, _)| at.date()).collect();
        dates.dedup();
        let slots = self.slots(&dates);

        let mut picked: Vec<(NaiveDateTime, usize)> = match self.mode {
            MatchMode::Exact => {
                let slot_set: HashSet<NaiveDateTime> = slots.into_iter().collect();
                candidates
                    .into_iter()
                    .filter(|(at, _)| {
                        at.with_second(0)
                            .map(|t| slot_set.contains(&t))
                            .unwrap_or(false)
                    })
                    .collect()
            }
            MatchMode::Nearest { window } => {
                let mut used: HashSet<usize> = HashSet::new();
                let mut chosen = Vec::new();
                for slot in slots {
                    let best = candidates
                        .iter()
                        .filter(|(_, idx)| !used.contains(idx))
                        .min_by_key(|(at, idx)| ((*at - slot).abs(), *at, *idx));
                    if let Some((at, idx)) = best {
                        if (*at - slot).abs() <= window {
                            used.insert(*idx);
                            chosen.push((*at, *idx));
                        }
                    }
                }
                chosen
            }
        };

        picked.sort_by_key(|(at, idx)| (*at, *idx));
        picked
            .into_iter()
            .map(|(_, idx)| items[idx].1.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
    }

    fn at(d: u32, h: u32, m: u32, s: u32) -> NaiveDateTime {
        date(d).and_hms_opt(h, m, s).unwrap()
    }

    fn nearest(window_minutes: i64) -> MatchMode {
        MatchMode::Nearest {
            window: Duration::minutes(window_minutes),
        }
    }

    #[test]
    fn nearest_picks_closest_within_window() {
        let spec = FilterSpec::new(DateSpan::All, "8-9", "0", nearest(5)).unwrap();
        let items = vec![(at(1, 7, 58, 0), "a"), (at(1, 8, 31, 0), "b")];
        // 07:58 is 2m from the 08:00 slot; 08:31 is 29m from 09:00 -> dropped
        assert_eq!(spec.select(&items), vec!["a"]);
    }

    #[test]
    fn nearest_never_selects_an_item_twice() {
        let spec = FilterSpec::new(DateSpan::All, "8", "0-1", nearest(5)).unwrap();
        let items = vec![(at(1, 8, 0, 30), "only")];
        // two slots (08:00, 08:01), one candidate: it may serve one slot
        assert_eq!(spec.select(&items), vec!["only"]);
    }

    #[test]
    fn nearest_tie_prefers_earliest_timestamp() {
        let spec = FilterSpec::new(DateSpan::All, "8", "0", nearest(5)).unwrap();
        let items = vec![(at(1, 8, 2, 0), "late"), (at(1, 7, 58, 0), "early")];
        assert_eq!(spec.select(&items), vec!["early"]);
    }

    #[test]
    fn nearest_tie_on_timestamp_prefers_input_order() {
        let spec = FilterSpec::new(DateSpan::All, "8", "0", nearest(5)).unwrap();
        let items = vec![(at(1, 8, 1, 0), "first"), (at(1, 8, 1, 0), "second")];
        assert_eq!(spec.select(&items), vec!["first"]);
    }

    #[test]
    fn nearest_output_is_bounded_by_slot_count() {
        let spec = FilterSpec::new(DateSpan::All, "8", "0", nearest(30)).unwrap();
        let items: Vec<(NaiveDateTime, u32)> =
            (0..10).map(|m| (at(1, 8, m, 0), m)).collect();
        // one slot -> at most one survivor
        assert_eq!(spec.select(&items).len(), 1);
    }

    #[test]
    fn exact_keeps_duplicates_in_timestamp_order() {
        let spec = FilterSpec::new(DateSpan::All, "8", "0", MatchMode::Exact).unwrap();
        let items = vec![
            (at(1, 8, 0, 40), "second"),
            (at(1, 8, 0, 10), "first"),
            (at(1, 8, 1, 0), "off-slot"),
        ];
        assert_eq!(spec.select(&items), vec!["first", "second"]);
    }

    #[test]
    fn date_range_restricts_input() {
        let spec = FilterSpec::new(
            DateSpan::Range {
                from: date(2),
                to: date(3),
            },
            "*",
            "0",
            MatchMode::Exact,
        )
        .unwrap();
        let items = vec![
            (at(1, 8, 0, 0), "before"),
            (at(2, 8, 0, 0), "in"),
            (at(4, 8, 0, 0), "after"),
        ];
        assert_eq!(spec.select(&items), vec!["in"]);
    }

    #[test]
    fn single_date_span() {
        let spec = FilterSpec::new(DateSpan::Single(date(2)), "*", "0", MatchMode::Exact).unwrap();
        let items = vec![(at(1, 8, 0, 0), "one"), (at(2, 8, 0, 0), "two")];
        assert_eq!(spec.select(&items), vec!["two"]);
    }

    #[test]
    fn selected_dates_span() {
        let spec = FilterSpec::new(
            DateSpan::Dates(vec![date(1), date(3)]),
            "*",
            "0",
            MatchMode::Exact,
        )
        .unwrap();
        let items = vec![
            (at(1, 8, 0, 0), "one"),
            (at(2, 8, 0, 0), "two"),
            (at(3, 8, 0, 0), "three"),
        ];
        assert_eq!(spec.select(&items), vec!["one", "three"]);
    }

    #[test]
    fn slots_cover_every_remaining_date() {
        let spec = FilterSpec::new(DateSpan::All, "12", "0", nearest(5)).unwrap();
        let items = vec![(at(1, 12, 1, 0), "day1"), (at(2, 11, 58, 0), "day2")];
        assert_eq!(spec.select(&items), vec!["day1", "day2"]);
    }

    #[test]
    fn empty_input_is_empty_output() {
        let spec = FilterSpec::new(DateSpan::All, "*", "*", MatchMode::Exact).unwrap();
        let items: Vec<(NaiveDateTime, &str)> = Vec::new();
        assert!(spec.select(&items).is_empty());
    }

    #[test]
    fn invalid_masks_fail_at_construction() {
        assert!(FilterSpec::new(DateSpan::All, "24", "0", MatchMode::Exact).is_err());
        assert!(FilterSpec::new(DateSpan::All, "*", "*/0", MatchMode::Exact).is_err());
    }

    #[test]
    fn inverted_date_range_fails_at_construction() {
        let err = FilterSpec::new(
            DateSpan::Range {
                from: date(9),
                to: date(2),
            },
            "*",
            "*",
            MatchMode::Exact,
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::InvertedDates(date(9), date(2)));
    }
}
