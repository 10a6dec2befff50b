//! Time-period classification.
//!
//! A [`PeriodCalendar`] is the user-facing definition (rules plus holidays).
//! It compiles into a [`CompiledCalendar`], a lookup table of day type by
//! quarter-hour slot, so classifying a whole table is one linear pass.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ingest::ObservationTable;

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const SLOT_MINUTES: u16 = 15;
pub const SLOTS_PER_DAY: usize = (MINUTES_PER_DAY / SLOT_MINUTES) as usize;

/// Marker used in classified period columns for rows that were dropped.
pub const UNCLASSIFIED: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Period {
    AmPeak,
    Midday,
    PmPeak,
    Overnight,
    Weekend,
}

impl Period {
    pub const ALL: [Period; 5] = [
        Period::AmPeak,
        Period::Midday,
        Period::PmPeak,
        Period::Overnight,
        Period::Weekend,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Period> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Period::AmPeak => "AM_PEAK",
            Period::Midday => "MIDDAY",
            Period::PmPeak => "PM_PEAK",
            Period::Overnight => "OVERNIGHT",
            Period::Weekend => "WEEKEND",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which day types a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaySet {
    Weekdays,
    Weekends,
    All,
}

impl DaySet {
    fn covers(self, day: DayType) -> bool {
        matches!(
            (self, day),
            (DaySet::All, _)
                | (DaySet::Weekdays, DayType::Weekday)
                | (DaySet::Weekends, DayType::Weekend)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Weekday,
    Weekend,
}

impl DayType {
    const ALL: [DayType; 2] = [DayType::Weekday, DayType::Weekend];

    fn of(date: NaiveDate) -> DayType {
        match date.weekday() {
            Weekday::Sat | Weekday::Sun => DayType::Weekend,
            _ => DayType::Weekday,
        }
    }
}

/// What happens to observations falling on a listed holiday.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolidayPolicy {
    #[default]
    Exclude,
    TreatAsWeekend,
}

/// One bucket edge pair: `[start, end)` in minutes of day.
///
/// `start > end` wraps past midnight. Times are written as `"HH:MM"` and
/// `"24:00"` is accepted as an end bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodRule {
    pub period: Period,
    pub days: DaySet,
    #[serde(with = "hhmm")]
    pub start: u16,
    #[serde(with = "hhmm")]
    pub end: u16,
}

impl PeriodRule {
    pub fn new(period: Period, days: DaySet, start: u16, end: u16) -> Self {
        Self {
            period,
            days,
            start,
            end,
        }
    }

    fn slots(&self) -> Vec<usize> {
        let start = (self.start / SLOT_MINUTES) as usize;
        let end = (self.end / SLOT_MINUTES) as usize;
        if start < end {
            (start..end).collect()
        } else {
            (start..SLOTS_PER_DAY).chain(0..end).collect()
        }
    }

    fn validate(&self) -> Result<()> {
        for bound in [self.start, self.end] {
            if bound > MINUTES_PER_DAY || bound % SLOT_MINUTES != 0 {
                return Err(Error::InvalidConfig(format!(
                    "{} rule bound {} must be a multiple of {} minutes within the day",
                    self.period,
                    hhmm::format(bound),
                    SLOT_MINUTES
                )));
            }
        }
        if self.start == self.end || (self.start == MINUTES_PER_DAY && self.end == 0) {
            return Err(Error::InvalidConfig(format!(
                "{} rule has an empty or ambiguous range {}-{}",
                self.period,
                hhmm::format(self.start),
                hhmm::format(self.end)
            )));
        }
        Ok(())
    }
}

/// Bucket definitions plus the holiday calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodCalendar {
    pub rules: Vec<PeriodRule>,
    pub holidays: BTreeSet<NaiveDate>,
    pub holiday_policy: HolidayPolicy,
}

impl Default for PeriodCalendar {
    /// Weekday peaks and midday, weekend daytime, and overnight on every day.
    fn default() -> Self {
        Self {
            rules: vec![
                PeriodRule::new(Period::AmPeak, DaySet::Weekdays, 6 * 60, 10 * 60),
                PeriodRule::new(Period::Midday, DaySet::Weekdays, 10 * 60, 16 * 60),
                PeriodRule::new(Period::PmPeak, DaySet::Weekdays, 16 * 60, 20 * 60),
                PeriodRule::new(Period::Weekend, DaySet::Weekends, 6 * 60, 20 * 60),
                PeriodRule::new(Period::Overnight, DaySet::All, 20 * 60, 6 * 60),
            ],
            holidays: BTreeSet::new(),
            holiday_policy: HolidayPolicy::default(),
        }
    }
}

impl PeriodCalendar {
    /// Validates the rules and builds the slot lookup table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for misaligned bounds, empty ranges,
    /// or two rules claiming the same slot of the same day type.
    pub fn compile(&self) -> Result<CompiledCalendar> {
        let mut slots = [[UNCLASSIFIED; SLOTS_PER_DAY]; 2];

        for rule in &self.rules {
            rule.validate()?;
            for day in DayType::ALL {
                if !rule.days.covers(day) {
                    continue;
                }
                let table = &mut slots[day as usize];
                for slot in rule.slots() {
                    if let Some(existing) = Period::from_code(table[slot]) {
                        return Err(Error::InvalidConfig(format!(
                            "{} and {} overlap on {:?} at {}",
                            existing,
                            rule.period,
                            day,
                            hhmm::format(slot as u16 * SLOT_MINUTES)
                        )));
                    }
                    table[slot] = rule.period.code();
                }
            }
        }

        let compiled = CompiledCalendar {
            slots,
            holidays: self.holidays.clone(),
            holiday_policy: self.holiday_policy,
        };
        debug!(
            rules = self.rules.len(),
            holidays = self.holidays.len(),
            uncovered_slots = compiled.uncovered_slots(),
            "Compiled period calendar"
        );
        Ok(compiled)
    }
}

/// Outcome of classifying one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    Period(Period),
    Unbucketed,
    Holiday,
}

/// A contiguous run of slots sharing one classification, for auditing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarSpan {
    pub day_type: DayType,
    pub start: String,
    pub end: String,
    pub period: Option<Period>,
}

#[derive(Debug, Clone)]
pub struct CompiledCalendar {
    slots: [[u8; SLOTS_PER_DAY]; 2],
    holidays: BTreeSet<NaiveDate>,
    holiday_policy: HolidayPolicy,
}

impl CompiledCalendar {
    fn day_code(&self, date: NaiveDate) -> Option<DayType> {
        if self.holidays.contains(&date) {
            return match self.holiday_policy {
                HolidayPolicy::Exclude => None,
                HolidayPolicy::TreatAsWeekend => Some(DayType::Weekend),
            };
        }
        Some(DayType::of(date))
    }

    fn lookup(&self, day: Option<DayType>, minute_of_day: u32) -> Classified {
        let Some(day) = day else {
            return Classified::Holiday;
        };
        let slot = (minute_of_day / SLOT_MINUTES as u32) as usize;
        match Period::from_code(self.slots[day as usize][slot]) {
            Some(period) => Classified::Period(period),
            None => Classified::Unbucketed,
        }
    }

    pub fn classify(&self, timestamp: NaiveDateTime) -> Classified {
        let minute_of_day = timestamp.hour() * 60 + timestamp.minute();
        self.lookup(self.day_code(timestamp.date()), minute_of_day)
    }

    /// Number of (day type, slot) cells that no rule claims.
    pub fn uncovered_slots(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|&&code| code == UNCLASSIFIED)
            .count()
    }

    /// Run-length view of the lookup table.
    pub fn spans(&self) -> Vec<CalendarSpan> {
        let mut spans = Vec::new();
        for day in DayType::ALL {
            let table = &self.slots[day as usize];
            let mut start = 0;
            while start < SLOTS_PER_DAY {
                let code = table[start];
                let mut end = start + 1;
                while end < SLOTS_PER_DAY && table[end] == code {
                    end += 1;
                }
                spans.push(CalendarSpan {
                    day_type: day,
                    start: hhmm::format(start as u16 * SLOT_MINUTES),
                    end: hhmm::format(end as u16 * SLOT_MINUTES),
                    period: Period::from_code(code),
                });
                start = end;
            }
        }
        spans
    }

    /// Classifies every row of `table` in one pass.
    ///
    /// Day types are cached per calendar day since extracts are usually
    /// ordered by time within each segment.
    #[tracing::instrument(skip_all, fields(source = %table.source_name(), rows = table.len()))]
    pub fn classify_table(&self, table: &ObservationTable) -> Classification {
        let mut periods = Vec::with_capacity(table.len());
        let mut report = ClassificationReport::default();
        let mut cached: Option<(i32, Option<DayType>)> = None;

        for &minutes in table.minutes() {
            let day_offset = minutes.div_euclid(MINUTES_PER_DAY as i32);
            let day = match cached {
                Some((offset, day)) if offset == day_offset => day,
                _ => {
                    let day = self.day_code(table.date_at(day_offset));
                    cached = Some((day_offset, day));
                    day
                }
            };
            let minute_of_day = minutes.rem_euclid(MINUTES_PER_DAY as i32) as u32;
            let classified = self.lookup(day, minute_of_day);
            report.record(classified);
            periods.push(match classified {
                Classified::Period(period) => period.code(),
                _ => UNCLASSIFIED,
            });
        }

        debug!(
            classified = report.classified,
            dropped_unbucketed = report.dropped_unbucketed,
            dropped_holiday = report.dropped_holiday,
            "Classified observations"
        );
        Classification { periods, report }
    }
}

/// Drop-count diagnostics for the classification stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationReport {
    pub classified: u64,
    pub dropped_unbucketed: u64,
    pub dropped_holiday: u64,
    pub per_period: BTreeMap<Period, u64>,
}

impl ClassificationReport {
    pub fn record(&mut self, classified: Classified) {
        match classified {
            Classified::Period(period) => {
                self.classified += 1;
                *self.per_period.entry(period).or_default() += 1;
            }
            Classified::Unbucketed => self.dropped_unbucketed += 1,
            Classified::Holiday => self.dropped_holiday += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_unbucketed + self.dropped_holiday
    }
}

/// Per-row period codes aligned with the source table, plus drop counts.
#[derive(Debug, Clone)]
pub struct Classification {
    periods: Vec<u8>,
    pub report: ClassificationReport,
}

impl Classification {
    /// Period code per row, [`UNCLASSIFIED`] for dropped rows.
    pub fn codes(&self) -> &[u8] {
        &self.periods
    }

    pub fn period(&self, row: usize) -> Option<Period> {
        self.periods.get(row).copied().and_then(Period::from_code)
    }
}

mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn format(minutes: u16) -> String {
        format!("{:02}:{:02}", minutes / 60, minutes % 60)
    }

    pub fn parse(text: &str) -> Option<u16> {
        let (hours, minutes) = text.trim().split_once(':')?;
        let hours: u16 = hours.parse().ok()?;
        let minutes: u16 = minutes.parse().ok()?;
        if minutes >= 60 || hours > 24 || (hours == 24 && minutes != 0) {
            return None;
        }
        Some(hours * 60 + minutes)
    }

    pub fn serialize<S: Serializer>(minutes: &u16, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*minutes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).ok_or_else(|| de::Error::custom(format!("invalid time of day '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ColumnMap, ExtractReader};

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M").unwrap()
    }

    // 2023-03-15 is a Wednesday, 2023-03-18 a Saturday.
    const WEDNESDAY: &str = "2023-03-15";
    const SATURDAY: &str = "2023-03-18";

    #[test]
    fn test_default_calendar_partitions_every_slot() {
        let calendar = PeriodCalendar::default().compile().unwrap();
        assert_eq!(calendar.uncovered_slots(), 0);

        for date in [WEDNESDAY, SATURDAY] {
            for slot in 0..SLOTS_PER_DAY {
                let minutes = slot as u16 * SLOT_MINUTES;
                let ts = at(date, &hhmm::format(minutes));
                assert!(matches!(calendar.classify(ts), Classified::Period(_)));
            }
        }
    }

    #[test]
    fn test_default_calendar_bucket_edges() {
        let calendar = PeriodCalendar::default().compile().unwrap();
        let expect = |date, time, period| {
            assert_eq!(
                calendar.classify(at(date, time)),
                Classified::Period(period),
                "{date} {time}"
            );
        };

        expect(WEDNESDAY, "05:45", Period::Overnight);
        expect(WEDNESDAY, "06:00", Period::AmPeak);
        expect(WEDNESDAY, "09:45", Period::AmPeak);
        expect(WEDNESDAY, "10:00", Period::Midday);
        expect(WEDNESDAY, "15:45", Period::Midday);
        expect(WEDNESDAY, "16:00", Period::PmPeak);
        expect(WEDNESDAY, "19:45", Period::PmPeak);
        expect(WEDNESDAY, "20:00", Period::Overnight);
        expect(WEDNESDAY, "00:00", Period::Overnight);
        expect(SATURDAY, "06:00", Period::Weekend);
        expect(SATURDAY, "19:45", Period::Weekend);
        expect(SATURDAY, "20:00", Period::Overnight);
        expect(SATURDAY, "02:15", Period::Overnight);
    }

    #[test]
    fn test_unaligned_minutes_use_their_slot() {
        let calendar = PeriodCalendar::default().compile().unwrap();
        assert_eq!(
            calendar.classify(at(WEDNESDAY, "09:59")),
            Classified::Period(Period::AmPeak)
        );
    }

    #[test]
    fn test_overlapping_rules_rejected() {
        let mut calendar = PeriodCalendar::default();
        calendar
            .rules
            .push(PeriodRule::new(Period::Midday, DaySet::All, 9 * 60, 11 * 60));
        let err = calendar.compile().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_misaligned_bound_rejected() {
        let calendar = PeriodCalendar {
            rules: vec![PeriodRule::new(Period::AmPeak, DaySet::All, 6 * 60 + 5, 9 * 60)],
            ..Default::default()
        };
        assert!(calendar.compile().is_err());
    }

    #[test]
    fn test_gaps_are_unbucketed() {
        let calendar = PeriodCalendar {
            rules: vec![PeriodRule::new(Period::AmPeak, DaySet::Weekdays, 6 * 60, 9 * 60)],
            ..Default::default()
        }
        .compile()
        .unwrap();

        assert_eq!(calendar.classify(at(WEDNESDAY, "12:00")), Classified::Unbucketed);
        assert_eq!(calendar.classify(at(SATURDAY, "07:00")), Classified::Unbucketed);
        assert_eq!(
            calendar.uncovered_slots(),
            2 * SLOTS_PER_DAY - (3 * 60 / SLOT_MINUTES as usize)
        );
    }

    #[test]
    fn test_holiday_policies() {
        let holiday = NaiveDate::from_ymd_opt(2023, 3, 15).unwrap();
        let mut calendar = PeriodCalendar::default();
        calendar.holidays.insert(holiday);

        let excluded = calendar.compile().unwrap();
        assert_eq!(excluded.classify(at(WEDNESDAY, "07:00")), Classified::Holiday);

        calendar.holiday_policy = HolidayPolicy::TreatAsWeekend;
        let as_weekend = calendar.compile().unwrap();
        assert_eq!(
            as_weekend.classify(at(WEDNESDAY, "07:00")),
            Classified::Period(Period::Weekend)
        );
    }

    #[test]
    fn test_classify_table_counts_holiday_and_unbucketed_drops() {
        // The first row sets the table's base date, so the 07-03 and 07-04
        // rows sit at negative minute offsets.
        let csv = "tmc_code,measurement_tstamp,travel_time_seconds\n\
                   A,2023-07-05 07:00:00,30\n\
                   A,2023-07-04 08:00:00,31\n\
                   A,2023-07-05 22:00:00,32\n\
                   A,2023-07-03 07:30:00,33\n\
                   A,2023-07-08 10:00:00,34\n\
                   B,2023-07-04 12:00:00,35\n";
        let reader =
            ExtractReader::from_reader("july.csv", csv.as_bytes(), &ColumnMap::default()).unwrap();
        let table = ObservationTable::from_extract(reader).unwrap();

        let mut calendar = PeriodCalendar {
            rules: vec![
                PeriodRule::new(Period::AmPeak, DaySet::Weekdays, 6 * 60, 10 * 60),
                PeriodRule::new(Period::Weekend, DaySet::Weekends, 6 * 60, 20 * 60),
            ],
            ..Default::default()
        };
        calendar.holidays.insert(NaiveDate::from_ymd_opt(2023, 7, 4).unwrap());

        let excluded = calendar.compile().unwrap().classify_table(&table);
        assert_eq!(excluded.report.classified, 3);
        assert_eq!(excluded.report.dropped_holiday, 2);
        assert_eq!(excluded.report.dropped_unbucketed, 1);
        assert_eq!(excluded.report.dropped(), 3);
        assert_eq!(excluded.report.per_period.get(&Period::AmPeak), Some(&2));
        assert_eq!(excluded.report.per_period.get(&Period::Weekend), Some(&1));
        let periods: Vec<_> = (0..table.len()).map(|row| excluded.period(row)).collect();
        assert_eq!(
            periods,
            vec![
                Some(Period::AmPeak),
                None,
                None,
                Some(Period::AmPeak),
                Some(Period::Weekend),
                None,
            ]
        );

        calendar.holiday_policy = HolidayPolicy::TreatAsWeekend;
        let as_weekend = calendar.compile().unwrap().classify_table(&table);
        assert_eq!(as_weekend.report.dropped_holiday, 0);
        assert_eq!(as_weekend.report.dropped_unbucketed, 1);
        assert_eq!(as_weekend.report.per_period.get(&Period::Weekend), Some(&3));
        assert_eq!(as_weekend.period(1), Some(Period::Weekend));
        assert_eq!(as_weekend.codes()[5], Period::Weekend.code());
    }

    #[test]
    fn test_spans_cover_whole_day() {
        let calendar = PeriodCalendar::default().compile().unwrap();
        let spans = calendar.spans();
        let weekday: Vec<_> = spans
            .iter()
            .filter(|s| s.day_type == DayType::Weekday)
            .collect();
        assert_eq!(weekday.first().unwrap().start, "00:00");
        assert_eq!(weekday.last().unwrap().end, "24:00");
        assert_eq!(weekday.len(), 5);
    }

    #[test]
    fn test_calendar_json_round_trip_uses_clock_times() {
        let json = serde_json::to_string(&PeriodCalendar::default()).unwrap();
        assert!(json.contains("\"06:00\""));
        assert!(json.contains("\"AM_PEAK\""));
        let parsed: PeriodCalendar = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, PeriodCalendar::default());
    }

    #[test]
    fn test_hhmm_parse() {
        assert_eq!(hhmm::parse("24:00"), Some(1440));
        assert_eq!(hhmm::parse("06:30"), Some(390));
        assert_eq!(hhmm::parse("24:15"), None);
        assert_eq!(hhmm::parse("7"), None);
    }
}
