//! Workday binary sensor: is "today + offset" a workday, given a holiday calendar and
//! include/exclude day lists.

use chrono::{Datelike, NaiveDate, TimeDelta, Weekday};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use crate::holidays::{HolidayError, HolidayProvider};
use crate::utils::serde_enum_name;

const CUSTOM_HOLIDAY_NAME: &str = "Holiday";

#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error(transparent)]
    Holidays(#[from] HolidayError),
    #[error("could not add custom holiday '{value}': {reason}")]
    CustomHoliday { value: String, reason: String },
    #[error("invalid day '{0}', expected one of mon, tue, wed, thu, fri, sat, sun, holiday")]
    DayToken(String),
    #[error("days offset {0} is out of range")]
    Offset(i64),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DayToken {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
    Holiday,
}

impl DayToken {
    pub fn from_weekday(day: Weekday) -> Self {
        match day {
            Weekday::Mon => DayToken::Mon,
            Weekday::Tue => DayToken::Tue,
            Weekday::Wed => DayToken::Wed,
            Weekday::Thu => DayToken::Thu,
            Weekday::Fri => DayToken::Fri,
            Weekday::Sat => DayToken::Sat,
            Weekday::Sun => DayToken::Sun,
        }
    }
}

impl FromStr for DayToken {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mon" => Ok(DayToken::Mon),
            "tue" => Ok(DayToken::Tue),
            "wed" => Ok(DayToken::Wed),
            "thu" => Ok(DayToken::Thu),
            "fri" => Ok(DayToken::Fri),
            "sat" => Ok(DayToken::Sat),
            "sun" => Ok(DayToken::Sun),
            "holiday" => Ok(DayToken::Holiday),
            _ => Err(ConfigurationError::DayToken(s.to_string())),
        }
    }
}

impl Display for DayToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serde_enum_name(self).unwrap_or_default())
    }
}

pub fn parse_days(values: &[String]) -> Result<Vec<DayToken>, ConfigurationError> {
    values.iter().map(|v| v.parse()).collect()
}

const NAME_SEPARATOR: &str = "; ";

/// Resolved holidays for one year, keyed by date. Several names on the same date are joined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HolidayCalendar {
    year: i32,
    days: BTreeMap<NaiveDate, String>,
}

impl HolidayCalendar {
    pub fn new(year: i32) -> Self {
        HolidayCalendar {
            year,
            days: BTreeMap::new(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn insert(&mut self, date: NaiveDate, name: &str) {
        self.days
            .entry(date)
            .and_modify(|existing| {
                if !existing.split(NAME_SEPARATOR).any(|n| n == name) {
                    existing.push_str(NAME_SEPARATOR);
                    existing.push_str(name);
                }
            })
            .or_insert_with(|| name.to_string());
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.days.contains_key(&date)
    }

    pub fn get(&self, date: NaiveDate) -> Option<&str> {
        self.days.get(&date).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaiveDate, &String)> {
        self.days.iter()
    }

    pub fn remove_date(&mut self, date: NaiveDate) -> Option<String> {
        self.days.remove(&date)
    }

    /// Remove every holiday whose name contains `needle`, ignoring case. Other holidays that
    /// share a date with a removed one stay in the calendar.
    pub fn remove_named(&mut self, needle: &str) -> Vec<(NaiveDate, String)> {
        let needle = needle.to_lowercase();
        let mut removed = Vec::new();
        self.days.retain(|date, names| {
            let (gone, kept): (Vec<&str>, Vec<&str>) =
                names.split(NAME_SEPARATOR).partition(|name| name.to_lowercase().contains(&needle));
            if gone.is_empty() {
                return true;
            }
            removed.extend(gone.into_iter().map(|name| (*date, name.to_string())));
            let rest = kept.join(NAME_SEPARATOR);
            *names = rest;
            !names.is_empty()
        });
        removed
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
}

/// Build the calendar for `year`: provider holidays, plus custom dates, minus removals.
///
/// Removals are dates or case-insensitive name fragments; one that matches nothing is only
/// warned about.
pub fn resolve_calendar(
    provider: &dyn HolidayProvider,
    country: &str,
    province: Option<&str>,
    year: i32,
    add_holidays: &[String],
    remove_holidays: &[String],
) -> Result<HolidayCalendar, ConfigurationError> {
    let mut calendar = HolidayCalendar::new(year);
    for (date, name) in provider.holidays(country, province, year)? {
        calendar.insert(date, &name);
    }

    for value in add_holidays {
        let date = parse_date(value).map_err(|e| ConfigurationError::CustomHoliday {
            value: value.clone(),
            reason: e.to_string(),
        })?;
        calendar.insert(date, CUSTOM_HOLIDAY_NAME);
    }

    for value in remove_holidays {
        if let Ok(date) = parse_date(value) {
            match calendar.remove_date(date) {
                Some(name) => debug!("Removed {} ({})", date, name),
                None => warn!("No holiday found matching {}", value),
            }
            continue;
        }
        debug!("Treating '{}' as named holiday", value);
        let removed = calendar.remove_named(value);
        if removed.is_empty() {
            warn!("No holiday found matching '{}'", value);
        }
        for (date, name) in removed {
            debug!("Removed {} {} by name '{}'", date, name, value);
        }
    }
    Ok(calendar)
}

/// Decide a single day; `date` is already offset.
pub fn is_workday(date: NaiveDate, calendar: &HolidayCalendar, workdays: &[DayToken], excludes: &[DayToken]) -> bool {
    let token = DayToken::from_weekday(date.weekday());
    let holiday = calendar.contains(date);
    let included = workdays.contains(&token) || (holiday && workdays.contains(&DayToken::Holiday));
    let excluded = excludes.contains(&token) || (holiday && excludes.contains(&DayToken::Holiday));
    included && !excluded
}

/// Sensor options as configured, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkdayOptions {
    pub name: String,
    pub country: String,
    pub province: Option<String>,
    pub workdays: Vec<String>,
    pub excludes: Vec<String>,
    pub days_offset: i64,
    pub add_holidays: Vec<String>,
    pub remove_holidays: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkdayAttributes {
    pub workdays: Vec<DayToken>,
    pub excludes: Vec<DayToken>,
    pub days_offset: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDeviceInfo {
    pub identifier: String,
    pub name: String,
    pub manufacturer: String,
    pub model: String,
}

pub struct WorkdaySensor {
    options: WorkdayOptions,
    workdays: Vec<DayToken>,
    excludes: Vec<DayToken>,
    provider: Arc<dyn HolidayProvider>,
    calendar: HolidayCalendar,
    is_on: Option<bool>,
}

fn effective_date(today: NaiveDate, offset: i64) -> Result<NaiveDate, ConfigurationError> {
    let delta = TimeDelta::try_days(offset).ok_or(ConfigurationError::Offset(offset))?;
    today.checked_add_signed(delta).ok_or(ConfigurationError::Offset(offset))
}

impl WorkdaySensor {
    /// Validate the options and resolve the calendar for the year of `today + offset`.
    pub fn new(options: WorkdayOptions, provider: Arc<dyn HolidayProvider>, today: NaiveDate) -> Result<Self, ConfigurationError> {
        let workdays = parse_days(&options.workdays)?;
        let excludes = parse_days(&options.excludes)?;
        let year = effective_date(today, options.days_offset)?.year();
        let calendar = Self::resolve(&options, provider.as_ref(), year)?;
        Ok(WorkdaySensor {
            options,
            workdays,
            excludes,
            provider,
            calendar,
            is_on: None,
        })
    }

    fn resolve(options: &WorkdayOptions, provider: &dyn HolidayProvider, year: i32) -> Result<HolidayCalendar, ConfigurationError> {
        let calendar = resolve_calendar(
            provider,
            &options.country,
            options.province.as_deref(),
            year,
            &options.add_holidays,
            &options.remove_holidays,
        )?;
        debug!("Found the following holidays for your configuration:");
        for (date, name) in calendar.iter() {
            debug!("{} {}", date.format("%Y-%m-%d"), name);
        }
        Ok(calendar)
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn unique_id(&self) -> String {
        let slug: String = self
            .options
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!("workday_{}", slug)
    }

    pub fn is_on(&self) -> Option<bool> {
        self.is_on
    }

    pub fn calendar(&self) -> &HolidayCalendar {
        &self.calendar
    }

    pub fn extra_state_attributes(&self) -> WorkdayAttributes {
        WorkdayAttributes {
            workdays: self.workdays.clone(),
            excludes: self.excludes.clone(),
            days_offset: self.options.days_offset,
        }
    }

    pub fn device_info(&self) -> SensorDeviceInfo {
        SensorDeviceInfo {
            identifier: self.unique_id(),
            name: self.options.name.clone(),
            manufacturer: self.provider.name().to_string(),
            model: self.provider.version().to_string(),
        }
    }

    /// Evaluate for `today` and return the new state. Defaults to off when the date cannot
    /// be computed.
    pub fn update(&mut self, today: NaiveDate) -> bool {
        let date = match effective_date(today, self.options.days_offset) {
            Ok(date) => date,
            Err(e) => {
                error!("Workday sensor '{}': {}", self.options.name, e);
                self.is_on = Some(false);
                return false;
            }
        };
        if date.year() != self.calendar.year() {
            match Self::resolve(&self.options, self.provider.as_ref(), date.year()) {
                Ok(calendar) => {
                    info!(
                        "Workday sensor '{}' switched to the {} holiday calendar ({} entries)",
                        self.options.name,
                        date.year(),
                        calendar.len()
                    );
                    self.calendar = calendar;
                }
                Err(e) => error!(
                    "Could not resolve the {} holiday calendar for '{}': {}",
                    date.year(),
                    self.options.name,
                    e
                ),
            }
        }
        let on = is_workday(date, &self.calendar, &self.workdays, &self.excludes);
        self.is_on = Some(on);
        on
    }
}
