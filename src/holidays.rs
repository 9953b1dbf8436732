//! Country holiday calendars.
//!
//! The workday sensor only depends on [`HolidayProvider`]; [`BuiltinHolidays`] covers the US
//! federal calendar and the German national calendar with a few states.

use chrono::{Datelike, Days, NaiveDate, Weekday};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HolidayError {
    #[error("no holiday calendar for country '{0}'")]
    UnsupportedCountry(String),
    #[error("there is no subdivision '{subdiv}' in country '{country}'")]
    UnsupportedSubdivision { country: String, subdiv: String },
    #[error("year {0} is out of range")]
    InvalidYear(i32),
}

pub trait HolidayProvider: Send + Sync {
    /// Short name used as the sensor's device manufacturer.
    fn name(&self) -> &str;

    /// Version string of the calendar data.
    fn version(&self) -> &str;

    fn holidays(&self, country: &str, subdiv: Option<&str>, year: i32) -> Result<Vec<(NaiveDate, String)>, HolidayError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinHolidays;

type Holidays = Vec<(NaiveDate, String)>;

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate, HolidayError> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or(HolidayError::InvalidYear(year))
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Result<NaiveDate, HolidayError> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n).ok_or(HolidayError::InvalidYear(year))
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Result<NaiveDate, HolidayError> {
    let last = match month {
        12 => ymd(year, 12, 31)?,
        _ => ymd(year, month + 1, 1)?.pred_opt().ok_or(HolidayError::InvalidYear(year))?,
    };
    let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last.checked_sub_days(Days::new(back as u64))
        .ok_or(HolidayError::InvalidYear(year))
}

fn shift(date: NaiveDate, days: i64) -> Result<NaiveDate, HolidayError> {
    let moved = if days >= 0 {
        date.checked_add_days(Days::new(days as u64))
    } else {
        date.checked_sub_days(Days::new(days.unsigned_abs()))
    };
    moved.ok_or(HolidayError::InvalidYear(date.year()))
}

/// Western Easter Sunday (anonymous Gregorian algorithm).
pub fn easter_sunday(year: i32) -> Result<NaiveDate, HolidayError> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    ymd(year, month as u32, day as u32)
}

/// Push a fixed-date federal holiday; Saturday is observed on Friday, Sunday on Monday.
fn push_observed(out: &mut Holidays, date: NaiveDate, name: &str) -> Result<(), HolidayError> {
    out.push((date, name.to_string()));
    let observed = match date.weekday() {
        Weekday::Sat => Some(shift(date, -1)?),
        Weekday::Sun => Some(shift(date, 1)?),
        _ => None,
    };
    // an observance falling into the neighbouring year belongs to that year's calendar
    if let Some(day) = observed
        && day.year() == date.year()
    {
        out.push((day, format!("{} (observed)", name)));
    }
    Ok(())
}

fn united_states(year: i32) -> Result<Holidays, HolidayError> {
    let mut out = Holidays::new();
    push_observed(&mut out, ymd(year, 1, 1)?, "New Year's Day")?;
    if year >= 1986 {
        out.push((nth_weekday(year, 1, Weekday::Mon, 3)?, "Martin Luther King Jr. Day".into()));
    }
    out.push((nth_weekday(year, 2, Weekday::Mon, 3)?, "Washington's Birthday".into()));
    out.push((last_weekday(year, 5, Weekday::Mon)?, "Memorial Day".into()));
    if year >= 2021 {
        push_observed(&mut out, ymd(year, 6, 19)?, "Juneteenth National Independence Day")?;
    }
    push_observed(&mut out, ymd(year, 7, 4)?, "Independence Day")?;
    out.push((nth_weekday(year, 9, Weekday::Mon, 1)?, "Labor Day".into()));
    out.push((nth_weekday(year, 10, Weekday::Mon, 2)?, "Columbus Day".into()));
    push_observed(&mut out, ymd(year, 11, 11)?, "Veterans Day")?;
    out.push((nth_weekday(year, 11, Weekday::Thu, 4)?, "Thanksgiving".into()));
    push_observed(&mut out, ymd(year, 12, 25)?, "Christmas Day")?;
    if ymd(year + 1, 1, 1)?.weekday() == Weekday::Sat {
        out.push((ymd(year, 12, 31)?, "New Year's Day (observed)".into()));
    }
    Ok(out)
}

fn germany(year: i32, subdiv: Option<&str>) -> Result<Holidays, HolidayError> {
    let easter = easter_sunday(year)?;
    let mut out = vec![
        (ymd(year, 1, 1)?, "New Year's Day".to_string()),
        (shift(easter, -2)?, "Good Friday".to_string()),
        (shift(easter, 1)?, "Easter Monday".to_string()),
        (ymd(year, 5, 1)?, "Labor Day".to_string()),
        (shift(easter, 39)?, "Ascension Day".to_string()),
        (shift(easter, 50)?, "Whit Monday".to_string()),
        (ymd(year, 10, 3)?, "German Unity Day".to_string()),
        (ymd(year, 12, 25)?, "Christmas Day".to_string()),
        (ymd(year, 12, 26)?, "Second Day of Christmas".to_string()),
    ];
    match subdiv {
        None => {}
        Some("BW") | Some("BY") => {
            out.push((ymd(year, 1, 6)?, "Epiphany".into()));
            out.push((shift(easter, 60)?, "Corpus Christi".into()));
            out.push((ymd(year, 11, 1)?, "All Saints' Day".into()));
        }
        Some("BE") => {
            if year >= 2019 {
                out.push((ymd(year, 3, 8)?, "International Women's Day".into()));
            }
        }
        Some(other) => {
            return Err(HolidayError::UnsupportedSubdivision {
                country: "DE".into(),
                subdiv: other.into(),
            });
        }
    }
    Ok(out)
}

impl HolidayProvider for BuiltinHolidays {
    fn name(&self) -> &str {
        "dkn-bridge holidays"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn holidays(&self, country: &str, subdiv: Option<&str>, year: i32) -> Result<Vec<(NaiveDate, String)>, HolidayError> {
        let subdiv = subdiv.map(str::trim).filter(|s| !s.is_empty());
        match country.trim().to_ascii_uppercase().as_str() {
            "US" => match subdiv {
                None => united_states(year),
                Some(other) => Err(HolidayError::UnsupportedSubdivision {
                    country: "US".into(),
                    subdiv: other.into(),
                }),
            },
            "DE" => germany(year, subdiv.map(|s| s.to_ascii_uppercase()).as_deref()),
            other => Err(HolidayError::UnsupportedCountry(other.to_string())),
        }
    }
}
