use crate::error::{CoreError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// An RFC 3339 instant, as used by FHIR `instant` and `dateTime` fields.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FhirDateTime(pub OffsetDateTime);

impl FhirDateTime {
    pub fn new(datetime: OffsetDateTime) -> Self {
        Self(datetime)
    }

    pub fn inner(&self) -> &OffsetDateTime {
        &self.0
    }

    pub fn into_inner(self) -> OffsetDateTime {
        self.0
    }

    pub fn timestamp(&self) -> i64 {
        self.0.unix_timestamp()
    }

    /// The date portion formatted as `YYYY-MM-DD` in UTC.
    pub fn utc_date(&self) -> String {
        let utc = self.0.to_offset(time::UtcOffset::UTC);
        format!(
            "{:04}-{:02}-{:02}",
            utc.year(),
            u8::from(utc.month()),
            utc.day()
        )
    }

    /// Reformat as RFC 3339 with the offset converted to UTC `Z` form.
    pub fn to_utc_string(&self) -> String {
        FhirDateTime(self.0.to_offset(time::UtcOffset::UTC)).to_string()
    }
}

impl fmt::Display for FhirDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|_| fmt::Error)?;
        write!(f, "{formatted}")
    }
}

impl FromStr for FhirDateTime {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let datetime = OffsetDateTime::parse(s, &time::format_description::well_known::Rfc3339)
            .map_err(|e| {
                CoreError::invalid_date_time(format!("Failed to parse FHIR DateTime '{s}': {e}"))
            })?;
        Ok(FhirDateTime(datetime))
    }
}

impl Serialize for FhirDateTime {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = self
            .0
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }
}

impl<'de> Deserialize<'de> for FhirDateTime {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        FhirDateTime::from_str(&s).map_err(serde::de::Error::custom)
    }
}

pub fn now_utc() -> FhirDateTime {
    FhirDateTime(OffsetDateTime::now_utc())
}

/// Parse a FHIR `dateTime` value leniently, for comparison purposes.
///
/// FHIR allows `YYYY`, `YYYY-MM`, and `YYYY-MM-DD` partial forms, as well
/// as leap seconds, none of which RFC 3339 parsers accept. Partial dates
/// are filled in with their earliest moment. Values without an offset get
/// UTC+14:00, the earliest timezone on Earth, so that a transaction time
/// derived from one can only ever err toward re-fetching a resource, never
/// toward skipping it.
pub fn parse_lenient(value: &str) -> Option<FhirDateTime> {
    if value.is_empty() {
        return None;
    }

    let mut padded = value.to_owned();
    match padded.len() {
        4 => padded.push_str("-01-01"),
        7 => padded.push_str("-01"),
        _ => {}
    }
    if padded.len() == 10 {
        padded.push_str("T00:00:00");
    }

    // FHIR says receivers SHOULD accept leap seconds; `time` does not
    // represent them, so clamp to :59. Seconds are the only place a :60
    // can legally appear.
    let mut padded = padded.replace(":60", ":59");

    if padded.len() > 11 {
        let time_part = &padded[11..];
        let has_offset = time_part.contains('+')
            || time_part.contains('-')
            || time_part.ends_with('Z')
            || time_part.ends_with('z');
        if !has_offset {
            padded.push_str("+14:00");
        }
    }

    OffsetDateTime::parse(&padded, &time::format_description::well_known::Rfc3339)
        .ok()
        .map(FhirDateTime)
}
