//! Core domain model for GCF: providers, canonical records and query filters.

use std::fmt;
use std::str::FromStr;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "gcf-core";

/// External data source. The display string is the persisted provider name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "SAM.gov")]
    SamGov,
    #[serde(rename = "USAspending.gov")]
    UsaSpending,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::SamGov, Provider::UsaSpending];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::SamGov => "SAM.gov",
            Provider::UsaSpending => "USAspending.gov",
        }
    }

    pub fn record_kind(self) -> RecordKind {
        match self {
            Provider::SamGov => RecordKind::Opportunity,
            Provider::UsaSpending => RecordKind::Award,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown provider `{0}`")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProvider(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Opportunity,
    Award,
}

impl RecordKind {
    pub fn table_name(self) -> &'static str {
        match self {
            RecordKind::Opportunity => "opportunities",
            RecordKind::Award => "awards",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Opportunity => f.write_str("opportunity"),
            RecordKind::Award => f.write_str("award"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionMode {
    #[default]
    AppendOnly,
    FullRefresh,
}

impl RetentionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetentionMode::AppendOnly => "append-only",
            RetentionMode::FullRefresh => "full-refresh",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown retention mode `{0}` (expected append-only or full-refresh)")]
pub struct UnknownRetentionMode(pub String);

impl FromStr for RetentionMode {
    type Err = UnknownRetentionMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "append-only" | "append_only" | "append" => Ok(RetentionMode::AppendOnly),
            "full-refresh" | "full_refresh" | "refresh" => Ok(RetentionMode::FullRefresh),
            _ => Err(UnknownRetentionMode(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub provider: Provider,
    pub identifier: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opportunity {
    pub provider: Provider,
    pub solicitation_number: String,
    pub title: String,
    pub agency: String,
    pub posted_date: Option<NaiveDate>,
    pub classification_code: String,
    pub link: String,
}

impl Opportunity {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            provider: self.provider,
            identifier: self.solicitation_number.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Award {
    pub provider: Provider,
    pub award_id: String,
    pub recipient_name: String,
    pub agency: String,
    pub action_date: Option<NaiveDate>,
    pub classification_code: String,
    pub link: String,
}

impl Award {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            provider: self.provider,
            identifier: self.award_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CanonicalRecord {
    Opportunity(Opportunity),
    Award(Award),
}

impl CanonicalRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            CanonicalRecord::Opportunity(_) => RecordKind::Opportunity,
            CanonicalRecord::Award(_) => RecordKind::Award,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self {
            CanonicalRecord::Opportunity(o) => o.natural_key(),
            CanonicalRecord::Award(a) => a.natural_key(),
        }
    }

    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            CanonicalRecord::Opportunity(o) => o.posted_date,
            CanonicalRecord::Award(a) => a.action_date,
        }
    }
}

impl From<Opportunity> for CanonicalRecord {
    fn from(value: Opportunity) -> Self {
        CanonicalRecord::Opportunity(value)
    }
}

impl From<Award> for CanonicalRecord {
    fn from(value: Award) -> Self {
        CanonicalRecord::Award(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOpportunity {
    pub id: i64,
    #[serde(flatten)]
    pub record: Opportunity,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAward {
    pub id: i64,
    #[serde(flatten)]
    pub record: Award,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn trailing(end: NaiveDate, days: u64) -> Self {
        let start = end.checked_sub_days(Days::new(days)).unwrap_or(NaiveDate::MIN);
        Self { start, end }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFilters {
    pub keyword: Option<String>,
    pub classification_code: Option<String>,
}

impl FetchFilters {
    pub fn keyword(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref())
    }

    pub fn classification_code(&self) -> Option<&str> {
        non_blank(self.classification_code.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub keyword: Option<String>,
    pub classification_code: Option<String>,
    pub limit: Option<u32>,
}

impl RecordQuery {
    pub fn keyword(&self) -> Option<&str> {
        non_blank(self.keyword.as_deref())
    }

    pub fn classification_code(&self) -> Option<&str> {
        non_blank(self.classification_code.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
