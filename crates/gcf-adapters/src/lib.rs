//! Provider client contracts, the SAM.gov / USAspending.gov clients, and the
//! record normalizer that maps raw provider JSON into canonical records.

use async_trait::async_trait;
use chrono::NaiveDate;
use gcf_core::{
    Award, CanonicalRecord, DateWindow, FetchFilters, Opportunity, Provider, RecordKind,
};
use gcf_storage::{FetchError, HttpFetcher};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gcf-adapters";

pub const SAM_GOV_DEFAULT_URL: &str = "https://api.sam.gov/prod/opportunities/v2/search";
pub const USASPENDING_DEFAULT_URL: &str =
    "https://api.usaspending.gov/api/v2/search/spending_by_award/";
pub const DEFAULT_PAGE_LIMIT: usize = 50;

const SAM_GOV_LINK_BASE: &str = "https://sam.gov";
const USASPENDING_LINK_BASE: &str = "https://www.usaspending.gov";

const CONTRACT_AWARD_TYPES: [&str; 4] = ["A", "B", "C", "D"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub window: DateWindow,
    pub filters: FetchFilters,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{provider} response has no `{field}` list")]
    MissingList {
        provider: Provider,
        field: &'static str,
    },
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub provider: Provider,
    pub records: Vec<JsonValue>,
    pub error: Option<ProviderError>,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn provider(&self) -> Provider;

    async fn fetch(&self, http: &HttpFetcher, ctx: &FetchContext) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct SamGovClient {
    base_url: String,
    api_key: String,
    page_limit: usize,
}

impl SamGovClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, page_limit: usize) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            page_limit: page_limit.max(1),
        }
    }

    pub fn query_params(&self, ctx: &FetchContext) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("postedFrom", ctx.window.start.format("%m/%d/%Y").to_string()),
            ("postedTo", ctx.window.end.format("%m/%d/%Y").to_string()),
            ("ptype", "o".to_string()),
            ("limit", self.page_limit.to_string()),
        ];
        if let Some(keyword) = ctx.filters.keyword() {
            params.push(("keyword", keyword.to_string()));
        }
        if let Some(code) = ctx.filters.classification_code() {
            params.push(("naics", code.to_string()));
        }
        params
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, ProviderError> {
        let body = http
            .get_json(
                ctx.run_id,
                self.provider().as_str(),
                &self.base_url,
                &self.query_params(ctx),
                &[("X-API-Key", self.api_key.clone())],
            )
            .await?;
        take_records(self.provider(), body, "opportunitiesData", self.page_limit)
    }
}

#[async_trait]
impl ProviderClient for SamGovClient {
    fn provider(&self) -> Provider {
        Provider::SamGov
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &FetchContext) -> FetchOutcome {
        finish_fetch(self.provider(), self.try_fetch(http, ctx).await)
    }
}

#[derive(Debug, Clone)]
pub struct UsaSpendingClient {
    base_url: String,
    page_limit: usize,
}

impl UsaSpendingClient {
    pub fn new(base_url: impl Into<String>, page_limit: usize) -> Self {
        Self {
            base_url: base_url.into(),
            page_limit: page_limit.max(1),
        }
    }

    pub fn payload(&self, ctx: &FetchContext) -> JsonValue {
        let mut filters = json!({
            "time_period": [{
                "start_date": ctx.window.start.format("%Y-%m-%d").to_string(),
                "end_date": ctx.window.end.format("%Y-%m-%d").to_string(),
            }],
            "award_type_codes": CONTRACT_AWARD_TYPES,
        });
        if let Some(keyword) = ctx.filters.keyword() {
            filters["keywords"] = json!([keyword]);
        }
        if let Some(code) = ctx.filters.classification_code() {
            filters["naics_codes"] = json!([code]);
        }
        json!({
            "filters": filters,
            "fields": [
                "Award ID",
                "Recipient Name",
                "NAICS Code",
                "Action Date",
                "Awarding Agency Name"
            ],
            "limit": self.page_limit,
            "page": 1,
            "sort": "Action Date",
            "order": "desc",
        })
    }

    async fn try_fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<JsonValue>, ProviderError> {
        let body = http
            .post_json(ctx.run_id, self.provider().as_str(), &self.base_url, &self.payload(ctx))
            .await?;
        take_records(self.provider(), body, "results", self.page_limit)
    }
}

#[async_trait]
impl ProviderClient for UsaSpendingClient {
    fn provider(&self) -> Provider {
        Provider::UsaSpending
    }

    async fn fetch(&self, http: &HttpFetcher, ctx: &FetchContext) -> FetchOutcome {
        finish_fetch(self.provider(), self.try_fetch(http, ctx).await)
    }
}

fn take_records(
    provider: Provider,
    mut body: JsonValue,
    field: &'static str,
    limit: usize,
) -> Result<Vec<JsonValue>, ProviderError> {
    let mut records = match body.get_mut(field).map(JsonValue::take) {
        Some(JsonValue::Array(items)) => items,
        Some(JsonValue::Null) => Vec::new(),
        _ => return Err(ProviderError::MissingList { provider, field }),
    };
    if records.len() > limit {
        warn!(
            %provider,
            returned = records.len(),
            limit,
            "provider exceeded page limit; truncating"
        );
        records.truncate(limit);
    }
    Ok(records)
}

fn finish_fetch(provider: Provider, result: Result<Vec<JsonValue>, ProviderError>) -> FetchOutcome {
    match result {
        Ok(records) => {
            info!(%provider, count = records.len(), "fetched provider records");
            FetchOutcome {
                provider,
                records,
                error: None,
            }
        }
        Err(err) => {
            error!(
                %provider,
                error = %err,
                "provider fetch failed; continuing without its records"
            );
            FetchOutcome {
                provider,
                records: Vec::new(),
                error: Some(err),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("malformed {kind} record: {source}")]
    Malformed {
        kind: RecordKind,
        source: serde_json::Error,
    },
    #[error("{kind} record has no {field}")]
    MissingIdentifier {
        kind: RecordKind,
        field: &'static str,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOpportunity {
    #[serde(default, deserialize_with = "lenient_string")]
    notice_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    solicitation_number: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    department_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    posted_date: Option<String>,
    #[serde(default)]
    naics: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient_string")]
    naics_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAward {
    #[serde(default, alias = "Award ID", deserialize_with = "lenient_string")]
    award_id: Option<String>,
    #[serde(default, alias = "Recipient Name", deserialize_with = "lenient_string")]
    recipient_name: Option<String>,
    #[serde(
        default,
        alias = "Awarding Agency Name",
        alias = "Awarding Agency",
        deserialize_with = "lenient_string"
    )]
    awarding_agency_name: Option<String>,
    #[serde(default, alias = "Action Date", deserialize_with = "lenient_string")]
    action_date: Option<String>,
    #[serde(default, alias = "NAICS Code", deserialize_with = "lenient_string")]
    naics_code: Option<String>,
}

pub fn normalize(kind: RecordKind, raw: &JsonValue) -> Result<CanonicalRecord, NormalizeError> {
    match kind {
        RecordKind::Opportunity => normalize_opportunity(raw).map(CanonicalRecord::from),
        RecordKind::Award => normalize_award(raw).map(CanonicalRecord::from),
    }
}

pub fn normalize_opportunity(raw: &JsonValue) -> Result<Opportunity, NormalizeError> {
    let kind = RecordKind::Opportunity;
    ensure_object(kind, raw)?;
    let raw_opp = RawOpportunity::deserialize(raw)
        .map_err(|source| NormalizeError::Malformed { kind, source })?;

    let solicitation_number = clean(raw_opp.solicitation_number);
    if solicitation_number.is_empty() {
        return Err(NormalizeError::MissingIdentifier {
            kind,
            field: "solicitationNumber",
        });
    }

    let notice_id = clean(raw_opp.notice_id);
    let classification_code = raw_opp
        .naics
        .as_ref()
        .and_then(classification_from)
        .unwrap_or_else(|| clean(raw_opp.naics_code));

    Ok(Opportunity {
        provider: Provider::SamGov,
        posted_date: date_field(kind, &solicitation_number, raw_opp.posted_date.as_deref()),
        solicitation_number,
        title: clean(raw_opp.title),
        agency: clean(raw_opp.department_name),
        classification_code,
        link: detail_link(SAM_GOV_LINK_BASE, &["opp", notice_id.as_str(), "view"], &notice_id),
    })
}

pub fn normalize_award(raw: &JsonValue) -> Result<Award, NormalizeError> {
    let kind = RecordKind::Award;
    ensure_object(kind, raw)?;
    let raw_award =
        RawAward::deserialize(raw).map_err(|source| NormalizeError::Malformed { kind, source })?;

    let award_id = clean(raw_award.award_id);
    if award_id.is_empty() {
        return Err(NormalizeError::MissingIdentifier {
            kind,
            field: "award_id",
        });
    }

    Ok(Award {
        provider: Provider::UsaSpending,
        action_date: date_field(kind, &award_id, raw_award.action_date.as_deref()),
        link: detail_link(USASPENDING_LINK_BASE, &["award", award_id.as_str()], &award_id),
        award_id,
        recipient_name: clean(raw_award.recipient_name),
        agency: clean(raw_award.awarding_agency_name),
        classification_code: clean(raw_award.naics_code),
    })
}

fn ensure_object(kind: RecordKind, raw: &JsonValue) -> Result<(), NormalizeError> {
    if raw.is_object() {
        return Ok(());
    }
    Err(NormalizeError::Malformed {
        kind,
        source: serde_json::Error::custom("expected a JSON object"),
    })
}

/// Parse a provider date. Accepts `YYYY-MM-DD` (optionally followed by a time part)
/// and `MM/DD/YYYY`.
pub fn parse_provider_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    let head = trimmed.get(..10).unwrap_or(trimmed);
    NaiveDate::parse_from_str(head, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(head, "%m/%d/%Y"))
        .ok()
}

fn date_field(kind: RecordKind, identifier: &str, raw: Option<&str>) -> Option<NaiveDate> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty())?;
    let parsed = parse_provider_date(raw);
    if parsed.is_none() {
        warn!(%kind, identifier, raw_date = raw, "unparseable date; storing empty date");
    }
    parsed
}

/// Canonical detail URL with each path segment percent-escaped. Empty identifier → empty link.
fn detail_link(base: &str, segments: &[&str], identifier: &str) -> String {
    if identifier.is_empty() {
        return String::new();
    }
    let Ok(mut url) = Url::parse(base) else {
        return String::new();
    };
    match url.path_segments_mut() {
        Ok(mut path) => {
            path.pop_if_empty().extend(segments);
        }
        Err(()) => return String::new(),
    }
    url.into()
}

fn classification_from(value: &JsonValue) -> Option<String> {
    let code = match value {
        JsonValue::Object(map) => map.get("code").and_then(scalar_text),
        JsonValue::Array(items) => items.first().and_then(classification_from),
        other => scalar_text(other),
    }?;
    let code = code.trim().to_string();
    (!code.is_empty()).then_some(code)
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn clean(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(JsonValue::Number(n)) => Ok(Some(n.to_string())),
        Some(JsonValue::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!("expected a scalar, found {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gcf_storage::HttpClientConfig;
    use std::time::Duration;

    fn ctx(keyword: Option<&str>, code: Option<&str>) -> FetchContext {
        FetchContext {
            run_id: Uuid::new_v4(),
            window: DateWindow {
                start: NaiveDate::from_ymd_opt(2024, 12, 16).unwrap(),
                end: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            },
            filters: FetchFilters {
                keyword: keyword.map(str::to_string),
                classification_code: code.map(str::to_string),
            },
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("gcf-test".into()),
        })
        .unwrap()
    }

    #[test]
    fn normalizes_reference_opportunity() {
        let raw = json!({
            "solicitationNumber": "ABC-1",
            "title": "Widgets",
            "departmentName": "DoD",
            "postedDate": "2025-01-15",
            "naics": {"code": "336411"},
            "noticeId": "xyz"
        });
        let opp = normalize_opportunity(&raw).unwrap();
        assert_eq!(opp.provider, Provider::SamGov);
        assert_eq!(opp.solicitation_number, "ABC-1");
        assert_eq!(opp.title, "Widgets");
        assert_eq!(opp.agency, "DoD");
        assert_eq!(opp.posted_date, NaiveDate::from_ymd_opt(2025, 1, 15));
        assert_eq!(opp.classification_code, "336411");
        assert_eq!(opp.link, "https://sam.gov/opp/xyz/view");
    }

    #[test]
    fn unparseable_date_becomes_empty_not_an_error() {
        let raw = json!({
            "solicitationNumber": "ABC-2",
            "postedDate": "31/31/2025",
            "noticeId": "n"
        });
        let opp = normalize_opportunity(&raw).unwrap();
        assert_eq!(opp.posted_date, None);
        assert_eq!(opp.title, "");
        assert_eq!(opp.classification_code, "");
    }

    #[test]
    fn provider_dates_accept_both_formats_and_time_suffixes() {
        let expected = NaiveDate::from_ymd_opt(2025, 1, 9);
        assert_eq!(parse_provider_date("2025-01-09"), expected);
        assert_eq!(parse_provider_date("2025-01-09 10:22:31-05"), expected);
        assert_eq!(parse_provider_date("01/09/2025"), expected);
        assert_eq!(parse_provider_date("Jan 9"), None);
        assert_eq!(parse_provider_date(""), None);
    }

    #[test]
    fn link_segments_are_escaped() {
        let raw = json!({"solicitationNumber": "S-1", "noticeId": "a b/c?d"});
        let opp = normalize_opportunity(&raw).unwrap();
        assert_eq!(opp.link, "https://sam.gov/opp/a%20b%2Fc%3Fd/view");
    }

    #[test]
    fn empty_notice_id_yields_empty_link() {
        let raw = json!({"solicitationNumber": "S-1", "noticeId": ""});
        assert_eq!(normalize_opportunity(&raw).unwrap().link, "");
    }

    #[test]
    fn records_without_identifier_are_rejected() {
        let err = normalize(RecordKind::Opportunity, &json!({"title": "orphan"})).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MissingIdentifier {
                field: "solicitationNumber",
                ..
            }
        ));

        let err = normalize(RecordKind::Award, &json!({"award_id": "   "})).unwrap_err();
        assert!(matches!(err, NormalizeError::MissingIdentifier { .. }));
    }

    #[test]
    fn non_object_records_are_malformed() {
        let err = normalize(RecordKind::Award, &json!(["not", "a", "record"])).unwrap_err();
        assert!(matches!(err, NormalizeError::Malformed { .. }));
        let err = normalize(RecordKind::Opportunity, &json!({"solicitationNumber": {"nested": 1}}))
            .unwrap_err();
        assert!(matches!(err, NormalizeError::Malformed { .. }));
    }

    #[test]
    fn award_accepts_display_name_fields() {
        let raw = json!({
            "Award ID": "W58 RGZ",
            "Recipient Name": "Acme",
            "Awarding Agency Name": "Department of Defense",
            "Action Date": "2025-01-12",
            "NAICS Code": 336411
        });
        let award = normalize_award(&raw).unwrap();
        assert_eq!(award.award_id, "W58 RGZ");
        assert_eq!(award.recipient_name, "Acme");
        assert_eq!(award.agency, "Department of Defense");
        assert_eq!(award.classification_code, "336411");
        assert_eq!(award.action_date, NaiveDate::from_ymd_opt(2025, 1, 12));
        assert_eq!(award.link, "https://www.usaspending.gov/award/W58%20RGZ");
    }

    #[test]
    fn opportunity_classification_falls_back_to_flat_code() {
        let raw = json!({"solicitationNumber": "S-9", "naicsCode": "541330"});
        assert_eq!(normalize_opportunity(&raw).unwrap().classification_code, "541330");
        let raw = json!({"solicitationNumber": "S-9", "naics": [{"code": 611430}]});
        assert_eq!(normalize_opportunity(&raw).unwrap().classification_code, "611430");
    }

    #[test]
    fn sam_query_params_follow_provider_conventions() {
        let client = SamGovClient::new(SAM_GOV_DEFAULT_URL, "key", 50);
        let params = client.query_params(&ctx(Some("aircraft"), Some("336411")));
        assert!(params.contains(&("postedFrom", "12/16/2024".to_string())));
        assert!(params.contains(&("postedTo", "01/15/2025".to_string())));
        assert!(params.contains(&("ptype", "o".to_string())));
        assert!(params.contains(&("limit", "50".to_string())));
        assert!(params.contains(&("keyword", "aircraft".to_string())));
        assert!(params.contains(&("naics", "336411".to_string())));

        let bare = client.query_params(&ctx(None, Some("  ")));
        assert!(bare.iter().all(|(k, _)| *k != "keyword" && *k != "naics"));
    }

    #[test]
    fn usaspending_payload_uses_iso_dates_and_optional_filters() {
        let client = UsaSpendingClient::new(USASPENDING_DEFAULT_URL, 25);
        let payload = client.payload(&ctx(Some("rotor"), Some("336411")));
        assert_eq!(payload["filters"]["time_period"][0]["start_date"], "2024-12-16");
        assert_eq!(payload["filters"]["time_period"][0]["end_date"], "2025-01-15");
        assert_eq!(payload["filters"]["keywords"], json!(["rotor"]));
        assert_eq!(payload["filters"]["naics_codes"], json!(["336411"]));
        assert_eq!(payload["limit"], 25);
        assert_eq!(payload["page"], 1);

        let bare = client.payload(&ctx(None, None));
        assert!(bare["filters"].get("keywords").is_none());
        assert!(bare["filters"].get("naics_codes").is_none());
    }

    #[tokio::test]
    async fn sam_client_sends_key_and_truncates_to_page_limit() {
        let server = wiremock::MockServer::start().await;
        let items: Vec<_> = (0..5)
            .map(|i| json!({"solicitationNumber": format!("S-{i}")}))
            .collect();
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::header("X-API-Key", "secret"))
            .and(wiremock::matchers::query_param("ptype", "o"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(json!({"opportunitiesData": items})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = SamGovClient::new(server.uri(), "secret", 3);
        let outcome = client.fetch(&fetcher(), &ctx(None, None)).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.records[0]["solicitationNumber"], "S-0");
    }

    #[tokio::test]
    async fn provider_failure_yields_empty_outcome_with_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = UsaSpendingClient::new(server.uri(), 50);
        let outcome = client.fetch(&fetcher(), &ctx(None, None)).await;
        assert_eq!(outcome.provider, Provider::UsaSpending);
        assert!(outcome.records.is_empty());
        assert!(matches!(
            outcome.error,
            Some(ProviderError::Fetch(FetchError::HttpStatus { status: 500, .. }))
        ));
    }

    #[tokio::test]
    async fn missing_result_list_is_reported() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(
                wiremock::ResponseTemplate::new(200)
                    .set_body_json(json!({"messages": ["bad filter"]})),
            )
            .mount(&server)
            .await;

        let client = UsaSpendingClient::new(server.uri(), 50);
        let outcome = client.fetch(&fetcher(), &ctx(None, None)).await;
        assert!(outcome.records.is_empty());
        assert!(matches!(
            outcome.error,
            Some(ProviderError::MissingList { field: "results", .. })
        ));
    }

    #[tokio::test]
    async fn usaspending_client_posts_filter_payload() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::body_partial_json(json!({
                "filters": {"naics_codes": ["336411"]},
                "page": 1
            })))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"award_id": "A-1", "recipient_name": "Acme"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = UsaSpendingClient::new(server.uri(), 50);
        let outcome = client.fetch(&fetcher(), &ctx(None, Some("336411"))).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.records.len(), 1);
    }
}
