//! Core domain model for the transaction cache: normalized records, cache rows and sync run summaries.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "txcache-core";

/// Lifecycle state reported by the remote feed. The cache records the latest
/// observed value and never computes transitions itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Declined,
    Reversed,
    Processing,
    /// Any status outside the known set, kept verbatim.
    Other(String),
}

impl TransactionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Declined => "declined",
            Self::Reversed => "reversed",
            Self::Processing => "processing",
            Self::Other(raw) => raw.as_str(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "declined" => Self::Declined,
            "reversed" => Self::Reversed,
            "processing" => Self::Processing,
            _ => Self::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for TransactionStatus {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<TransactionStatus> for String {
    fn from(value: TransactionStatus) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payee metadata carried through the cache without interpretation.
///
/// The exact JSON text received from the feed is retained, so a row read back
/// from the store yields the same bytes that were fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientBlob(String);

impl RecipientBlob {
    pub fn from_raw(raw: &RawValue) -> Self {
        Self(raw.get().to_owned())
    }

    /// Wrap JSON text loaded from storage, rejecting anything that is not valid JSON.
    pub fn from_json_text(text: String) -> Result<Self, serde_json::Error> {
        let raw = RawValue::from_string(text)?;
        Ok(Self(raw.get().to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for RecipientBlob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw = RawValue::from_string(self.0.clone()).map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RecipientBlob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Self::from_raw(&raw))
    }
}

/// Canonical shape of one remote transaction after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    pub amount: i64,
    pub human_amount: Decimal,
    pub charge: i64,
    pub human_charge: Decimal,
    pub status: TransactionStatus,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub recipient: Option<RecipientBlob>,
    pub decline_reason: Option<String>,
    pub mode: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub from_wallet: Option<String>,
    pub to_wallet: Option<String>,
    pub debit_id: Option<String>,
    pub credit_id: Option<String>,
    pub rate: Option<Decimal>,
}

/// Materialized cache row: the last observed record plus local bookkeeping.
///
/// Serialize-only: rows are read back through the store, never decoded from
/// their flattened JSON form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheRecord {
    #[serde(flatten)]
    pub record: TransactionRecord,
    pub cached_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One undecoded record exactly as it appeared in a feed page.
#[derive(Debug, Clone)]
pub struct RawRecord(Box<RawValue>);

impl RawRecord {
    pub fn new(raw: Box<RawValue>) -> Self {
        Self(raw)
    }

    pub fn from_json(text: impl Into<String>) -> Result<Self, serde_json::Error> {
        RawValue::from_string(text.into()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        self.0.get()
    }

    pub fn as_raw(&self) -> &RawValue {
        &self.0
    }
}

/// One page of raw records plus whether the source reports further pages.
#[derive(Debug, Clone)]
pub struct RawRecordBatch {
    pub page: u32,
    pub last_page: Option<u32>,
    pub has_more: bool,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Full,
    Day,
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("full"),
            Self::Day => f.write_str("day"),
        }
    }
}

/// What a sync run asks the source for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "date", rename_all = "snake_case")]
pub enum SyncScope {
    Full,
    /// A single calendar day in the source's clock.
    Day(NaiveDate),
}

impl SyncScope {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::Full => SyncKind::Full,
            Self::Day(_) => SyncKind::Day,
        }
    }

    pub fn day(&self) -> Option<NaiveDate> {
        match self {
            Self::Full => None,
            Self::Day(day) => Some(*day),
        }
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => f.write_str("all"),
            Self::Day(day) => write!(f, "{day}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCounts {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

/// Fatal error classes that end a run early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Authentication,
    SourceUnavailable,
    Timeout,
    Protocol,
    StoreWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one sync run. Returned for failed runs as well, carrying
/// whatever was committed before the failure.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub kind: SyncKind,
    pub scope: Option<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub pages_fetched: u32,
    pub last_committed_page: Option<u32>,
    pub total_count: usize,
    pub inserted_count: usize,
    pub updated_count: usize,
    pub error_count: usize,
    pub status: RunStatus,
    pub error: Option<RunFailure>,
}

impl SyncRunSummary {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_is_kept_verbatim() {
        assert_eq!(TransactionStatus::parse("SUCCESS"), TransactionStatus::Success);
        let other = TransactionStatus::parse("on_hold");
        assert_eq!(other, TransactionStatus::Other("on_hold".into()));
        assert_eq!(other.as_str(), "on_hold");
    }

    #[test]
    fn recipient_blob_serializes_original_bytes() {
        let text = r#"{"b":1,  "a":[1.50,"x"]}"#;
        let raw = RawValue::from_string(text.to_string()).unwrap();
        let blob = RecipientBlob::from_raw(&raw);
        assert_eq!(blob.as_str(), text);

        let json = serde_json::to_string(&blob).unwrap();
        assert_eq!(json, text);
    }

    fn sample_record() -> TransactionRecord {
        let recipient = RawValue::from_string(r#"{"bank":"Test Bank",  "n":1.10}"#.to_string()).unwrap();
        TransactionRecord {
            id: "t-1".into(),
            amount: 1050,
            human_amount: Decimal::new(1050, 2),
            charge: 25,
            human_charge: Decimal::new(25, 2),
            status: TransactionStatus::Success,
            currency: "USD".into(),
            created_at: DateTime::parse_from_rfc3339("2026-01-25T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            recipient: Some(RecipientBlob::from_raw(&recipient)),
            decline_reason: None,
            mode: Some("live".into()),
            kind: Some("debit".into()),
            description: None,
            external_id: None,
            from_wallet: None,
            to_wallet: None,
            debit_id: None,
            credit_id: None,
            rate: None,
        }
    }

    #[test]
    fn transaction_record_json_roundtrip_keeps_recipient_bytes() {
        let record = sample_record();
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""type":"debit""#));

        let decoded: TransactionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.recipient.as_ref().map(RecipientBlob::as_str),
            Some(r#"{"bank":"Test Bank",  "n":1.10}"#)
        );
    }

    #[test]
    fn cache_record_serializes_as_one_flat_object() {
        let row = CacheRecord {
            record: sample_record(),
            cached_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let value: serde_json::Value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["id"], "t-1");
        assert_eq!(value["recipient"]["bank"], "Test Bank");
        assert!(value.get("record").is_none());
        assert!(value.get("cached_at").is_some());
    }

    #[test]
    fn recipient_blob_rejects_invalid_json_text() {
        assert!(RecipientBlob::from_json_text("{not json".into()).is_err());
    }

    #[test]
    fn scope_reports_kind_and_day() {
        let day = NaiveDate::from_ymd_opt(2026, 1, 25).unwrap();
        assert_eq!(SyncScope::Full.kind(), SyncKind::Full);
        assert_eq!(SyncScope::Day(day).day(), Some(day));
        assert_eq!(SyncScope::Day(day).to_string(), "2026-01-25");
    }
}
