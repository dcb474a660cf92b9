use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;
use thiserror::Error;
use txcache_core::{RawRecord, RecipientBlob, TransactionRecord, TransactionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("record is not a json object: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a well-formed number: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{field}` is not a valid timestamp: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("invalid currency code `{0}`")]
    InvalidCurrency(String),
    #[error("`{minor_field}`={minor} disagrees with `{decimal_field}`={decimal} at scale {scale}")]
    AmountMismatch {
        minor_field: &'static str,
        decimal_field: &'static str,
        minor: i64,
        decimal: Decimal,
        scale: u32,
    },
}

#[derive(Debug, Deserialize)]
struct WireTransaction<'a> {
    id: Option<Value>,
    amount: Option<Value>,
    human_readable_amount: Option<Value>,
    charge: Option<Value>,
    human_readable_charge: Option<Value>,
    status: Option<Value>,
    currency: Option<Value>,
    created_at: Option<Value>,
    #[serde(borrow)]
    recipient: Option<&'a RawValue>,
    decline_reason: Option<Value>,
    mode: Option<Value>,
    #[serde(rename = "type")]
    kind: Option<Value>,
    description: Option<Value>,
    external_id: Option<Value>,
    from_wallet: Option<Value>,
    to_wallet: Option<Value>,
    debit_id: Option<Value>,
    credit_id: Option<Value>,
    rate: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: Option<Value>,
}

/// Minor units per major unit for ISO 4217 currencies that deviate from two decimals.
pub fn currency_minor_units(code: &str) -> u32 {
    match code {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "UYI" | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => 2,
    }
}

/// Map one raw feed record onto the cache row shape. Extra fields are ignored.
pub fn normalize(raw: &RawRecord) -> Result<TransactionRecord, NormalizationError> {
    let wire: WireTransaction<'_> =
        serde_json::from_str(raw.as_str()).map_err(|err| NormalizationError::Malformed(err.to_string()))?;

    let id = text(wire.id)
        .filter(|id| !id.is_empty())
        .ok_or(NormalizationError::MissingField("id"))?;
    let currency = parse_currency(required(wire.currency, "currency")?)?;
    let scale = currency_minor_units(&currency);

    let amount = parse_minor("amount", required(wire.amount, "amount")?)?;
    let human_amount = parse_decimal(
        "human_readable_amount",
        required(wire.human_readable_amount, "human_readable_amount")?,
    )?;
    check_consistent("amount", amount, "human_readable_amount", human_amount, scale)?;

    let charge = parse_minor("charge", required(wire.charge, "charge")?)?;
    let human_charge = parse_decimal(
        "human_readable_charge",
        required(wire.human_readable_charge, "human_readable_charge")?,
    )?;
    check_consistent("charge", charge, "human_readable_charge", human_charge, scale)?;

    let status = text(wire.status)
        .filter(|status| !status.is_empty())
        .map(|status| TransactionStatus::parse(&status))
        .ok_or(NormalizationError::MissingField("status"))?;
    let created_at = parse_timestamp("created_at", required(wire.created_at, "created_at")?)?;

    let rate = match wire.rate {
        Some(Value::Null) | None => None,
        Some(value) => Some(parse_decimal("rate", value)?),
    };

    Ok(TransactionRecord {
        id,
        amount,
        human_amount,
        charge,
        human_charge,
        status,
        currency,
        created_at,
        recipient: wire.recipient.map(RecipientBlob::from_raw),
        decline_reason: text(wire.decline_reason),
        mode: text(wire.mode),
        kind: text(wire.kind),
        description: text(wire.description),
        external_id: text(wire.external_id),
        from_wallet: text(wire.from_wallet),
        to_wallet: text(wire.to_wallet),
        debit_id: text(wire.debit_id),
        credit_id: text(wire.credit_id),
        rate,
    })
}

/// Best-effort id of a record that may otherwise be malformed, for logging.
pub fn peek_id(raw: &RawRecord) -> Option<String> {
    serde_json::from_str::<IdOnly>(raw.as_str())
        .ok()
        .and_then(|probe| text(probe.id))
}

fn required(value: Option<Value>, field: &'static str) -> Result<Value, NormalizationError> {
    match value {
        None | Some(Value::Null) => Err(NormalizationError::MissingField(field)),
        Some(value) => Ok(value),
    }
}

fn text(value: Option<Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

fn parse_decimal(field: &'static str, value: Value) -> Result<Decimal, NormalizationError> {
    let raw = match &value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(NormalizationError::InvalidNumber {
                field,
                value: other.to_string(),
            })
        }
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .map_err(|_| NormalizationError::InvalidNumber { field, value: raw })
}

fn parse_minor(field: &'static str, value: Value) -> Result<i64, NormalizationError> {
    let decimal = parse_decimal(field, value)?;
    if !decimal.fract().is_zero() {
        return Err(NormalizationError::InvalidNumber {
            field,
            value: decimal.to_string(),
        });
    }
    decimal.to_i64().ok_or(NormalizationError::InvalidNumber {
        field,
        value: decimal.to_string(),
    })
}

fn parse_currency(value: Value) -> Result<String, NormalizationError> {
    let code = text(Some(value)).unwrap_or_default().to_ascii_uppercase();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code)
    } else {
        Err(NormalizationError::InvalidCurrency(code))
    }
}

fn parse_timestamp(field: &'static str, value: Value) -> Result<DateTime<Utc>, NormalizationError> {
    let raw = text(Some(value)).unwrap_or_default();
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|_| NormalizationError::InvalidTimestamp { field, value: raw })
}

fn check_consistent(
    minor_field: &'static str,
    minor: i64,
    decimal_field: &'static str,
    decimal: Decimal,
    scale: u32,
) -> Result<(), NormalizationError> {
    let factor = Decimal::from(10i64.pow(scale));
    match decimal.checked_mul(factor) {
        Some(scaled) if scaled == Decimal::from(minor) => Ok(()),
        _ => Err(NormalizationError::AmountMismatch {
            minor_field,
            decimal_field,
            minor,
            decimal,
            scale,
        }),
    }
}
