//! Upstream payload normalization
//!
//! Splits a raw payload into entries and validates each entry on its own. A
//! bad entry becomes a [`RejectedRecord`]; it never aborts the batch. Only a
//! payload that cannot be split into entries at all is an error.
//!
//! Accepted shapes:
//! - JSON array of objects
//! - JSON object holding the array under `records`, `data` or `items`
//! - CSV with a header row
//!
//! Field names are folded (lowercased, non-alphanumerics dropped) before
//! lookup, so `financialYear`, `financial_year` and `Financial Year` match.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::error::{PayloadError, ValidationError};
use crate::models::{CanonicalRecord, IdentityKey, Measures, RawPayload, RejectedRecord};

/// Largest count that fits the signed 64-bit storage columns
const MAX_COUNT: u64 = i64::MAX as u64;

/// JSON object keys that may carry the entry array
const ENVELOPE_KEYS: [&str; 3] = ["records", "data", "items"];

struct FieldSpec {
    name: &'static str,
    /// Folded spellings, canonical first
    aliases: &'static [&'static str],
}

const STATE: FieldSpec = FieldSpec {
    name: "state",
    aliases: &["state", "statename"],
};
const DISTRICT: FieldSpec = FieldSpec {
    name: "district",
    aliases: &["district", "districtname"],
};
const BLOCK: FieldSpec = FieldSpec {
    name: "block",
    aliases: &["block", "blockname"],
};
const PANCHAYAT: FieldSpec = FieldSpec {
    name: "panchayat",
    aliases: &["panchayat", "panchayatname", "grampanchayat", "gpname"],
};
const FINANCIAL_YEAR: FieldSpec = FieldSpec {
    name: "financialYear",
    aliases: &["financialyear", "finyear", "fy"],
};

const TOTAL_WORKS: FieldSpec = FieldSpec {
    name: "totalWorks",
    aliases: &["totalworks", "totalnoofworkstakenup"],
};
const COMPLETED_WORKS: FieldSpec = FieldSpec {
    name: "completedWorks",
    aliases: &["completedworks", "numberofcompletedworks"],
};
const ONGOING_WORKS: FieldSpec = FieldSpec {
    name: "ongoingWorks",
    aliases: &["ongoingworks", "numberofongoingworks"],
};
const TOTAL_JOB_CARDS: FieldSpec = FieldSpec {
    name: "totalJobCards",
    aliases: &["totaljobcards", "totalnoofjobcardsissued"],
};
const ACTIVE_WORKERS: FieldSpec = FieldSpec {
    name: "activeWorkers",
    aliases: &["activeworkers", "totalnoofactiveworkers"],
};
const TOTAL_PERSON_DAYS: FieldSpec = FieldSpec {
    name: "totalPersonDays",
    aliases: &["totalpersondays", "persondaysofcentralliabilitysofar"],
};
const TOTAL_EXPENDITURE: FieldSpec = FieldSpec {
    name: "totalExpenditure",
    aliases: &["totalexpenditure", "totalexp"],
};
const WAGE_EXPENDITURE: FieldSpec = FieldSpec {
    name: "wageExpenditure",
    aliases: &["wageexpenditure", "wages"],
};
const MATERIAL_EXPENDITURE: FieldSpec = FieldSpec {
    name: "materialExpenditure",
    aliases: &["materialexpenditure", "materialandskilledwages"],
};

/// Output of one normalization pass, both halves in payload order
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<CanonicalRecord>,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizedBatch {
    /// Number of entries seen in the payload
    pub fn total(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

/// Verdict for a single entry
#[derive(Debug)]
pub enum EntryOutcome {
    Valid(CanonicalRecord),
    Rejected(RejectedRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadFormat {
    Json,
    Csv,
}

/// One logical upstream entry before validation
enum Entry {
    Fields { fields: Map<String, Value>, raw: String },
    Malformed { raw: String, detail: String },
}

/// Converts raw payloads into canonical records
#[derive(Debug, Clone)]
pub struct Normalizer {
    data_source: String,
}

impl Normalizer {
    pub fn new(data_source: impl Into<String>) -> Self {
        Self {
            data_source: data_source.into(),
        }
    }

    /// Validate every entry of `payload`
    ///
    /// `run_started` becomes each record's `last_updated`.
    pub fn normalize(
        &self,
        payload: &RawPayload,
        run_started: DateTime<Utc>,
    ) -> Result<NormalizedBatch, PayloadError> {
        let entries = split_entries(payload)?;
        let mut batch = NormalizedBatch::default();

        for (index, entry) in entries.into_iter().enumerate() {
            match self.validate_entry(index, entry, run_started) {
                EntryOutcome::Valid(record) => batch.records.push(record),
                EntryOutcome::Rejected(rejected) => {
                    debug!(index, reason = %rejected.reason, "Upstream entry rejected");
                    batch.rejected.push(rejected);
                },
            }
        }

        Ok(batch)
    }

    fn validate_entry(&self, index: usize, entry: Entry, run_started: DateTime<Utc>) -> EntryOutcome {
        let (fields, raw) = match entry {
            Entry::Fields { fields, raw } => (fields, raw),
            Entry::Malformed { raw, detail } => {
                return EntryOutcome::Rejected(RejectedRecord {
                    index,
                    raw_fragment: raw,
                    reason: ValidationError::MalformedEntry(detail),
                });
            },
        };

        match self.to_record(&FieldMap::new(&fields), run_started) {
            Ok(record) => EntryOutcome::Valid(record),
            Err(reason) => EntryOutcome::Rejected(RejectedRecord {
                index,
                raw_fragment: raw,
                reason,
            }),
        }
    }

    fn to_record(
        &self,
        fields: &FieldMap<'_>,
        run_started: DateTime<Utc>,
    ) -> Result<CanonicalRecord, ValidationError> {
        let key = IdentityKey {
            state: required_text(fields, &STATE)?,
            district: required_text(fields, &DISTRICT)?,
            block: optional_text(fields, &BLOCK)?,
            panchayat: optional_text(fields, &PANCHAYAT)?,
            financial_year: required_text(fields, &FINANCIAL_YEAR)?,
        };

        let measures = Measures {
            total_works: count(fields, &TOTAL_WORKS)?,
            completed_works: count(fields, &COMPLETED_WORKS)?,
            ongoing_works: count(fields, &ONGOING_WORKS)?,
            total_job_cards: count(fields, &TOTAL_JOB_CARDS)?,
            active_workers: count(fields, &ACTIVE_WORKERS)?,
            total_person_days: count(fields, &TOTAL_PERSON_DAYS)?,
            total_expenditure: amount(fields, &TOTAL_EXPENDITURE)?,
            wage_expenditure: amount(fields, &WAGE_EXPENDITURE)?,
            material_expenditure: amount(fields, &MATERIAL_EXPENDITURE)?,
        };

        Ok(CanonicalRecord {
            key,
            measures,
            data_source: self.data_source.clone(),
            last_updated: run_started,
        })
    }
}

/// Entry fields indexed by folded name
struct FieldMap<'a> {
    by_name: HashMap<String, &'a Value>,
}

impl<'a> FieldMap<'a> {
    fn new(fields: &'a Map<String, Value>) -> Self {
        let mut by_name = HashMap::with_capacity(fields.len());
        for (name, value) in fields {
            by_name.entry(fold(name)).or_insert(value);
        }
        Self { by_name }
    }

    /// First alias present with a non-null value
    fn get(&self, spec: &FieldSpec) -> Option<&'a Value> {
        spec.aliases
            .iter()
            .filter_map(|alias| self.by_name.get(*alias).copied())
            .find(|value| !value.is_null())
    }
}

fn fold(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn text(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<String, ValidationError> {
    match fields.get(spec) {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(_) => Err(ValidationError::invalid(spec.name, "expected text")),
    }
}

fn required_text(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<String, ValidationError> {
    let value = text(fields, spec)?;
    if value.is_empty() {
        return Err(ValidationError::MissingField(spec.name));
    }
    Ok(value)
}

fn optional_text(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<String, ValidationError> {
    text(fields, spec)
}

/// Numeric value as f64, `None` when absent or blank
fn number(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<Option<f64>, ValidationError> {
    match fields.get(spec) {
        None => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| ValidationError::invalid(spec.name, "number out of range")),
        Some(Value::String(s)) => {
            let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
            if cleaned.is_empty() {
                return Ok(None);
            }
            cleaned
                .parse::<f64>()
                .map(Some)
                .map_err(|_| ValidationError::invalid(spec.name, format!("not a number: '{}'", s.trim())))
        },
        Some(_) => Err(ValidationError::invalid(spec.name, "expected a number")),
    }
}

fn count(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<u64, ValidationError> {
    // Integers are taken exactly; going through f64 would lose precision
    // above 2^53.
    if let Some(Value::Number(n)) = fields.get(spec) {
        if let Some(value) = n.as_u64() {
            return if value > MAX_COUNT {
                Err(ValidationError::invalid(spec.name, "count out of range"))
            } else {
                Ok(value)
            };
        }
    }
    if let Some(Value::String(s)) = fields.get(spec) {
        let cleaned: String = s.trim().chars().filter(|c| *c != ',').collect();
        if let Ok(value) = cleaned.parse::<u64>() {
            return if value > MAX_COUNT {
                Err(ValidationError::invalid(spec.name, "count out of range"))
            } else {
                Ok(value)
            };
        }
    }

    let Some(value) = number(fields, spec)? else {
        return Ok(0);
    };
    if !value.is_finite() {
        return Err(ValidationError::invalid(spec.name, "not a finite number"));
    }
    if value < 0.0 {
        return Err(ValidationError::invalid(spec.name, "must not be negative"));
    }
    if value.fract() != 0.0 {
        return Err(ValidationError::invalid(spec.name, "must be a whole number"));
    }
    if value >= MAX_COUNT as f64 {
        return Err(ValidationError::invalid(spec.name, "count out of range"));
    }
    Ok(value as u64)
}

fn amount(fields: &FieldMap<'_>, spec: &FieldSpec) -> Result<f64, ValidationError> {
    let Some(value) = number(fields, spec)? else {
        return Ok(0.0);
    };
    if !value.is_finite() {
        return Err(ValidationError::invalid(spec.name, "not a finite number"));
    }
    if value < 0.0 {
        return Err(ValidationError::invalid(spec.name, "must not be negative"));
    }
    // normalize -0.0
    Ok(value.abs())
}

fn split_entries(payload: &RawPayload) -> Result<Vec<Entry>, PayloadError> {
    let text = std::str::from_utf8(&payload.body)
        .map_err(|e| PayloadError::Malformed(format!("payload is not valid UTF-8: {}", e)))?;
    let text = text.trim_start_matches('\u{feff}').trim();

    if text.is_empty() {
        return Err(PayloadError::Malformed("empty payload".to_string()));
    }

    match detect_format(payload.content_type.as_deref(), text)? {
        PayloadFormat::Json => json_entries(text),
        PayloadFormat::Csv => csv_entries(text),
    }
}

fn detect_format(content_type: Option<&str>, text: &str) -> Result<PayloadFormat, PayloadError> {
    let first = text.chars().next().unwrap_or_default();

    // Error pages are frequently served with a 200 and an HTML body.
    if first == '<' {
        return Err(PayloadError::UnsupportedFormat(
            "markup document (HTML/XML)".to_string(),
        ));
    }

    let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
    if content_type.contains("json") || first == '[' || first == '{' {
        Ok(PayloadFormat::Json)
    } else {
        Ok(PayloadFormat::Csv)
    }
}

fn json_entries(text: &str) -> Result<Vec<Entry>, PayloadError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PayloadError::Malformed(format!("invalid JSON: {}", e)))?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut envelope) => ENVELOPE_KEYS
            .iter()
            .find_map(|key| match envelope.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| {
                PayloadError::Malformed(format!(
                    "JSON object has no entry array under {:?}",
                    ENVELOPE_KEYS
                ))
            })?,
        other => {
            return Err(PayloadError::Malformed(format!(
                "expected a JSON array or object, found {}",
                json_kind(&other)
            )));
        },
    };

    Ok(items
        .into_iter()
        .map(|item| {
            let raw = item.to_string();
            match item {
                Value::Object(fields) => Entry::Fields { fields, raw },
                other => Entry::Malformed {
                    detail: format!("expected an object, found {}", json_kind(&other)),
                    raw,
                },
            }
        })
        .collect())
}

fn csv_entries(text: &str) -> Result<Vec<Entry>, PayloadError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PayloadError::Malformed(format!("invalid CSV header: {}", e)))?
        .clone();

    let mut entries = Vec::new();
    for row in reader.records() {
        let entry = match row {
            Ok(row) => {
                let raw = row.iter().collect::<Vec<_>>().join(",");
                if row.len() != headers.len() {
                    Entry::Malformed {
                        detail: format!("expected {} columns, found {}", headers.len(), row.len()),
                        raw,
                    }
                } else {
                    let fields = headers
                        .iter()
                        .zip(row.iter())
                        .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                        .collect();
                    Entry::Fields { fields, raw }
                }
            },
            Err(e) => Entry::Malformed {
                raw: String::new(),
                detail: format!("unreadable CSV row: {}", e),
            },
        };
        entries.push(entry);
    }

    Ok(entries)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
