//! Turns raw queue/HTTP payloads into validated [`JobDescriptor`]s.
//!
//! Fields are read one by one from the JSON object, so a wrongly typed field is
//! reported alongside the identifiers that were present instead of failing the
//! whole payload.

use chrono::{DateTime, NaiveDateTime, Utc};
use garde::Validate;
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::models::job::{JobDescriptor, JobStatus, Priority, ProcessingOptions};

/// A job that passed validation, with any non-fatal normalizations applied.
#[derive(Debug, Clone)]
pub struct DecodedJob {
    pub job: JobDescriptor,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed job payload: {0}")]
    Malformed(String),

    #[error("invalid job: {}", .problems.join("; "))]
    Invalid {
        job_id: Option<String>,
        image_id: Option<String>,
        url: Option<String>,
        problems: Vec<String>,
    },
}

impl ValidationError {
    /// The job_id of the rejected payload, when it carried one.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::Invalid { job_id, .. } => job_id.as_deref(),
        }
    }

    pub fn image_id(&self) -> Option<&str> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::Invalid { image_id, .. } => image_id.as_deref(),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::Invalid { url, .. } => url.as_deref(),
        }
    }
}

/// Decode a JSON job payload as delivered by the queue.
pub fn decode_job(payload: &[u8]) -> Result<DecodedJob, ValidationError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    decode_job_value(value)
}

/// Decode a job that has already been parsed as JSON (HTTP path).
pub fn decode_job_value(value: Value) -> Result<DecodedJob, ValidationError> {
    match value {
        Value::Object(map) => validate_message(&map),
        other => Err(ValidationError::Malformed(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

/// Reads typed fields out of one JSON object, collecting type problems.
struct Fields<'a> {
    map: &'a Map<String, Value>,
    prefix: &'static str,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>, prefix: &'static str) -> Self {
        Self { map, prefix }
    }

    /// Present and not null.
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn label(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    fn mistyped(&self, key: &str, expected: &str, got: &Value, problems: &mut Vec<String>) {
        problems.push(format!(
            "{}: expected {expected}, got {}",
            self.label(key),
            type_name(got)
        ));
    }

    fn required_text(&self, key: &str, problems: &mut Vec<String>) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.clone()),
            None | Some(Value::String(_)) => {
                problems.push(format!("missing required field: {}", self.label(key)));
                None
            }
            Some(other) => {
                self.mistyped(key, "a string", other, problems);
                None
            }
        }
    }

    fn text(&self, key: &str, problems: &mut Vec<String>) -> Option<String> {
        match self.get(key) {
            None => None,
            Some(Value::String(s)) => non_blank(Some(s.clone())),
            Some(other) => {
                self.mistyped(key, "a string", other, problems);
                None
            }
        }
    }

    /// Raw token of an enum-like field; non-strings are rendered so they can be
    /// normalized like any other unknown token.
    fn token(&self, key: &str) -> Option<String> {
        match self.get(key) {
            None => None,
            Some(Value::String(s)) => non_blank(Some(s.clone())),
            Some(other) => Some(other.to_string()),
        }
    }

    fn count(&self, key: &str, problems: &mut Vec<String>) -> Option<u32> {
        let value = self.get(key)?;
        match value.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) => Some(n),
            None => {
                self.mistyped(key, "a non-negative integer", value, problems);
                None
            }
        }
    }

    fn flag(&self, key: &str, problems: &mut Vec<String>) -> Option<bool> {
        match self.get(key) {
            None => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(other) => {
                self.mistyped(key, "a boolean", other, problems);
                None
            }
        }
    }

    fn tokens(&self, key: &str, problems: &mut Vec<String>) -> Option<Vec<String>> {
        match self.get(key) {
            None => None,
            Some(Value::Array(items)) => {
                let mut tokens = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        Value::String(s) => tokens.push(s.clone()),
                        other => {
                            self.mistyped(key, "a list of strings", other, problems);
                            return None;
                        }
                    }
                }
                Some(tokens)
            }
            Some(other) => {
                self.mistyped(key, "a list of strings", other, problems);
                None
            }
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn validate_message(map: &Map<String, Value>) -> Result<DecodedJob, ValidationError> {
    let mut problems = Vec::new();
    let mut warnings = Vec::new();
    let fields = Fields::new(map, "");

    let job_id = fields.required_text("job_id", &mut problems);
    let image_id = fields.required_text("image_id", &mut problems);
    let url = fields.required_text("url", &mut problems);

    if let Some(url) = &url {
        if let Err(reason) = check_source_url(url) {
            problems.push(format!("invalid URL '{url}': {reason}"));
        }
    }

    let priority = match fields.token("priority") {
        None => Priority::Medium,
        Some(token) => Priority::from_str(token.trim()).unwrap_or_else(|_| {
            warnings.push(format!(
                "invalid priority '{token}', defaulting to 'medium'"
            ));
            Priority::Medium
        }),
    };

    let status = match fields.token("status") {
        None => JobStatus::Queued,
        Some(token) => JobStatus::from_str(token.trim()).unwrap_or_else(|_| {
            warnings.push(format!(
                "unknown status '{token}', treating job as 'queued'"
            ));
            JobStatus::Queued
        }),
    };

    let created_at = fields.text("created_at", &mut problems).and_then(|raw| {
        let parsed = parse_timestamp(&raw);
        if parsed.is_none() {
            warnings.push(format!("unparseable created_at '{raw}' ignored"));
        }
        parsed
    });

    let category = fields.text("category", &mut problems);
    let batch_id = fields.text("batch_id", &mut problems);

    let retry_count = fields.count("retry_count", &mut problems).unwrap_or(0);
    let max_retries = fields.count("max_retries", &mut problems).unwrap_or(3);
    if retry_count > max_retries {
        problems.push(format!(
            "retry_count ({retry_count}) exceeds max_retries ({max_retries})"
        ));
    }

    let processing_options = decode_options(&fields, &mut problems);

    let job = JobDescriptor {
        job_id: job_id.clone().unwrap_or_default(),
        image_id: image_id.clone().unwrap_or_default(),
        url: url.clone().unwrap_or_default(),
        priority,
        category: category.unwrap_or_else(|| "unknown".to_string()),
        processing_options,
        retry_count,
        max_retries,
        status,
        batch_id,
        created_at,
    };

    // Missing or mistyped fields are already reported; only surface rule
    // violations of the ones that were read.
    if let Err(report) = job.validate() {
        for (path, error) in report.iter() {
            let path = path.to_string();
            let already_reported = problems.iter().any(|p| {
                p == &format!("missing required field: {path}")
                    || p.starts_with(&format!("{path}: expected"))
            });
            if !already_reported {
                problems.push(format!("{path}: {error}"));
            }
        }
    }

    if !problems.is_empty() {
        return Err(ValidationError::Invalid {
            job_id,
            image_id,
            url,
            problems,
        });
    }

    Ok(DecodedJob { job, warnings })
}

fn decode_options(fields: &Fields<'_>, problems: &mut Vec<String>) -> ProcessingOptions {
    let defaults = ProcessingOptions::default();
    let map = match fields.get("processing_options") {
        None => return defaults,
        Some(Value::Object(map)) => map,
        Some(other) => {
            fields.mistyped("processing_options", "an object", other, problems);
            return defaults;
        }
    };

    let options = Fields::new(map, "processing_options.");
    ProcessingOptions {
        create_thumbnail: options
            .flag("create_thumbnail", problems)
            .unwrap_or(defaults.create_thumbnail),
        extract_metadata: options
            .flag("extract_metadata", problems)
            .unwrap_or(defaults.extract_metadata),
        resize_formats: options
            .tokens("resize_formats", problems)
            .unwrap_or(defaults.resize_formats),
        output_formats: options
            .tokens("output_formats", problems)
            .unwrap_or(defaults.output_formats),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn check_source_url(url: &str) -> Result<(), String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| e.to_string())?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("unsupported scheme '{other}'")),
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return Err("missing host".to_string());
    }
    Ok(())
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
