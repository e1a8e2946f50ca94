use agent_protocol::{DriverError, Record, Transform, driver::parse_config};
use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

pub const TRIM: &str = "trim";
pub const REGEX_FILTER: &str = "regex_filter";
pub const ADD_FIELDS: &str = "add_fields";

const DEFAULT_FIELD: &str = "message";

fn default_field() -> String {
    DEFAULT_FIELD.to_string()
}

/// Strips leading and trailing whitespace from a string field.
#[derive(Debug, Clone, Deserialize)]
pub struct Trim {
    #[serde(default = "default_field")]
    field: String,
}

impl Trim {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        parse_config(TRIM, config)
    }
}

impl Transform for Trim {
    fn name(&self) -> &str {
        TRIM
    }

    fn apply(&self, mut record: Record) -> Result<Option<Record>, DriverError> {
        if let Some(Value::String(text)) = record.get_mut(&self.field) {
            let trimmed = text.trim();
            if trimmed.len() != text.len() {
                *text = trimmed.to_string();
            }
        }
        Ok(Some(record))
    }
}

#[derive(Debug, Deserialize)]
struct RegexFilterConfig {
    #[serde(default = "default_field")]
    field: String,
    pattern: String,
    #[serde(default)]
    invert: bool,
}

/// Keeps records whose field matches `pattern` (or does not, with `invert`).
/// Records without the field count as non-matching.
#[derive(Debug, Clone)]
pub struct RegexFilter {
    field: String,
    pattern: Regex,
    invert: bool,
}

impl RegexFilter {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let cfg: RegexFilterConfig = parse_config(REGEX_FILTER, config)?;
        let pattern = Regex::new(&cfg.pattern).map_err(|e| DriverError::invalid(REGEX_FILTER, e))?;
        Ok(Self {
            field: cfg.field,
            pattern,
            invert: cfg.invert,
        })
    }
}

impl Transform for RegexFilter {
    fn name(&self) -> &str {
        REGEX_FILTER
    }

    fn apply(&self, record: Record) -> Result<Option<Record>, DriverError> {
        let matched = match record.get(&self.field) {
            Some(Value::String(s)) => self.pattern.is_match(s),
            Some(Value::Null) | None => false,
            Some(other) => self.pattern.is_match(&other.to_string()),
        };
        Ok((matched != self.invert).then_some(record))
    }
}

/// Sets constant fields on every record, optionally stamping the time the
/// record passed through the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct AddFields {
    #[serde(default)]
    fields: Map<String, Value>,
    #[serde(default)]
    timestamp_field: Option<String>,
}

impl AddFields {
    pub fn from_config(config: &Value) -> Result<Self, DriverError> {
        let t: AddFields = parse_config(ADD_FIELDS, config)?;
        if t.fields.is_empty() && t.timestamp_field.is_none() {
            return Err(DriverError::invalid(
                ADD_FIELDS,
                "needs `fields` or `timestamp_field`",
            ));
        }
        Ok(t)
    }
}

impl Transform for AddFields {
    fn name(&self) -> &str {
        ADD_FIELDS
    }

    fn apply(&self, mut record: Record) -> Result<Option<Record>, DriverError> {
        for (k, v) in &self.fields {
            record.insert(k.clone(), v.clone());
        }
        if let Some(field) = &self.timestamp_field {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            record.insert(field.clone(), Value::String(now));
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn trim_default_field() {
        let t = Trim::from_config(&json!({"type": "trim"})).unwrap();
        let out = t.apply(rec(json!({"message": "  a\n", "n": 1}))).unwrap().unwrap();
        assert_eq!(out, rec(json!({"message": "a", "n": 1})));

        // non-string fields are left alone
        let out = t.apply(rec(json!({"message": 5}))).unwrap().unwrap();
        assert_eq!(out["message"], json!(5));
    }

    #[test]
    fn regex_filter_keeps_and_drops() {
        let f = RegexFilter::from_config(&json!({"type": "regex_filter", "pattern": "^ERROR"})).unwrap();
        assert!(f.apply(rec(json!({"message": "ERROR disk"}))).unwrap().is_some());
        assert!(f.apply(rec(json!({"message": "INFO ok"}))).unwrap().is_none());
        assert!(f.apply(rec(json!({"other": "ERROR"}))).unwrap().is_none());

        let inv = RegexFilter::from_config(
            &json!({"type": "regex_filter", "field": "level", "pattern": "debug", "invert": true}),
        )
        .unwrap();
        assert!(inv.apply(rec(json!({"level": "debug"}))).unwrap().is_none());
        assert!(inv.apply(rec(json!({"level": "warn"}))).unwrap().is_some());
    }

    #[test]
    fn regex_filter_rejects_bad_pattern() {
        assert!(matches!(
            RegexFilter::from_config(&json!({"type": "regex_filter", "pattern": "("})),
            Err(DriverError::InvalidConfig { .. })
        ));
        assert!(RegexFilter::from_config(&json!({"type": "regex_filter"})).is_err());
    }

    #[test]
    fn add_fields_and_timestamp() {
        let t = AddFields::from_config(&json!({
            "type": "add_fields",
            "fields": {"host": "web-1", "env": "prod"},
            "timestamp_field": "@timestamp"
        }))
        .unwrap();
        let out = t.apply(rec(json!({"message": "x", "env": "dev"}))).unwrap().unwrap();
        assert_eq!(out["host"], json!("web-1"));
        assert_eq!(out["env"], json!("prod"));
        let ts = out["@timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn add_fields_needs_something_to_add() {
        assert!(AddFields::from_config(&json!({"type": "add_fields"})).is_err());
    }
}
