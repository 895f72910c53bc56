//! Wit.ai style payload parser
//!
//! Messenger's built-in NLP attaches a Wit payload to each message:
//!
//! ```json
//! {
//!   "intent": [{ "confidence": 0.98, "value": "book_table" }],
//!   "nb_persons": [{ "confidence": 0.91, "value": 4 }],
//!   "booking_date": [{
//!     "confidence": 0.87,
//!     "value": "2024-06-01T20:00:00.000+02:00",
//!     "grain": "hour"
//!   }]
//! }
//! ```
//!
//! Only keys present in the configured data type map are read. A key that is
//! unknown or whose value is malformed is skipped with a warning; only a
//! payload that is not a JSON object fails the parse. Keys are visited in
//! sorted order so entity order is stable.

use std::collections::HashMap;

use chrono::{DateTime, FixedOffset};
use serde_json::{Map, Value};
use tracing::warn;

use sdk::{DataType, EngineError, Entity, GranularTime, Granularity, Intent, NluParser, ParsedData};

/// Parser for Wit entity maps
#[derive(Debug, Clone)]
pub struct WitParser {
    data_types: HashMap<String, DataType>,
}

impl WitParser {
    pub fn new(data_types: HashMap<String, DataType>) -> Self {
        Self { data_types }
    }

    /// Data types for the table-booking catalog
    pub fn default_data_types() -> HashMap<String, DataType> {
        HashMap::from([
            ("intent".to_string(), DataType::Intent),
            ("nb_persons".to_string(), DataType::Int),
            ("booking_date".to_string(), DataType::DateTime),
        ])
    }
}

impl Default for WitParser {
    fn default() -> Self {
        Self::new(Self::default_data_types())
    }
}

impl NluParser for WitParser {
    fn parse(&self, raw: &[u8]) -> Result<ParsedData, EngineError> {
        let payload: Map<String, Value> = serde_json::from_slice(raw)
            .map_err(|e| EngineError::NluParse(format!("Payload is not a JSON object: {}", e)))?;

        let mut data = ParsedData::default();

        let mut entries: Vec<(&String, &Value)> = payload.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (key, value) in entries {
            let Some(data_type) = self.data_types.get(key) else {
                warn!(key = %key, "NLU data type is not handled, skipping");
                continue;
            };

            let parsed = match data_type {
                DataType::Intent => to_intent(value).map(|intent| data.intent = Some(intent)),
                DataType::Int | DataType::DateTime => {
                    to_entity(key, value, *data_type).map(|entity| data.entities.push(entity))
                }
            };

            if let Err(e) = parsed {
                warn!(key = %key, data_type = data_type.as_str(), "Skipping NLU value: {}", e);
            }
        }

        Ok(data)
    }
}

/// First object of a Wit value array
fn first_object<'a>(value: &'a Value, key: &str) -> Result<&'a Map<String, Value>, EngineError> {
    value
        .as_array()
        .and_then(|values| values.first())
        .and_then(Value::as_object)
        .ok_or_else(|| EngineError::NluParse(format!("'{}' is not a non-empty array of objects", key)))
}

fn to_intent(value: &Value) -> Result<Intent, EngineError> {
    let object = first_object(value, "intent")?;
    let name = object
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::NluParse("Missing key: value".to_string()))?;

    let intent = Intent::new(name);
    Ok(match object.get("confidence").and_then(Value::as_f64) {
        Some(confidence) => intent.with_confidence(confidence as f32),
        None => intent,
    })
}

fn to_entity(name: &str, value: &Value, data_type: DataType) -> Result<Entity, EngineError> {
    let object = first_object(value, name)?;
    let confidence = object
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or_else(|| EngineError::NluParse("Could not read confidence as a number".to_string()))?
        as f32;

    match data_type {
        DataType::Int => {
            let value = object.get("value").and_then(Value::as_i64).ok_or_else(|| {
                EngineError::NluParse("Could not read value as an integer".to_string())
            })?;
            Ok(Entity::integer(name, confidence, value))
        }
        DataType::DateTime => {
            if object.get("value").map(Value::is_string).unwrap_or(false) {
                let time = granular_time(object)?;
                return Ok(Entity::datetime(name, confidence, time.value, time.granularity));
            }

            // No single value: an interval with both bounds
            let from = bound(object, "from")?;
            let to = bound(object, "to")?;
            Ok(Entity::interval(name, confidence, from, to))
        }
        DataType::Intent => Err(EngineError::NluParse(format!(
            "'{}' is an intent, not an entity",
            name
        ))),
    }
}

fn bound(object: &Map<String, Value>, key: &str) -> Result<GranularTime, EngineError> {
    let bound = object
        .get(key)
        .and_then(Value::as_object)
        .ok_or_else(|| EngineError::NluParse(format!("Missing key: {}", key)))?;
    granular_time(bound)
}

fn granular_time(object: &Map<String, Value>) -> Result<GranularTime, EngineError> {
    let value = object
        .get("value")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::NluParse("Missing key: value".to_string()))?;
    let time: DateTime<FixedOffset> = DateTime::parse_from_rfc3339(value)
        .map_err(|e| EngineError::NluParse(format!("Malformed datetime '{}': {}", value, e)))?;

    let grain = object
        .get("grain")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::NluParse("Missing key: grain".to_string()))?;
    let granularity: Granularity = grain.parse()?;

    Ok(GranularTime::new(time, granularity))
}
