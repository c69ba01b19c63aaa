//! Inspection of the opaque render-parameter text carried by step4.
//!
//! The engine never validates provider-specific schemas. It only checks that the
//! text is a JSON object and counts how many of its values are filled in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::WorkflowError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamsSummary {
    pub valid: bool,
    pub total: usize,
    pub filled: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParamsFillState {
    Invalid,
    Empty,
    Partial,
    Full,
}

/// Blank text is an empty object. Anything that is not a JSON object is rejected.
pub fn parse_params_object(raw: &str) -> Result<Map<String, Value>, WorkflowError> {
    let text = raw.trim();
    if text.is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(WorkflowError::InvalidParams(
            "params must be a JSON object".to_string(),
        )),
        Err(err) => Err(WorkflowError::InvalidParams(err.to_string())),
    }
}

fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(text) => !text.trim().is_empty(),
        Value::Number(_) | Value::Bool(_) => true,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

pub fn summarize_params(raw: &str) -> ParamsSummary {
    match parse_params_object(raw) {
        Ok(map) => ParamsSummary {
            valid: true,
            total: map.len(),
            filled: map.values().filter(|value| is_filled(value)).count(),
        },
        Err(_) => ParamsSummary {
            valid: false,
            total: 0,
            filled: 0,
        },
    }
}

impl ParamsSummary {
    pub fn fill_state(&self) -> ParamsFillState {
        if !self.valid {
            ParamsFillState::Invalid
        } else if self.total == 0 {
            ParamsFillState::Empty
        } else if self.filled >= self.total {
            ParamsFillState::Full
        } else {
            ParamsFillState::Partial
        }
    }
}
