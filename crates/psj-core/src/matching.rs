//! Order-independent JSON check-off matchers.
//!
//! A check-off matcher projects every element of a JSON array to a key and
//! ticks the key off a wanted list. Missing keys always fail; extra keys fail
//! unless the matcher tolerates them.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MatchError {
    #[error("field {0:?} is missing")]
    FieldMissing(String),

    #[error("field {0:?} is not an array")]
    NotArray(String),

    #[error("field {field:?}: unexpected item {item}")]
    Unwanted { field: String, item: Value },

    #[error("field {field:?}: did not find {missing:?}")]
    Missing { field: String, missing: Vec<Value> },

    #[error("got {got:?}, want {want:?} (in any order)")]
    Mismatch { got: Vec<String>, want: Vec<String> },
}

/// Walk a dotted path such as `state.events`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

/// Check every wanted key off the array at `field`; extra items are errors.
pub fn json_check_off<F>(value: &Value, field: &str, wanted: Vec<Value>, project: F) -> Result<(), MatchError>
where
    F: Fn(&Value) -> Value,
{
    check_off(value, field, wanted, project, false)
}

/// Like [`json_check_off`] but ignores items that are not wanted.
pub fn json_check_off_allow_unwanted<F>(
    value: &Value,
    field: &str,
    wanted: Vec<Value>,
    project: F,
) -> Result<(), MatchError>
where
    F: Fn(&Value) -> Value,
{
    check_off(value, field, wanted, project, true)
}

fn check_off<F>(
    value: &Value,
    field: &str,
    mut wanted: Vec<Value>,
    project: F,
    allow_unwanted: bool,
) -> Result<(), MatchError>
where
    F: Fn(&Value) -> Value,
{
    let items = get_path(value, field)
        .ok_or_else(|| MatchError::FieldMissing(field.to_string()))?
        .as_array()
        .ok_or_else(|| MatchError::NotArray(field.to_string()))?;

    for item in items {
        let key = project(item);
        match wanted.iter().position(|w| *w == key) {
            Some(idx) => {
                wanted.swap_remove(idx);
            }
            None if allow_unwanted => {}
            None => {
                return Err(MatchError::Unwanted {
                    field: field.to_string(),
                    item: key,
                })
            }
        }
    }

    if wanted.is_empty() {
        Ok(())
    } else {
        Err(MatchError::Missing {
            field: field.to_string(),
            missing: wanted,
        })
    }
}

/// Projection `"type|state_key"` used to compare state events.
pub fn type_and_state_key(event: &Value) -> Value {
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    let state_key = event
        .get("state_key")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Value::String(format!("{}|{}", event_type, state_key))
}

/// Projection of `event_id`.
pub fn event_id_of(event: &Value) -> Value {
    event.get("event_id").cloned().unwrap_or(Value::Null)
}

/// `got` and `want` hold the same items, ignoring order.
pub fn check_off_all<T>(got: &[T], want: &[T]) -> Result<(), MatchError>
where
    T: ToString,
{
    let mut got_sorted: Vec<String> = got.iter().map(ToString::to_string).collect();
    let mut want_sorted: Vec<String> = want.iter().map(ToString::to_string).collect();
    got_sorted.sort();
    want_sorted.sort();
    if got_sorted == want_sorted {
        Ok(())
    } else {
        Err(MatchError::Mismatch {
            got: got_sorted,
            want: want_sorted,
        })
    }
}
