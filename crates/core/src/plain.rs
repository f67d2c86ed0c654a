//! Plain-data validation of fixture hook results.

use crate::error::{ErrorKind, WireError};
use serde::Serialize;
use serde_json::Value;

/// Deepest nesting of arrays and objects accepted in a hook result.
pub const MAX_PLAIN_DEPTH: usize = 64;

const NOT_SERIALIZABLE: &str = "hook result could not be serialized";

/// Convert a hook's return value into plain JSON data.
pub fn to_plain_value<T: Serialize + ?Sized>(value: &T) -> Result<Value, WireError> {
    let value = serde_json::to_value(value).map_err(|e| not_serializable(e.to_string()))?;
    check_plain(&value)?;
    Ok(value)
}

/// Reject values nested deeper than [`MAX_PLAIN_DEPTH`].
pub fn check_plain(value: &Value) -> Result<(), WireError> {
    let mut stack = vec![(value, 0usize)];
    while let Some((value, depth)) = stack.pop() {
        let is_container = matches!(value, Value::Array(_) | Value::Object(_));
        if is_container && depth >= MAX_PLAIN_DEPTH {
            return Err(not_serializable(format!(
                "nested deeper than {MAX_PLAIN_DEPTH} levels"
            )));
        }
        match value {
            Value::Array(items) => stack.extend(items.iter().map(|child| (child, depth + 1))),
            Value::Object(map) => stack.extend(map.values().map(|child| (child, depth + 1))),
            _ => {}
        }
    }
    Ok(())
}

/// The error reported for a result that is not plain data.
pub fn not_serializable(reason: impl std::fmt::Display) -> WireError {
    WireError::new(
        ErrorKind::NonSerializableResult,
        format!("{NOT_SERIALIZABLE}: {reason}"),
    )
}
