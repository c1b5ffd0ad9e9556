// SPDX-License-Identifier: MIT OR Apache-2.0
//! Argument extraction helpers shared by the tool handlers.

use crate::ToolError;
use serde_json::Value;

pub(crate) fn req_str<'a>(args: &'a Value, key: &'static str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or(ToolError::MissingArgument(key))
}

pub(crate) fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

pub(crate) fn opt_u64(args: &Value, key: &str) -> Option<u64> {
    let value = args.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f.max(0.0) as u64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn req_str_reports_the_missing_key() {
        let err = req_str(&json!({}), "filepath").unwrap_err();
        assert!(matches!(err, ToolError::MissingArgument("filepath")));
    }

    #[test]
    fn opt_u64_accepts_numbers_and_strings() {
        assert_eq!(opt_u64(&json!({"t": 30}), "t"), Some(30));
        assert_eq!(opt_u64(&json!({"t": 30.9}), "t"), Some(30));
        assert_eq!(opt_u64(&json!({"t": "45"}), "t"), Some(45));
        assert_eq!(opt_u64(&json!({"t": "x"}), "t"), None);
        assert_eq!(opt_u64(&json!({}), "t"), None);
    }
}
