use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

// Small helper: nested json lookup
pub fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

pub fn extract_str<'a>(val: &'a Value, path: &[&str]) -> Option<&'a str> {
    jget(val, path)?.as_str().filter(|s| !s.is_empty())
}

pub fn extract_i64(val: &Value, path: &[&str]) -> Option<i64> {
    jget(val, path)?.as_i64()
}

pub fn extract_bool(val: &Value, path: &[&str]) -> Option<bool> {
    jget(val, path)?.as_bool()
}

/// Unix seconds to a timestamp; zero, negative and out-of-range values are
/// treated as absent rather than written.
pub fn timestamp_from_unix(secs: i64) -> Option<OffsetDateTime> {
    if secs <= 0 {
        return None;
    }
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

pub fn extract_timestamp(val: &Value, path: &[&str]) -> Option<OffsetDateTime> {
    extract_i64(val, path).and_then(timestamp_from_unix)
}

/// The `customer` field may be an id string or an expanded object.
pub fn extract_customer_id(object: &Value) -> Option<String> {
    match object.get("customer")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Same shape rules as `customer`.
pub fn extract_subscription_ref(object: &Value) -> Option<String> {
    match object.get("subscription")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

/// Internal user id from `metadata.user_id`, falling back to `client_reference_id`.
pub fn extract_user_id(object: &Value) -> Option<Uuid> {
    if let Some(uid) = extract_str(object, &["metadata", "user_id"]) {
        if let Ok(id) = Uuid::parse_str(uid) {
            return Some(id);
        }
    }
    if let Some(id_str) = extract_str(object, &["client_reference_id"]) {
        if let Ok(id) = Uuid::parse_str(id_str) {
            return Some(id);
        }
    }
    None
}
