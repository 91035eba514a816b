use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::Value as JsonValue;

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn parse_opt_string(v: Option<&JsonValue>) -> Result<Option<String>, &'static str> {
    match v {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => {
            let s = v.as_str().ok_or("must be string or null")?.trim().to_string();
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
    }
}

pub fn parse_bool(v: Option<&JsonValue>, default: bool) -> Result<bool, &'static str> {
    match v {
        None => Ok(default),
        Some(v) if v.is_null() => Ok(default),
        Some(v) => v.as_bool().ok_or("must be boolean"),
    }
}

pub fn parse_required_string_array(
    v: Option<&JsonValue>,
    key: &str,
) -> Result<Vec<String>, String> {
    let Some(raw) = v else {
        return Err(format!("missing {}", key));
    };
    let arr = raw
        .as_array()
        .ok_or_else(|| format!("{} must be array of strings", key))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| format!("{} must be array of strings", key))?
            .trim()
            .to_string();
        if !s.is_empty() && !out.contains(&s) {
            out.push(s);
        }
    }
    Ok(out)
}
