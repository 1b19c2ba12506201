// Copyright 2024-2026 the jsbox authors. MIT license.

//! Conversions between wire `Request`/`Response` specs and the value shape
//! the sandbox glue consumes. Bodies are always stream-shaped: on ingress a
//! bridge stream handle becomes a readable id, on egress a readable id
//! becomes a freshly registered bridge source.

use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol::RequestSpec;
use jsbox_core::protocol::ResponseSpec;
use jsbox_core::value::Value;

pub fn request_to_value(spec: &RequestSpec, body_rid: Option<u64>) -> Value {
  Value::object([
    ("method".to_string(), Value::String(spec.method.clone())),
    ("url".to_string(), Value::String(spec.url.clone())),
    ("headers".to_string(), headers_to_value(&spec.headers)),
    (
      "body".to_string(),
      match body_rid {
        Some(rid) => Value::StreamRef(rid),
        None => Value::Null,
      },
    ),
  ])
}

pub fn response_to_value(spec: &ResponseSpec, body_rid: Option<u64>) -> Value {
  Value::object([
    ("status".to_string(), Value::Number(spec.status as f64)),
    ("statusText".to_string(), Value::String(spec.status_text.clone())),
    ("headers".to_string(), headers_to_value(&spec.headers)),
    (
      "body".to_string(),
      match body_rid {
        Some(rid) => Value::StreamRef(rid),
        None => Value::Null,
      },
    ),
  ])
}

/// Parses the sandbox's request shape; the body readable id (if any) is
/// returned separately so the caller can register it as a source.
pub fn value_to_request_parts(
  value: &Value,
) -> Result<(RequestSpec, Option<u64>), ErrorEnvelope> {
  let obj = value
    .as_object()
    .ok_or_else(|| type_error("Request must be an object"))?;
  let method = obj
    .get("method")
    .and_then(Value::as_str)
    .unwrap_or("GET")
    .to_string();
  let url = obj
    .get("url")
    .and_then(Value::as_str)
    .ok_or_else(|| type_error("Request is missing a url"))?
    .to_string();
  let headers = value_to_headers(obj.get("headers"));
  let body_rid = body_rid(obj.get("body"));
  Ok((RequestSpec { method, url, headers, body: None }, body_rid))
}

/// Parses the value returned by the user's `serve({fetch})` handler.
/// `undefined` (or anything that is not a response-shaped object) is the
/// distinguishable `NoResponse` failure.
pub fn value_to_response_parts(
  value: &Value,
) -> Result<(ResponseSpec, Option<u64>), ErrorEnvelope> {
  let obj = match value.as_object() {
    Some(obj) if obj.contains_key("status") => obj,
    _ => return Err(ErrorEnvelope::no_response()),
  };
  let status = obj
    .get("status")
    .and_then(Value::as_number)
    .unwrap_or(200.0) as u16;
  let status_text = obj
    .get("statusText")
    .and_then(Value::as_str)
    .unwrap_or("")
    .to_string();
  let headers = value_to_headers(obj.get("headers"));
  let body_rid = body_rid(obj.get("body"));
  Ok((ResponseSpec { status, status_text, headers, body: None }, body_rid))
}

fn body_rid(value: Option<&Value>) -> Option<u64> {
  match value {
    Some(Value::StreamRef(rid)) | Some(Value::IteratorRef(rid)) => Some(*rid),
    Some(Value::Number(rid)) => Some(*rid as u64),
    _ => None,
  }
}

fn headers_to_value(headers: &[(String, String)]) -> Value {
  Value::Array(
    headers
      .iter()
      .map(|(k, v)| {
        Value::Array(vec![
          Value::String(k.clone()),
          Value::String(v.clone()),
        ])
      })
      .collect(),
  )
}

fn value_to_headers(value: Option<&Value>) -> Vec<(String, String)> {
  let mut out = Vec::new();
  match value {
    Some(Value::Array(pairs)) => {
      for pair in pairs {
        if let Some([k, v]) = pair.as_array().and_then(|a| a.get(0..2)) {
          if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
            out.push((k.to_string(), v.to_string()));
          }
        }
      }
    }
    Some(Value::Object(entries)) => {
      for (k, v) in entries {
        if let Some(v) = v.as_str() {
          out.push((k.clone(), v.to_string()));
        }
      }
    }
    _ => {}
  }
  out
}

fn type_error(message: &str) -> ErrorEnvelope {
  ErrorEnvelope::new(
    jsbox_core::error::ErrorKind::UserError,
    "TypeError",
    message,
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use jsbox_core::error::ErrorKind;
  use pretty_assertions::assert_eq;

  #[test]
  fn request_round_trips_through_the_value_shape() {
    let spec = RequestSpec {
      method: "POST".to_string(),
      url: "http://h/x".to_string(),
      headers: vec![("a".to_string(), "1".to_string())],
      body: None,
    };
    let value = request_to_value(&spec, Some(7));
    let (parsed, body) = value_to_request_parts(&value).unwrap();
    assert_eq!(parsed.method, "POST");
    assert_eq!(parsed.url, "http://h/x");
    assert_eq!(parsed.headers, vec![("a".to_string(), "1".to_string())]);
    assert_eq!(body, Some(7));
  }

  #[test]
  fn undefined_handler_result_is_no_response() {
    let err = value_to_response_parts(&Value::Undefined).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoResponse);
    assert_eq!(err.message, "fetch handler did not return a Response");
    // A plain object without `status` is not a Response either.
    let not_response = Value::object([(
      "ok".to_string(),
      Value::Bool(true),
    )]);
    assert_eq!(
      value_to_response_parts(&not_response).unwrap_err().kind,
      ErrorKind::NoResponse
    );
  }
}
