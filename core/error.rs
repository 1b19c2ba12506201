// Copyright 2024-2026 the jsbox authors. MIT license.

//! Error taxonomy and the canonical envelope that crosses the bridge.
//!
//! Every failure observable by a peer is reduced to an [`ErrorEnvelope`]:
//! a machine-matchable [`ErrorKind`] plus the JavaScript-level `name`,
//! `message` and `stack` text, preserved verbatim so the receiving side can
//! rehydrate an exception of the same class.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Matchable failure classes. Kinds, not types: a `TypeError` thrown by user
/// code and a `RangeError` thrown by user code are both `UserError`; the
/// `name` field keeps them apart.
#[derive(
  Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum ErrorKind {
  UserError,
  Syntax,
  Timeout,
  OutOfMemory,
  NoModuleLoader,
  ModuleLoad,
  NoResponse,
  NamespaceBusy,
  CapacityExhausted,
  LockedStream,
  Disposed,
  ConnectionClosed,
  Protocol,
  Internal,
}

/// Fixed, matchable messages for runtime-synthesized errors.
pub const TIMEOUT_MESSAGE: &str = "Script execution timed out";
pub const NO_RESPONSE_MESSAGE: &str = "fetch handler did not return a Response";
pub const NO_MODULE_LOADER_MESSAGE: &str = "No module loader registered";
pub const OUT_OF_MEMORY_MESSAGE: &str = "Isolate exceeded its memory limit";

/// The canonical error shape on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  pub kind: ErrorKind,
  pub name: String,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub stack: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cause: Option<Box<ErrorEnvelope>>,
}

impl ErrorEnvelope {
  pub fn new(
    kind: ErrorKind,
    name: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self {
      kind,
      name: name.into(),
      message: message.into(),
      stack: None,
      cause: None,
    }
  }

  pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
    self.stack = Some(stack.into());
    self
  }

  pub fn with_cause(mut self, cause: ErrorEnvelope) -> Self {
    self.cause = Some(Box::new(cause));
    self
  }

  pub fn timeout() -> Self {
    Self::new(ErrorKind::Timeout, "TimeoutError", TIMEOUT_MESSAGE)
  }

  pub fn out_of_memory() -> Self {
    Self::new(ErrorKind::OutOfMemory, "RangeError", OUT_OF_MEMORY_MESSAGE)
  }

  pub fn no_response() -> Self {
    Self::new(ErrorKind::NoResponse, "TypeError", NO_RESPONSE_MESSAGE)
  }

  pub fn no_module_loader() -> Self {
    Self::new(ErrorKind::NoModuleLoader, "Error", NO_MODULE_LOADER_MESSAGE)
  }

  pub fn namespace_busy(namespace: &str) -> Self {
    Self::new(
      ErrorKind::NamespaceBusy,
      "Error",
      format!("Namespace {namespace:?} already has an active isolate"),
    )
  }

  pub fn capacity_exhausted(max_isolates: usize) -> Self {
    Self::new(
      ErrorKind::CapacityExhausted,
      "Error",
      format!("Isolate capacity exhausted ({max_isolates} in use)"),
    )
  }

  pub fn locked_stream() -> Self {
    Self::new(
      ErrorKind::LockedStream,
      "TypeError",
      "Cannot cancel a stream that is locked to a reader",
    )
  }

  pub fn disposed() -> Self {
    Self::new(ErrorKind::Disposed, "Error", "Isolate was disposed")
  }

  pub fn connection_closed() -> Self {
    Self::new(ErrorKind::ConnectionClosed, "Error", "Connection closed")
  }

  pub fn protocol(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Protocol, "Error", message)
  }

  pub fn internal(message: impl Into<String>) -> Self {
    Self::new(ErrorKind::Internal, "Error", message)
  }

  /// Wraps a loader-thrown error, preserving the original as `cause` while
  /// keeping its name and message visible at the top level.
  pub fn module_load(specifier: &str, cause: ErrorEnvelope) -> Self {
    ErrorEnvelope {
      kind: ErrorKind::ModuleLoad,
      name: cause.name.clone(),
      message: cause.message.clone(),
      stack: cause.stack.clone(),
      cause: Some(Box::new(cause)),
    }
    .tap_message(specifier)
  }

  fn tap_message(mut self, specifier: &str) -> Self {
    if self.message.is_empty() {
      self.message = format!("Failed to load module {specifier:?}");
    }
    self
  }

  /// Connection-scoped errors tear down the transport; everything else is
  /// call- or isolate-scoped.
  pub fn is_connection_fatal(&self) -> bool {
    matches!(self.kind, ErrorKind::Protocol | ErrorKind::ConnectionClosed)
  }
}

impl fmt::Display for ErrorEnvelope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}: {}", self.name, self.message)
  }
}

impl std::error::Error for ErrorEnvelope {}

/// An exception produced by the engine collaborator: the JavaScript-level
/// identity of a thrown value, before it is classified into a kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct JsError {
  pub name: String,
  pub message: String,
  pub stack: Option<String>,
}

impl JsError {
  pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      message: message.into(),
      stack: None,
    }
  }

  pub fn type_error(message: impl Into<String>) -> Self {
    Self::new("TypeError", message)
  }

  pub fn syntax_error(message: impl Into<String>) -> Self {
    Self::new("SyntaxError", message)
  }

  pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
    self.stack = Some(stack.into());
    self
  }
}

impl From<JsError> for ErrorEnvelope {
  fn from(err: JsError) -> ErrorEnvelope {
    let kind = if err.name == "SyntaxError" {
      ErrorKind::Syntax
    } else {
      ErrorKind::UserError
    };
    ErrorEnvelope {
      kind,
      name: err.name,
      message: err.message,
      stack: err.stack,
      cause: None,
    }
  }
}

impl From<ErrorEnvelope> for JsError {
  fn from(env: ErrorEnvelope) -> JsError {
    JsError {
      name: env.name,
      message: env.message,
      stack: env.stack,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn js_error_classification() {
    let env: ErrorEnvelope = JsError::syntax_error("unexpected token").into();
    assert_eq!(env.kind, ErrorKind::Syntax);

    let env: ErrorEnvelope =
      JsError::new("RangeError", "out of range").into();
    assert_eq!(env.kind, ErrorKind::UserError);
    assert_eq!(env.name, "RangeError");
  }

  #[test]
  fn round_trip_preserves_identity() {
    let env = ErrorEnvelope::new(ErrorKind::UserError, "TypeError", "boom")
      .with_stack("TypeError: boom\n    at <anonymous>:1:1");
    let bytes = bincode::serialize(&env).unwrap();
    let back: ErrorEnvelope = bincode::deserialize(&bytes).unwrap();
    assert_eq!(env, back);
    let js: JsError = back.into();
    assert_eq!(js.name, "TypeError");
    assert_eq!(js.message, "boom");
    assert!(js.stack.unwrap().contains("at <anonymous>"));
  }

  #[test]
  fn module_load_preserves_cause() {
    let loader_err =
      ErrorEnvelope::new(ErrorKind::UserError, "NotFoundError", "no such file");
    let env = ErrorEnvelope::module_load("./missing.js", loader_err.clone());
    assert_eq!(env.kind, ErrorKind::ModuleLoad);
    assert_eq!(env.name, "NotFoundError");
    assert_eq!(env.message, "no such file");
    assert_eq!(*env.cause.unwrap(), loader_err);
  }

  #[test]
  fn fixed_messages() {
    assert_eq!(ErrorEnvelope::timeout().message, "Script execution timed out");
    assert_eq!(
      ErrorEnvelope::no_module_loader().message,
      "No module loader registered"
    );
    assert_eq!(
      ErrorEnvelope::no_response().message,
      "fetch handler did not return a Response"
    );
  }
}
