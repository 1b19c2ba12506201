// Copyright 2024-2026 the jsbox authors. MIT license.

//! Typed bodies for bridge frames.
//!
//! A `Call` frame carries a [`CallBody`]; its terminal `Reply` carries the
//! matching [`ReplyBody`] variant, or an `Err` frame carries an
//! [`ErrorEnvelope`]. Stream frames carry a bare [`Value`] chunk
//! (`StreamChunk`) or an envelope (`StreamErr`).
//!
//! The same enums serve both directions: clients issue control calls
//! (`CreateRuntime`, `Eval`, ...) while the daemon issues host callbacks
//! (`Host(...)`) — the mux does not care who is who.

use crate::error::ErrorEnvelope;
use crate::value::Value;
use bytes::Bytes;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// Handle into the owning connection's stream table.
pub type StreamHandle = u64;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallBody {
  CreateRuntime {
    options: CreateRuntimeOptions,
    namespace: Option<String>,
  },
  Eval {
    runtime_id: String,
    code: String,
    options: EvalOptions,
  },
  DispatchRequest {
    runtime_id: String,
    request: RequestSpec,
  },
  Dispose {
    runtime_id: String,
  },
  GetStats,
  /// Host callback, issued by the daemon against the client.
  Host(HostCall),
  /// Pull-based demand for up to `n` more chunks on a stream handle owned
  /// by the receiving peer.
  StreamPull {
    handle: StreamHandle,
    n: u32,
  },
  /// Cancel a stream handle owned by the receiving peer. Acked even when the
  /// handle is already gone.
  StreamCancel {
    handle: StreamHandle,
    reason: Option<String>,
  },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyBody {
  Unit,
  Value(Value),
  RuntimeCreated { id: String, reused: bool },
  Response(ResponseSpec),
  ModuleSource(LoaderResult),
  Stats(Stats),
}

/// Host callbacks: operations the sandbox (via the daemon) invokes against
/// the connected client. One variant per callback slot; slots the client did
/// not register are never dispatched (capability flags in
/// [`CreateRuntimeOptions`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HostCall {
  ConsoleEntry {
    runtime_id: String,
    entry: ConsoleEntry,
  },
  Fetch {
    runtime_id: String,
    request: RequestSpec,
  },
  ModuleLoad {
    runtime_id: String,
    specifier: String,
    importer: Importer,
  },
  Fs {
    runtime_id: String,
    op: FsOp,
  },
  CustomFn {
    runtime_id: String,
    name: String,
    args: Vec<Value>,
  },
  Playwright {
    runtime_id: String,
    payload: Value,
  },
  TestEvent {
    runtime_id: String,
    event: Value,
  },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CreateRuntimeOptions {
  pub memory_limit_mb: Option<u32>,
  /// Default wall-clock budget per eval; overridable per call.
  pub max_execution_ms: Option<u64>,
  pub cwd: Option<String>,
  pub env: IndexMap<String, String>,
  pub capabilities: Capabilities,
}

/// Which callback groups the connection registered. Unset groups are absent,
/// not null: dispatching to them is a runtime error surfaced to the sandbox.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capabilities {
  pub console: bool,
  pub fetch: bool,
  pub module_loader: bool,
  pub fs: bool,
  pub playwright: bool,
  pub test_env: bool,
  pub custom_functions: Vec<CustomFnSpec>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomFnSpec {
  pub name: String,
  pub mode: CustomFnMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CustomFnMode {
  Sync,
  Async,
  AsyncIterator,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvalOptions {
  pub filename: Option<String>,
  pub max_execution_ms: Option<u64>,
}

/// Wire shape of a `Request`. Bodies are always stream-shaped, even for
/// in-memory payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
  pub method: String,
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<StreamHandle>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Option<StreamHandle>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
  /// Entry discriminator, e.g. `"log"`, `"count"`, `"timeEnd"`.
  #[serde(rename = "type")]
  pub kind: String,
  pub level: ConsoleLevel,
  /// Node-style formatted text, group indentation applied.
  pub stdout: String,
  pub args: Vec<Value>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsoleLevel {
  Debug,
  Info,
  Log,
  Warn,
  Error,
}

/// The importer record handed to the module loader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Importer {
  /// POSIX absolute path of the importing module.
  pub path: String,
  /// Directory of the importing module; the base for relative resolution.
  pub resolve_dir: String,
}

/// What the host loader returns for a specifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderResult {
  pub code: String,
  pub resolve_dir: String,
  pub filename: Option<String>,
  /// `"esm"` or `"cjs"`; absent means "infer by scan".
  pub format: Option<String>,
  /// Hint that the source is safe to evaluate synchronously during static
  /// linking.
  #[serde(rename = "static")]
  pub static_hint: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FsOp {
  ReadFile { path: String },
  WriteFile { path: String, data: serde_bytes::ByteBuf },
  Unlink { path: String },
  Readdir { path: String },
  Mkdir { path: String },
  Rmdir { path: String },
  Stat { path: String },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Stats {
  pub total_isolates_created: u64,
  pub total_requests_processed: u64,
  pub active_connections: u64,
}

pub fn encode_body<T: Serialize>(body: &T) -> Bytes {
  bincode::serialize(body)
    .expect("protocol bodies are always serializable")
    .into()
}

pub fn decode_body<'a, T: Deserialize<'a>>(
  bytes: &'a [u8],
) -> Result<T, ErrorEnvelope> {
  bincode::deserialize(bytes)
    .map_err(|e| ErrorEnvelope::protocol(format!("malformed frame body: {e}")))
}
