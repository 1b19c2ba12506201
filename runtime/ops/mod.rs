// Copyright 2024-2026 the jsbox authors. MIT license.

//! The sandbox op surface. Every global the runtime installs — `console`,
//! `fetch`, timers, `require`, `serve`, custom functions, `path`, the
//! stream glue — bottoms out in an op dispatched through [`OpRouter`].
//!
//! Sync ops complete inline against [`OpState`]. Async ops are queued as
//! [`PendingOp`]s; the isolate worker drains the queue between event-loop
//! pumps, runs the bridge round-trip (or timer arm, or module load) and
//! resolves the parked promise. This split keeps the op handler free of
//! any engine re-entry.

pub mod console;
pub mod http;
pub mod timers;

use crate::bridge::Bridge;
use crate::streams::boxed;
use crate::streams::Readable;
use crate::testenv::HookKind;
use crate::testenv::TestEnv;
use crate::testenv::TestMode;
use futures::StreamExt;
use indexmap::IndexMap;
use jsbox_core::engine::OpHandler;
use jsbox_core::engine::OpId;
use jsbox_core::engine::OpOutcome;
use jsbox_core::engine::OpRequest;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::error::ErrorKind;
use jsbox_core::path_util;
use jsbox_core::protocol::Capabilities;
use jsbox_core::protocol::ConsoleEntry;
use jsbox_core::protocol::ConsoleLevel;
use jsbox_core::protocol::CustomFnMode;
use jsbox_core::value::Value;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::rc::Rc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// An async op waiting for the worker to run it.
pub struct PendingOp {
  pub op: OpId,
  pub request: OpRequest,
}

pub type ReadableSlot = Rc<tokio::sync::Mutex<Readable>>;

/// Per-isolate op state. Single-threaded; lives on the isolate's worker
/// thread behind an `Rc`.
pub struct OpState {
  pub runtime_id: String,
  pub cwd: String,
  pub env: IndexMap<String, String>,
  pub bridge: RefCell<Bridge>,
  pub capabilities: RefCell<Capabilities>,
  pub custom_modes: RefCell<HashMap<String, CustomFnMode>>,
  pub console: RefCell<console::ConsoleState>,
  pub timers: RefCell<timers::TimerQueue>,
  pub testenv: RefCell<TestEnv>,
  readables: RefCell<HashMap<u64, ReadableSlot>>,
  pushers:
    RefCell<HashMap<u64, mpsc::UnboundedSender<Result<Value, ErrorEnvelope>>>>,
  next_readable: Cell<u64>,
  pub serve_handler: Cell<Option<u64>>,
  /// Console entries awaiting shipment, in emission order.
  pub console_outbox: RefCell<VecDeque<ConsoleEntry>>,
  /// Async ops queued for the worker.
  pub pending: RefCell<VecDeque<PendingOp>>,
  /// Ops whose timers were cleared; resolve as cancelled.
  pub cancelled_ops: RefCell<Vec<OpId>>,
  next_op: Cell<OpId>,
  /// Wakes the worker loop when sync dispatch queued work.
  pub notify: Rc<Notify>,
}

impl OpState {
  pub fn new(
    runtime_id: String,
    cwd: String,
    env: IndexMap<String, String>,
    capabilities: Capabilities,
    bridge: Bridge,
  ) -> Rc<OpState> {
    let custom_modes = capabilities
      .custom_functions
      .iter()
      .map(|spec| (spec.name.clone(), spec.mode))
      .collect();
    Rc::new(OpState {
      runtime_id,
      cwd,
      env,
      bridge: RefCell::new(bridge),
      capabilities: RefCell::new(capabilities),
      custom_modes: RefCell::new(custom_modes),
      console: RefCell::new(console::ConsoleState::new()),
      timers: RefCell::new(timers::TimerQueue::new()),
      testenv: RefCell::new(TestEnv::new()),
      readables: RefCell::new(HashMap::new()),
      pushers: RefCell::new(HashMap::new()),
      next_readable: Cell::new(1),
      serve_handler: Cell::new(None),
      console_outbox: RefCell::new(VecDeque::new()),
      pending: RefCell::new(VecDeque::new()),
      cancelled_ops: RefCell::new(Vec::new()),
      next_op: Cell::new(1),
      notify: Rc::new(Notify::new()),
    })
  }

  /// Reuse: the new connection's callbacks replace the old ones; module
  /// cache and globals stay.
  pub fn rebind(&self, bridge: Bridge, capabilities: Capabilities) {
    *self.custom_modes.borrow_mut() = capabilities
      .custom_functions
      .iter()
      .map(|spec| (spec.name.clone(), spec.mode))
      .collect();
    *self.capabilities.borrow_mut() = capabilities;
    *self.bridge.borrow_mut() = bridge;
  }

  /// The soft-dispose reset routine: timers and ephemeral console state.
  /// Returns the timer ops to resolve as cancelled.
  pub fn reset_ephemeral(&self) -> Vec<OpId> {
    self.console.borrow_mut().reset();
    self.console_outbox.borrow_mut().clear();
    self.timers.borrow_mut().clear_all()
  }

  pub fn insert_readable(&self, readable: Readable) -> u64 {
    let rid = self.next_readable.get();
    self.next_readable.set(rid + 1);
    self
      .readables
      .borrow_mut()
      .insert(rid, Rc::new(tokio::sync::Mutex::new(readable)));
    rid
  }

  pub fn readable(&self, rid: u64) -> Result<ReadableSlot, ErrorEnvelope> {
    self
      .readables
      .borrow()
      .get(&rid)
      .cloned()
      .ok_or_else(|| type_error(format!("unknown stream {rid}")))
  }

  /// Removes and unwraps a readable for a consuming operation (tee,
  /// pipe-through, sending as a body). Fails while a read is in flight.
  pub fn take_readable(&self, rid: u64) -> Result<Readable, ErrorEnvelope> {
    let slot = self
      .readables
      .borrow_mut()
      .remove(&rid)
      .ok_or_else(|| type_error(format!("unknown stream {rid}")))?;
    match Rc::try_unwrap(slot) {
      Ok(mutex) => Ok(mutex.into_inner()),
      Err(slot) => {
        self.readables.borrow_mut().insert(rid, slot);
        Err(type_error(format!("stream {rid} is busy")))
      }
    }
  }

  /// Replaces every bridge-scoped ref in an incoming value with a local
  /// readable id, so sandbox code never sees a raw peer handle without a
  /// matching table entry.
  pub fn ingress_value(&self, value: Value) -> Value {
    match value {
      Value::StreamRef(handle) => {
        let remote = self.bridge.borrow().streams().open_sink(handle);
        Value::StreamRef(self.insert_readable(Readable::new(Box::pin(remote))))
      }
      Value::IteratorRef(handle) => {
        let remote = self.bridge.borrow().streams().open_sink(handle);
        Value::IteratorRef(
          self.insert_readable(Readable::new(Box::pin(remote))),
        )
      }
      Value::Array(items) => Value::Array(
        items.into_iter().map(|item| self.ingress_value(item)).collect(),
      ),
      Value::Object(entries) => Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| (k, self.ingress_value(v)))
          .collect(),
      ),
      other => other,
    }
  }

  /// Registers a sandbox readable as an outgoing bridge source and returns
  /// the peer-facing handle.
  pub fn egress_readable(&self, rid: u64) -> Result<u64, ErrorEnvelope> {
    let readable = self.take_readable(rid)?;
    let source = readable.into_source()?;
    Ok(self.bridge.borrow().streams().register_source(source))
  }

  /// Prepares a sandbox value for the wire: local readable ids become
  /// bridge source handles. Functions cannot cross the boundary.
  pub fn egress_value(&self, value: Value) -> Result<Value, ErrorEnvelope> {
    Ok(match value {
      Value::StreamRef(rid) => Value::StreamRef(self.egress_readable(rid)?),
      Value::IteratorRef(rid) => {
        Value::IteratorRef(self.egress_readable(rid)?)
      }
      Value::CallbackRef(_) => {
        return Err(type_error(
          "functions cannot cross the sandbox boundary",
        ));
      }
      Value::Array(items) => Value::Array(
        items
          .into_iter()
          .map(|item| self.egress_value(item))
          .collect::<Result<_, _>>()?,
      ),
      Value::Object(entries) => Value::Object(
        entries
          .into_iter()
          .map(|(k, v)| Ok((k, self.egress_value(v)?)))
          .collect::<Result<_, ErrorEnvelope>>()?,
      ),
      other => other,
    })
  }

  fn alloc_op(&self) -> OpId {
    let id = self.next_op.get();
    self.next_op.set(id + 1);
    id
  }

  fn queue_async(&self, request: OpRequest) -> OpOutcome {
    let op = self.alloc_op();
    self.pending.borrow_mut().push_back(PendingOp { op, request });
    self.notify.notify_one();
    OpOutcome::Pending(op)
  }

  fn emit_console(&self, entry: ConsoleEntry) {
    if self.capabilities.borrow().console {
      self.console_outbox.borrow_mut().push_back(entry);
      self.notify.notify_one();
    }
  }
}

pub struct OpRouter {
  pub state: Rc<OpState>,
}

impl OpHandler for OpRouter {
  fn dispatch(&self, req: OpRequest) -> OpOutcome {
    match req.name.as_str() {
      // Ops the worker must run: bridge round-trips, timers, module loads.
      "op_fetch" | "op_custom_call" | "op_fs" | "op_playwright"
      | "op_require" | "op_import" | "op_timer_start" | "op_stream_read"
      | "op_test_run" => self.state.queue_async(req),
      name => OpOutcome::Sync(self.sync_op(name, &req.args)),
    }
  }
}

impl OpRouter {
  pub fn new(state: Rc<OpState>) -> OpRouter {
    OpRouter { state }
  }

  fn sync_op(
    &self,
    name: &str,
    args: &[Value],
  ) -> Result<Value, ErrorEnvelope> {
    let state = &self.state;
    match name {
      "op_console_entry" => {
        let level = match arg_str(args, 0)? {
          "debug" => ConsoleLevel::Debug,
          "info" => ConsoleLevel::Info,
          "warn" => ConsoleLevel::Warn,
          "error" => ConsoleLevel::Error,
          _ => ConsoleLevel::Log,
        };
        let kind = arg_str(args, 1)?.to_string();
        let rest: Vec<Value> =
          args.iter().skip(2).cloned().map(sanitize_console_arg).collect();
        let entry = state.console.borrow().entry(&kind, level, rest);
        state.emit_console(entry);
        Ok(Value::Undefined)
      }
      "op_console_count" => {
        let entry = state.console.borrow_mut().count(arg_str(args, 0)?);
        state.emit_console(entry);
        Ok(Value::Undefined)
      }
      "op_console_count_reset" => {
        state.console.borrow_mut().count_reset(arg_str(args, 0)?);
        Ok(Value::Undefined)
      }
      "op_console_time" => {
        state.console.borrow_mut().time(arg_str(args, 0)?);
        Ok(Value::Undefined)
      }
      "op_console_time_end" => {
        let entry = state.console.borrow_mut().time_end(arg_str(args, 0)?);
        state.emit_console(entry);
        Ok(Value::Undefined)
      }
      "op_console_group" => {
        let rest: Vec<Value> =
          args.iter().cloned().map(sanitize_console_arg).collect();
        let entry = state.console.borrow_mut().group(rest);
        state.emit_console(entry);
        Ok(Value::Undefined)
      }
      "op_console_group_end" => {
        state.console.borrow_mut().group_end();
        Ok(Value::Undefined)
      }

      "op_timer_clear" => {
        let timer_id = arg_u64(args, 0)?;
        if let Some(op) = state.timers.borrow_mut().clear(timer_id) {
          state.cancelled_ops.borrow_mut().push(op);
          state.notify.notify_one();
        }
        Ok(Value::Undefined)
      }

      "op_serve_register" => {
        match args.first() {
          Some(Value::CallbackRef(cb)) => {
            state.serve_handler.set(Some(*cb));
            Ok(Value::Undefined)
          }
          _ => Err(type_error("serve requires a fetch handler function")),
        }
      }

      "op_path_join" => {
        let mut joined = String::new();
        for part in args {
          let part = part
            .as_str()
            .ok_or_else(|| type_error("path segments must be strings"))?;
          if joined.is_empty() {
            joined = part.to_string();
          } else {
            joined = format!("{joined}/{part}");
          }
        }
        Ok(Value::String(path_util::normalize(&joined)))
      }
      "op_path_dirname" => {
        Ok(Value::String(path_util::dirname(arg_str(args, 0)?)))
      }
      "op_path_basename" => {
        Ok(Value::String(path_util::basename(arg_str(args, 0)?)))
      }
      "op_path_extname" => {
        Ok(Value::String(path_util::extname(arg_str(args, 0)?)))
      }
      "op_path_normalize" => {
        Ok(Value::String(path_util::normalize(arg_str(args, 0)?)))
      }
      "op_path_resolve" => {
        let mut resolved = state.cwd.clone();
        for part in args {
          let part = part
            .as_str()
            .ok_or_else(|| type_error("path segments must be strings"))?;
          resolved = path_util::join(&resolved, part);
        }
        Ok(Value::String(resolved))
      }

      "op_process_cwd" => Ok(Value::String(state.cwd.clone())),
      "op_process_env" => Ok(Value::Object(
        state
          .env
          .iter()
          .map(|(k, v)| (k.clone(), Value::String(v.clone())))
          .collect(),
      )),
      "op_crypto_random_uuid" => {
        Ok(Value::String(uuid::Uuid::new_v4().to_string()))
      }
      "op_crypto_random_bytes" => {
        let n = arg_u64(args, 0)? as usize;
        if n > 65_536 {
          return Err(type_error("requested too many random bytes"));
        }
        let mut buf = vec![0u8; n];
        rand::Rng::fill(&mut rand::thread_rng(), &mut buf[..]);
        Ok(Value::Bytes(buf))
      }

      "op_readable_from_ref" => {
        let handle = arg_ref(args, 0)?;
        let remote = state.bridge.borrow().streams().open_sink(handle);
        Ok(Value::Number(
          state.insert_readable(Readable::new(Box::pin(remote))) as f64,
        ))
      }
      "op_readable_create" => {
        let (tx, rx) = mpsc::unbounded_channel();
        let readable = Readable::new(boxed(
          tokio_stream_adapter(rx),
        ));
        let rid = state.insert_readable(readable);
        state.pushers.borrow_mut().insert(rid, tx);
        Ok(Value::Number(rid as f64))
      }
      "op_readable_push" => {
        let rid = arg_ref(args, 0)?;
        let chunk = args
          .get(1)
          .cloned()
          .ok_or_else(|| type_error("push requires a chunk"))?;
        if let Some(tx) = state.pushers.borrow().get(&rid) {
          let _ = tx.send(Ok(chunk));
        }
        Ok(Value::Undefined)
      }
      "op_readable_close" => {
        state.pushers.borrow_mut().remove(&arg_ref(args, 0)?);
        Ok(Value::Undefined)
      }
      "op_readable_error" => {
        let rid = arg_ref(args, 0)?;
        let message = arg_str(args, 1).unwrap_or("stream errored").to_string();
        if let Some(tx) = state.pushers.borrow_mut().remove(&rid) {
          let _ = tx.send(Err(ErrorEnvelope::new(
            ErrorKind::UserError,
            "Error",
            message,
          )));
        }
        Ok(Value::Undefined)
      }

      "op_stream_get_reader" => {
        let slot = state.readable(arg_ref(args, 0)?)?;
        let mut readable = try_lock(&slot)?;
        readable.lock_reader()?;
        Ok(Value::Undefined)
      }
      "op_stream_release_reader" => {
        let slot = state.readable(arg_ref(args, 0)?)?;
        try_lock(&slot)?.release_reader();
        Ok(Value::Undefined)
      }
      "op_stream_cancel" => {
        let slot = state.readable(arg_ref(args, 0)?)?;
        let reason = arg_str(args, 1).ok().map(str::to_string);
        try_lock(&slot)?.cancel_via_stream(reason)?;
        Ok(Value::Undefined)
      }
      "op_stream_reader_cancel" => {
        let slot = state.readable(arg_ref(args, 0)?)?;
        let reason = arg_str(args, 1).ok().map(str::to_string);
        try_lock(&slot)?.cancel_via_reader(reason);
        Ok(Value::Undefined)
      }
      "op_stream_tee" => {
        let readable = state.take_readable(arg_ref(args, 0)?)?;
        let (a, b) = readable.tee()?;
        Ok(Value::Array(vec![
          Value::Number(state.insert_readable(a) as f64),
          Value::Number(state.insert_readable(b) as f64),
        ]))
      }
      "op_stream_identity" => {
        let readable = state.take_readable(arg_ref(args, 0)?)?;
        let piped = readable.pipe_through(None)?;
        Ok(Value::Number(state.insert_readable(piped) as f64))
      }
      "op_stream_to_ref" => {
        let rid = arg_ref(args, 0)?;
        Ok(Value::StreamRef(state.egress_readable(rid)?))
      }

      "op_test_register" => {
        if !state.capabilities.borrow().test_env {
          return Err(type_error("test environment is not enabled"));
        }
        register_test(state, args.first())
      }
      "op_test_reset" => {
        state.testenv.borrow_mut().reset();
        Ok(Value::Undefined)
      }

      other => Err(ErrorEnvelope::protocol(format!("unknown op {other:?}"))),
    }
  }
}

fn register_test(
  state: &Rc<OpState>,
  desc: Option<&Value>,
) -> Result<Value, ErrorEnvelope> {
  let obj = desc
    .and_then(Value::as_object)
    .ok_or_else(|| type_error("test registration requires a descriptor"))?;
  let kind = obj.get("kind").and_then(Value::as_str).unwrap_or("test");
  let suite_path: Vec<String> = obj
    .get("suitePath")
    .and_then(Value::as_array)
    .map(|parts| {
      parts
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect()
    })
    .unwrap_or_default();
  let callback = match obj.get("callback") {
    Some(Value::CallbackRef(cb)) => *cb,
    _ => return Err(type_error("test registration requires a callback")),
  };

  let mut testenv = state.testenv.borrow_mut();
  match kind {
    "test" => {
      let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("<anonymous>");
      let mode = match obj.get("mode").and_then(Value::as_str) {
        Some("skip") => TestMode::Skip,
        Some("todo") => TestMode::Todo,
        _ => TestMode::Normal,
      };
      testenv.register_test(name, suite_path, callback, mode);
    }
    "beforeAll" => {
      testenv.register_hook(HookKind::BeforeAll, suite_path, callback)
    }
    "beforeEach" => {
      testenv.register_hook(HookKind::BeforeEach, suite_path, callback)
    }
    "afterEach" => {
      testenv.register_hook(HookKind::AfterEach, suite_path, callback)
    }
    "afterAll" => {
      testenv.register_hook(HookKind::AfterAll, suite_path, callback)
    }
    other => {
      return Err(type_error(format!("unknown registration kind {other:?}")))
    }
  }
  Ok(Value::Undefined)
}

/// Receiver-backed stream for push-style readables.
fn tokio_stream_adapter(
  rx: mpsc::UnboundedReceiver<Result<Value, ErrorEnvelope>>,
) -> impl futures::Stream<Item = Result<Value, ErrorEnvelope>> + Send + Unpin {
  futures::stream::unfold(rx, |mut rx| async move {
    rx.recv().await.map(|item| (item, rx))
  })
  .boxed()
}

fn try_lock(
  slot: &ReadableSlot,
) -> Result<tokio::sync::MutexGuard<'_, Readable>, ErrorEnvelope> {
  slot
    .try_lock()
    .map_err(|_| type_error("stream is busy with a pending read"))
}

/// Sentinels in console arguments are sandbox-local ids; the host gets a
/// printable placeholder instead of a dangling handle.
fn sanitize_console_arg(value: Value) -> Value {
  match value {
    Value::StreamRef(_) | Value::IteratorRef(_) => {
      Value::String("[object ReadableStream]".to_string())
    }
    Value::CallbackRef(_) => Value::String("[Function]".to_string()),
    Value::Array(items) => {
      Value::Array(items.into_iter().map(sanitize_console_arg).collect())
    }
    Value::Object(entries) => Value::Object(
      entries
        .into_iter()
        .map(|(k, v)| (k, sanitize_console_arg(v)))
        .collect(),
    ),
    other => other,
  }
}

pub fn type_error(message: impl Into<String>) -> ErrorEnvelope {
  ErrorEnvelope::new(ErrorKind::UserError, "TypeError", message)
}

pub fn arg_str<'a>(
  args: &'a [Value],
  idx: usize,
) -> Result<&'a str, ErrorEnvelope> {
  args
    .get(idx)
    .and_then(Value::as_str)
    .ok_or_else(|| type_error(format!("op argument {idx} must be a string")))
}

pub fn arg_u64(args: &[Value], idx: usize) -> Result<u64, ErrorEnvelope> {
  args
    .get(idx)
    .and_then(Value::as_number)
    .map(|n| n as u64)
    .ok_or_else(|| type_error(format!("op argument {idx} must be a number")))
}

/// Accepts a raw handle number or a sentinel carrying one.
pub fn arg_ref(args: &[Value], idx: usize) -> Result<u64, ErrorEnvelope> {
  match args.get(idx) {
    Some(Value::StreamRef(h))
    | Some(Value::IteratorRef(h))
    | Some(Value::CallbackRef(h)) => Ok(*h),
    Some(Value::Number(n)) => Ok(*n as u64),
    _ => Err(type_error(format!("op argument {idx} must be a stream ref"))),
  }
}
