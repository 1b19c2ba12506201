// Copyright 2024-2026 the jsbox authors. MIT license.

//! The embedding interface of the JavaScript engine collaborator.
//!
//! The daemon never links an engine directly; it drives one through these
//! traits. A production deployment supplies a V8-backed implementation; the
//! `jsbox_testing` crate supplies a scriptable one. The surface is the
//! classic embedder split:
//!
//! - script execution plus an event loop that is *polled* by the isolate
//!   worker (`poll_event_loop`), so the worker can interleave module loads,
//!   op completions and timer fires between pumps;
//! - a module surface keyed by opaque [`EngineModule`] handles
//!   (`module_new` / `module_instantiate` / `module_evaluate` /
//!   `module_namespace`), with synthetic modules for CommonJS facades and
//!   built-ins;
//! - op dispatch: sandbox-visible functions installed by the runtime call
//!   out through a single [`OpHandler`]; async ops park the calling promise
//!   until [`JsContext::resolve_op`] delivers the result;
//! - an [`InterruptHandle`] usable from any thread to terminate execution
//!   (wall-clock timeout, memory breach, dispose).

use crate::error::ErrorEnvelope;
use crate::error::JsError;
use crate::modules::scan::ModuleInfo;
use crate::value::Value;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

/// Engine-side module handle. Stable for the life of the context; the module
/// graph maps its own record ids onto these.
pub type EngineModule = u32;

/// Identifier of a pending async op, allocated by the [`OpHandler`].
pub type OpId = u64;

/// Identifier of an in-flight sandbox function invocation started with
/// [`JsContext::call_function`].
pub type PendingCall = u64;

#[derive(Clone, Copy, Debug, Default)]
pub struct CreateParams {
  /// Heap cap in bytes. Breach must terminate execution with
  /// [`TerminateReason::OutOfMemory`] rather than abort the process.
  pub heap_limit_bytes: Option<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminateReason {
  Timeout,
  OutOfMemory,
  Disposed,
}

/// Thread-safe handle that interrupts the context's execution at the next
/// safe point.
pub trait InterruptHandle: Send + Sync {
  fn terminate(&self, reason: TerminateReason);
}

/// A sandbox-originated call into the embedder.
#[derive(Clone, Debug, PartialEq)]
pub struct OpRequest {
  pub name: String,
  pub args: Vec<Value>,
}

pub enum OpOutcome {
  /// Completed synchronously; the sandbox observes a plain return value
  /// (or a thrown exception rehydrated from the envelope).
  Sync(Result<Value, ErrorEnvelope>),
  /// Parked: the embedder will call [`JsContext::resolve_op`] with this id.
  /// The sandbox observes a promise.
  Pending(OpId),
}

/// Receiver for sandbox ops, installed at context creation. Implementations
/// allocate the [`OpId`] for pending ops and queue the work; the isolate
/// worker completes it between event-loop pumps.
pub trait OpHandler {
  fn dispatch(&self, req: OpRequest) -> OpOutcome;
}

/// Factory for execution contexts. Shared by the daemon across isolate
/// threads; `new_context` itself runs on the isolate's own thread and the
/// returned context never leaves it.
pub trait JsEngine: Send + Sync {
  fn new_context(
    &self,
    params: CreateParams,
    ops: Rc<dyn OpHandler>,
  ) -> Result<Box<dyn JsContext>, ErrorEnvelope>;
}

/// One JavaScript execution context: a heap, a global object, a microtask
/// queue and a module table. Not `Send`; owned by a single isolate worker.
pub trait JsContext {
  /// Compiles and runs a classic script. Synchronous throw (including parse
  /// failure) is the `Err` case; asynchronous completion flows through
  /// [`JsContext::poll_event_loop`].
  fn execute_script(
    &mut self,
    filename: &str,
    source: &str,
  ) -> Result<(), JsError>;

  /// Pumps microtasks, delivers resolved ops and settled promises. Ready
  /// once no further progress can be made without embedder input;
  /// `Ready(Err)` reports an uncaught exception or unhandled rejection.
  fn poll_event_loop(
    &mut self,
    cx: &mut Context<'_>,
  ) -> Poll<Result<(), JsError>>;

  /// True while promises or pending ops keep the context from quiescing.
  fn has_pending_work(&self) -> bool;

  /// Delivers the result of a pending op; the parked promise settles on the
  /// next pump. Unknown ids are ignored (the op may have been dropped by a
  /// terminate).
  fn resolve_op(&mut self, op: OpId, result: Result<Value, ErrorEnvelope>);

  /// Registers an ES module. `info` carries the import/export descriptors
  /// the module graph already extracted; engines that parse for themselves
  /// may ignore it.
  fn module_new(
    &mut self,
    main: bool,
    name: &str,
    source: &str,
    info: &ModuleInfo,
  ) -> Result<EngineModule, JsError>;

  /// Registers a module whose namespace is the given object: CommonJS
  /// facades and built-in fallbacks.
  fn module_synthetic(
    &mut self,
    name: &str,
    exports: Value,
  ) -> Result<EngineModule, JsError>;

  /// Links `root` and its transitive imports. `resolve` maps
  /// `(referrer, specifier)` to an already-registered module; `None` is a
  /// linking error surfaced as the returned `JsError`.
  fn module_instantiate(
    &mut self,
    root: EngineModule,
    resolve: &mut dyn FnMut(EngineModule, &str) -> Option<EngineModule>,
  ) -> Result<(), JsError>;

  /// Runs module bodies in dependency order. Top-level await keeps the
  /// graph pending; completion is observed through the event loop.
  fn module_evaluate(&mut self, root: EngineModule) -> Result<(), JsError>;

  /// Snapshot of a module's namespace object.
  fn module_namespace(
    &mut self,
    module: EngineModule,
  ) -> Result<Value, JsError>;

  /// Evaluates a CommonJS body with a synthetic scope (`require`, `module`,
  /// `exports`, `__exportStar`, `__filename`, `__dirname`). Returns the
  /// final `module.exports` value. Dependencies are pre-evaluated by the
  /// module graph, so `scope.require` never re-enters the context.
  fn evaluate_cjs(
    &mut self,
    filename: &str,
    source: &str,
    scope: &mut dyn CommonJsScope,
  ) -> Result<Value, JsError>;

  /// Invokes a sandbox function held in the context's callback table (e.g.
  /// the handler registered through `serve`). Completion is asynchronous:
  /// poll the event loop, then collect with `take_call_result`.
  fn call_function(
    &mut self,
    callback: u64,
    args: Vec<Value>,
  ) -> Result<PendingCall, JsError>;

  fn take_call_result(
    &mut self,
    call: PendingCall,
  ) -> Option<Result<Value, JsError>>;

  fn set_global(&mut self, name: &str, value: Value);

  fn get_global(&mut self, name: &str) -> Value;

  /// Usable from any thread; survives the context.
  fn interrupt_handle(&self) -> Arc<dyn InterruptHandle>;

  fn heap_used(&self) -> usize;

  /// Reason of the last interrupt-driven termination, if any. The worker
  /// consults this to classify the resulting execution error.
  fn terminated(&self) -> Option<TerminateReason>;
}

/// Scope services for one CommonJS evaluation, provided by the module graph.
pub trait CommonJsScope {
  fn filename(&self) -> &str;
  fn dirname(&self) -> &str;
  /// Cache-backed require. The target module is already evaluated (or is a
  /// cycle back-edge, in which case its partial exports are returned).
  fn require(&mut self, specifier: &str) -> Result<Value, ErrorEnvelope>;
}
