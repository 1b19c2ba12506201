// Copyright 2024-2026 the jsbox authors. MIT license.

//! The isolate worker: one dedicated thread per isolate running a
//! current-thread runtime, a single engine context, and the isolate's
//! module graph. Commands (eval, dispatch, dispose, rebind) arrive over a
//! channel and are processed strictly one at a time — that channel order
//! *is* the serialization of evaluations on an isolate.
//!
//! Between engine event-loop pumps the worker drains the op queue: bridge
//! round-trips run as local futures, timers arm in the timer queue, module
//! loads run inline against the graph. An eval completes when the engine
//! settles and every host callback it produced has been acknowledged.
//! Wall-clock enforcement is two-layered: a sleeping select arm for
//! cooperative code, and a watchdog thread firing the engine interrupt for
//! code that never yields.

use crate::bridge::Bridge;
use crate::ops::http;
use crate::ops::type_error;
use crate::ops::OpRouter;
use crate::ops::OpState;
use crate::ops::PendingOp;
use crate::streams::Readable;
use crate::testenv::TestMode;
use crate::testenv::TestReport;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use futures::StreamExt;
use jsbox_core::engine::CreateParams;
use jsbox_core::engine::InterruptHandle;
use jsbox_core::engine::JsContext;
use jsbox_core::engine::JsEngine;
use jsbox_core::engine::OpId;
use jsbox_core::engine::PendingCall;
use jsbox_core::engine::TerminateReason;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::error::ErrorKind;
use jsbox_core::modules::scan;
use jsbox_core::modules::ModuleGraph;
use jsbox_core::modules::ModuleLoader;
use jsbox_core::path_util;
use jsbox_core::protocol::CallBody;
use jsbox_core::protocol::Capabilities;
use jsbox_core::protocol::CreateRuntimeOptions;
use jsbox_core::protocol::EvalOptions;
use jsbox_core::protocol::HostCall;
use jsbox_core::protocol::Importer;
use jsbox_core::protocol::LoaderResult;
use jsbox_core::protocol::ReplyBody;
use jsbox_core::protocol::RequestSpec;
use jsbox_core::protocol::ResponseSpec;
use jsbox_core::value::Value;
use log::debug;
use log::warn;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

type OpFuture = futures::future::LocalBoxFuture<
  'static,
  (Option<OpId>, Result<Value, ErrorEnvelope>),
>;

type StartedOp =
  futures::future::LocalBoxFuture<'static, Result<Value, ErrorEnvelope>>;

pub enum Command {
  Eval {
    code: String,
    options: EvalOptions,
    reply: oneshot::Sender<Result<(), ErrorEnvelope>>,
  },
  Dispatch {
    request: RequestSpec,
    reply: oneshot::Sender<Result<ResponseSpec, ErrorEnvelope>>,
  },
  SoftDispose {
    reply: oneshot::Sender<()>,
  },
  Rebind {
    bridge: Bridge,
    capabilities: Capabilities,
    reply: oneshot::Sender<()>,
  },
  Shutdown {
    reply: oneshot::Sender<()>,
  },
}

/// Daemon-side handle to one isolate thread. Cloneable; all clones address
/// the same isolate.
#[derive(Clone)]
pub struct IsolateHandle {
  id: String,
  tx: mpsc::UnboundedSender<Command>,
  interrupt: Arc<dyn InterruptHandle>,
  errored: Arc<AtomicBool>,
}

impl IsolateHandle {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// True after an OOM: the isolate is permanently unusable.
  pub fn is_errored(&self) -> bool {
    self.errored.load(Ordering::Acquire)
  }

  pub async fn eval(
    &self,
    code: String,
    options: EvalOptions,
  ) -> Result<(), ErrorEnvelope> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Eval { code, options, reply })
      .map_err(|_| ErrorEnvelope::disposed())?;
    rx.await.map_err(|_| ErrorEnvelope::disposed())?
  }

  pub async fn dispatch(
    &self,
    request: RequestSpec,
  ) -> Result<ResponseSpec, ErrorEnvelope> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(Command::Dispatch { request, reply })
      .map_err(|_| ErrorEnvelope::disposed())?;
    rx.await.map_err(|_| ErrorEnvelope::disposed())?
  }

  pub async fn soft_dispose(&self) {
    let (reply, rx) = oneshot::channel();
    if self.tx.send(Command::SoftDispose { reply }).is_ok() {
      let _ = rx.await;
    }
  }

  pub async fn rebind(&self, bridge: Bridge, capabilities: Capabilities) {
    let (reply, rx) = oneshot::channel();
    if self
      .tx
      .send(Command::Rebind { bridge, capabilities, reply })
      .is_ok()
    {
      let _ = rx.await;
    }
  }

  /// Hard dispose: interrupts whatever is running, then stops the thread.
  /// In-flight calls reject with `Disposed`.
  pub fn shutdown(&self) {
    self.interrupt.terminate(TerminateReason::Disposed);
    let (reply, _rx) = oneshot::channel();
    let _ = self.tx.send(Command::Shutdown { reply });
  }
}

/// Spawns the isolate thread and waits for its context to come up.
pub async fn spawn_isolate(
  engine: Arc<dyn JsEngine>,
  runtime_id: String,
  options: CreateRuntimeOptions,
  bridge: Bridge,
) -> Result<IsolateHandle, ErrorEnvelope> {
  let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
  let (init_tx, init_rx) = oneshot::channel();

  let thread_id = runtime_id.clone();
  std::thread::Builder::new()
    .name(format!("jsbox-isolate-{thread_id}"))
    .spawn(move || {
      let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
      {
        Ok(rt) => rt,
        Err(err) => {
          let _ = init_tx.send(Err(ErrorEnvelope::internal(format!(
            "failed to start isolate runtime: {err}"
          ))));
          return;
        }
      };
      let local = tokio::task::LocalSet::new();
      rt.block_on(local.run_until(worker_main(
        engine, thread_id, options, bridge, cmd_rx, init_tx,
      )));
    })
    .map_err(|err| {
      ErrorEnvelope::internal(format!("failed to spawn isolate thread: {err}"))
    })?;

  let (interrupt, errored) = init_rx
    .await
    .map_err(|_| ErrorEnvelope::internal("isolate thread died during init"))??;
  Ok(IsolateHandle { id: runtime_id, tx: cmd_tx, interrupt, errored })
}

type InitResult =
  Result<(Arc<dyn InterruptHandle>, Arc<AtomicBool>), ErrorEnvelope>;

async fn worker_main(
  engine: Arc<dyn JsEngine>,
  runtime_id: String,
  options: CreateRuntimeOptions,
  bridge: Bridge,
  mut cmd_rx: mpsc::UnboundedReceiver<Command>,
  init_tx: oneshot::Sender<InitResult>,
) {
  let cwd = options.cwd.clone().unwrap_or_else(|| "/".to_string());
  let state = OpState::new(
    runtime_id.clone(),
    cwd.clone(),
    options.env.clone(),
    options.capabilities.clone(),
    bridge.clone(),
  );
  let router = Rc::new(OpRouter::new(state.clone()));

  let params = CreateParams {
    heap_limit_bytes: options
      .memory_limit_mb
      .map(|mb| mb as usize * 1024 * 1024),
  };
  let ctx = match engine.new_context(params, router) {
    Ok(ctx) => ctx,
    Err(env) => {
      let _ = init_tx.send(Err(env));
      return;
    }
  };
  let interrupt = ctx.interrupt_handle();
  let errored = Arc::new(AtomicBool::new(false));
  if init_tx.send(Ok((interrupt.clone(), errored.clone()))).is_err() {
    return;
  }

  let mut graph = ModuleGraph::new();
  if options.capabilities.module_loader {
    graph.set_loader(Some(Rc::new(BridgeLoader {
      bridge: bridge.clone(),
      runtime_id: runtime_id.clone(),
    })));
  }

  let mut worker = Worker {
    runtime_id,
    ctx,
    graph,
    state,
    inflight: FuturesUnordered::new(),
    module_ops: VecDeque::new(),
    test_runs: VecDeque::new(),
    entry_importer: Importer {
      path: format!("{}/<anonymous>", if cwd == "/" { "" } else { cwd.as_str() }),
      resolve_dir: cwd,
    },
    default_max_ms: options.max_execution_ms,
    deadline: None,
    interrupt,
    errored,
  };

  loop {
    let maybe_cmd = tokio::select! {
      maybe_cmd = cmd_rx.recv() => maybe_cmd,
      _ = worker.background_tick() => continue,
    };
    let Some(cmd) = maybe_cmd else { break };
    match cmd {
      Command::Eval { code, options, reply } => {
        let result = worker.eval(code, options).await;
        let _ = reply.send(result);
      }
      Command::Dispatch { request, reply } => {
        let result = worker.dispatch(request).await;
        let _ = reply.send(result);
      }
      Command::SoftDispose { reply } => {
        worker.soft_dispose();
        let _ = reply.send(());
      }
      Command::Rebind { bridge, capabilities, reply } => {
        worker.rebind(bridge, capabilities);
        let _ = reply.send(());
      }
      Command::Shutdown { reply } => {
        let _ = reply.send(());
        break;
      }
    }
  }
  debug!("isolate {} stopped", worker.runtime_id);
}

enum ModuleOp {
  Require { specifier: String, referrer: Option<String> },
  Import { specifier: String, referrer: Option<String> },
}

#[derive(Clone, Copy)]
enum PumpGoal {
  Quiescent,
  Call(PendingCall),
}

enum Wakeup {
  Notified,
  OpDone(Option<OpId>, Result<Value, ErrorEnvelope>),
  TimerDue,
  DeadlineHit,
}

struct Worker {
  runtime_id: String,
  ctx: Box<dyn JsContext>,
  graph: ModuleGraph,
  state: Rc<OpState>,
  inflight: FuturesUnordered<OpFuture>,
  module_ops: VecDeque<(OpId, ModuleOp)>,
  test_runs: VecDeque<(OpId, Option<u64>)>,
  entry_importer: Importer,
  default_max_ms: Option<u64>,
  deadline: Option<Instant>,
  interrupt: Arc<dyn InterruptHandle>,
  errored: Arc<AtomicBool>,
}

impl Worker {
  async fn eval(
    &mut self,
    code: String,
    options: EvalOptions,
  ) -> Result<(), ErrorEnvelope> {
    let result = self.eval_inner(code, options).await;
    self.deadline = None;
    result
  }

  async fn eval_inner(
    &mut self,
    code: String,
    options: EvalOptions,
  ) -> Result<(), ErrorEnvelope> {
    if self.errored.load(Ordering::Acquire) {
      return Err(ErrorEnvelope::out_of_memory());
    }

    let filename = path_util::to_absolute(
      options.filename.as_deref().unwrap_or("<anonymous>"),
      &self.state.cwd,
    );
    self.entry_importer = Importer {
      path: filename.clone(),
      resolve_dir: path_util::dirname(&filename),
    };
    let max_ms = options.max_execution_ms.or(self.default_max_ms);
    self.deadline = max_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let _watchdog = Watchdog::arm(self.deadline, self.interrupt.clone());

    let info = scan::parse(&code);
    let started: Result<(), ErrorEnvelope> = if info.has_module_syntax() {
      let deadline = self.deadline;
      let load = {
        let graph = &mut self.graph;
        with_deadline(deadline, graph.load_entry(&code, &filename)).await
      };
      match load {
        Ok(Ok(entry)) => {
          let graph = &mut self.graph;
          graph.ensure_evaluated(&mut *self.ctx, entry)
        }
        Ok(Err(env)) => Err(env),
        Err(timeout) => Err(timeout),
      }
    } else {
      self.ctx.execute_script(&filename, &code).map_err(Into::into)
    };

    if let Some(reason) = self.ctx.terminated() {
      self.cancel_in_flight();
      return Err(self.classify(reason));
    }
    started?;

    self.pump(PumpGoal::Quiescent).await.map(|_| ())
  }

  async fn dispatch(
    &mut self,
    request: RequestSpec,
  ) -> Result<ResponseSpec, ErrorEnvelope> {
    let result = self.dispatch_inner(request).await;
    self.deadline = None;
    result
  }

  async fn dispatch_inner(
    &mut self,
    request: RequestSpec,
  ) -> Result<ResponseSpec, ErrorEnvelope> {
    if self.errored.load(Ordering::Acquire) {
      return Err(ErrorEnvelope::out_of_memory());
    }
    let Some(handler) = self.state.serve_handler.get() else {
      return Err(ErrorEnvelope::internal(
        "no fetch handler registered via serve()",
      ));
    };

    let body_rid = request.body.map(|handle| {
      let remote = self.state.bridge.borrow().streams().open_sink(handle);
      self.state.insert_readable(Readable::new(Box::pin(remote)))
    });
    let value = http::request_to_value(&request, body_rid);

    self.deadline = self
      .default_max_ms
      .map(|ms| Instant::now() + Duration::from_millis(ms));
    let _watchdog = Watchdog::arm(self.deadline, self.interrupt.clone());

    let call = self
      .ctx
      .call_function(handler, vec![value])
      .map_err(ErrorEnvelope::from)?;
    let value = self
      .pump(PumpGoal::Call(call))
      .await?
      .ok_or_else(ErrorEnvelope::no_response)?;

    let (mut spec, body_rid) = http::value_to_response_parts(&value)?;
    spec.body = match body_rid {
      Some(rid) => Some(self.state.egress_readable(rid)?),
      None => None,
    };
    Ok(spec)
  }

  fn soft_dispose(&mut self) {
    let cancelled = self.state.reset_ephemeral();
    for op in cancelled {
      self.ctx.resolve_op(op, Ok(Value::Bool(false)));
    }
  }

  fn rebind(&mut self, bridge: Bridge, capabilities: Capabilities) {
    let module_loader = capabilities.module_loader;
    self.state.rebind(bridge.clone(), capabilities);
    self.graph.set_loader(module_loader.then(|| {
      Rc::new(BridgeLoader {
        bridge,
        runtime_id: self.runtime_id.clone(),
      }) as Rc<dyn ModuleLoader>
    }));
  }

  /// One background step while no command is being served: timers fire,
  /// late op replies resolve, the engine gets pumped.
  async fn background_tick(&mut self) {
    self.drain_sync_queues();
    let timer_deadline = self.state.timers.borrow().next_deadline();
    let wakeup = self.wait_for_wakeup(timer_deadline, None).await;
    self.apply_wakeup(wakeup);
    let _ = self.pump(PumpGoal::Quiescent).await;
  }

  async fn wait_for_wakeup(
    &mut self,
    timer_deadline: Option<Instant>,
    eval_deadline: Option<Instant>,
  ) -> Wakeup {
    let notify = self.state.notify.clone();
    let inflight = &mut self.inflight;
    tokio::select! {
      biased;
      _ = notify.notified() => Wakeup::Notified,
      Some((op, result)) = inflight.next() => Wakeup::OpDone(op, result),
      _ = sleep_until_instant(timer_deadline), if timer_deadline.is_some() => {
        Wakeup::TimerDue
      }
      _ = sleep_until_instant(eval_deadline), if eval_deadline.is_some() => {
        Wakeup::DeadlineHit
      }
    }
  }

  fn apply_wakeup(&mut self, wakeup: Wakeup) {
    match wakeup {
      Wakeup::Notified => {}
      Wakeup::OpDone(op, result) => {
        if let Some(op) = op {
          self.ctx.resolve_op(op, result);
        }
      }
      Wakeup::TimerDue => self.fire_due_timers(),
      Wakeup::DeadlineHit => {
        self.interrupt.terminate(TerminateReason::Timeout);
        // Disarm so this branch cannot spin; the next poll observes the
        // termination.
        self.deadline = None;
      }
    }
  }

  /// Drives the engine until the goal is reached. `Quiescent` means the
  /// event loop settled and every host callback was acknowledged; `Call`
  /// additionally waits for one sandbox function invocation to produce its
  /// result.
  async fn pump(
    &mut self,
    goal: PumpGoal,
  ) -> Result<Option<Value>, ErrorEnvelope> {
    loop {
      self.drain_sync_queues();

      if let Some((op, module_op)) = self.module_ops.pop_front() {
        let result = self.run_module_op(module_op).await;
        self.ctx.resolve_op(op, result);
        continue;
      }
      if let Some((op, timeout_ms)) = self.test_runs.pop_front() {
        let result = self.run_tests(timeout_ms).await;
        self.ctx.resolve_op(op, result);
        continue;
      }

      let polled = futures::future::poll_fn(|cx| {
        Poll::Ready(self.ctx.poll_event_loop(cx))
      })
      .await;

      if let Some(reason) = self.ctx.terminated() {
        self.cancel_in_flight();
        return Err(self.classify(reason));
      }
      if let Poll::Ready(Err(js_err)) = polled {
        return Err(js_err.into());
      }

      if let PumpGoal::Call(call) = goal {
        if let Some(result) = self.ctx.take_call_result(call) {
          return result.map(Some).map_err(Into::into);
        }
      }

      let no_work = self.inflight.is_empty()
        && self.module_ops.is_empty()
        && self.test_runs.is_empty()
        && self.state.pending.borrow().is_empty()
        && self.state.console_outbox.borrow().is_empty()
        && self.state.cancelled_ops.borrow().is_empty();
      let timers_armed = !self.state.timers.borrow().is_empty();

      if no_work {
        match (polled, goal) {
          // Settled, acknowledged: an eval is complete even with timers
          // still armed for later.
          (Poll::Ready(Ok(())), PumpGoal::Quiescent) => return Ok(None),
          (Poll::Pending, PumpGoal::Quiescent) if !timers_armed => {
            // Unresolvable promises with nothing in flight: the engine
            // can never wake again.
            return Ok(None);
          }
          (Poll::Ready(Ok(())), PumpGoal::Call(_)) if !timers_armed => {
            return Err(ErrorEnvelope::internal(
              "sandbox call settled without a result",
            ));
          }
          (Poll::Pending, PumpGoal::Call(_)) if !timers_armed => {
            return Err(ErrorEnvelope::internal(
              "sandbox call can never settle",
            ));
          }
          _ => {}
        }
      }

      let timer_deadline = self.state.timers.borrow().next_deadline();
      let eval_deadline = self.deadline;
      let wakeup = self.wait_for_wakeup(timer_deadline, eval_deadline).await;
      self.apply_wakeup(wakeup);
    }
  }

  fn fire_due_timers(&mut self) {
    let due = self.state.timers.borrow_mut().fire_due(Instant::now());
    for op in due {
      self.ctx.resolve_op(op, Ok(Value::Bool(true)));
    }
  }

  /// Moves queued sync work into runnable form: cancelled timers resolve,
  /// console entries ship in order, async ops become futures or inline
  /// queue entries.
  fn drain_sync_queues(&mut self) {
    let cancelled: Vec<OpId> =
      self.state.cancelled_ops.borrow_mut().drain(..).collect();
    for op in cancelled {
      self.ctx.resolve_op(op, Ok(Value::Bool(false)));
    }

    loop {
      let entry = self.state.console_outbox.borrow_mut().pop_front();
      let Some(entry) = entry else { break };
      let bridge = self.state.bridge.borrow().clone();
      // `call_started` puts the frame on the wire now, preserving source
      // order; the future only tracks the acknowledgement.
      let fut = bridge.call_started(CallBody::Host(HostCall::ConsoleEntry {
        runtime_id: self.runtime_id.clone(),
        entry,
      }));
      self.inflight.push(
        async move {
          let result = fut.await.map(|_| Value::Undefined);
          (None, result)
        }
        .boxed_local(),
      );
    }

    let mut resolutions: Vec<(OpId, Result<Value, ErrorEnvelope>)> =
      Vec::new();
    loop {
      let pending = self.state.pending.borrow_mut().pop_front();
      let Some(PendingOp { op, request }) = pending else { break };
      match request.name.as_str() {
        "op_timer_start" => {
          let parsed = crate::ops::arg_u64(&request.args, 0).and_then(
            |timer_id| {
              crate::ops::arg_u64(&request.args, 1)
                .map(|delay| (timer_id, delay))
            },
          );
          match parsed {
            Ok((timer_id, delay_ms)) => self.state.timers.borrow_mut().start(
              timer_id,
              Duration::from_millis(delay_ms),
              op,
            ),
            Err(env) => resolutions.push((op, Err(env))),
          }
        }
        "op_require" | "op_import" => {
          let specifier = match crate::ops::arg_str(&request.args, 0) {
            Ok(s) => s.to_string(),
            Err(env) => {
              resolutions.push((op, Err(env)));
              continue;
            }
          };
          let referrer = crate::ops::arg_str(&request.args, 1)
            .ok()
            .map(str::to_string);
          let module_op = if request.name == "op_require" {
            ModuleOp::Require { specifier, referrer }
          } else {
            ModuleOp::Import { specifier, referrer }
          };
          self.module_ops.push_back((op, module_op));
        }
        "op_test_run" => {
          let timeout_ms = crate::ops::arg_u64(&request.args, 0).ok();
          self.test_runs.push_back((op, timeout_ms));
        }
        "op_fetch" => match self.start_fetch(&request.args) {
          Ok(fut) => self.inflight.push(wrap_op(op, fut)),
          Err(env) => resolutions.push((op, Err(env))),
        },
        "op_custom_call" => match self.start_custom_call(&request.args) {
          Ok(fut) => self.inflight.push(wrap_op(op, fut)),
          Err(env) => resolutions.push((op, Err(env))),
        },
        "op_fs" => match self.start_fs(&request.args) {
          Ok(fut) => self.inflight.push(wrap_op(op, fut)),
          Err(env) => resolutions.push((op, Err(env))),
        },
        "op_playwright" => match self.start_playwright(&request.args) {
          Ok(fut) => self.inflight.push(wrap_op(op, fut)),
          Err(env) => resolutions.push((op, Err(env))),
        },
        "op_stream_read" => match self.start_stream_read(&request.args) {
          Ok(fut) => self.inflight.push(wrap_op(op, fut)),
          Err(env) => resolutions.push((op, Err(env))),
        },
        other => {
          warn!("unknown async op {other:?}");
          resolutions.push((
            op,
            Err(ErrorEnvelope::protocol(format!("unknown op {other:?}"))),
          ));
        }
      }
    }
    for (op, result) in resolutions {
      self.ctx.resolve_op(op, result);
    }
  }

  fn start_fetch(&self, args: &[Value]) -> Result<StartedOp, ErrorEnvelope> {
    if !self.state.capabilities.borrow().fetch {
      return Err(type_error("fetch is not available in this isolate"));
    }
    let request_value = args
      .first()
      .ok_or_else(|| type_error("fetch requires a request"))?;
    let (mut spec, body_rid) = http::value_to_request_parts(request_value)?;
    if let Some(rid) = body_rid {
      spec.body = Some(self.state.egress_readable(rid)?);
    }
    let bridge = self.state.bridge.borrow().clone();
    let state = self.state.clone();
    let fut = bridge.call_started(CallBody::Host(HostCall::Fetch {
      runtime_id: self.runtime_id.clone(),
      request: spec,
    }));
    Ok(
      async move {
        match fut.await? {
          ReplyBody::Response(spec) => {
            let body_rid = spec.body.map(|handle| {
              let remote = state.bridge.borrow().streams().open_sink(handle);
              state.insert_readable(Readable::new(Box::pin(remote)))
            });
            Ok(http::response_to_value(&spec, body_rid))
          }
          _ => Err(ErrorEnvelope::internal(
            "fetch callback returned a non-response",
          )),
        }
      }
      .boxed_local(),
    )
  }

  fn start_custom_call(
    &self,
    args: &[Value],
  ) -> Result<StartedOp, ErrorEnvelope> {
    let name = crate::ops::arg_str(args, 0)?.to_string();
    if !self.state.custom_modes.borrow().contains_key(&name) {
      return Err(type_error(format!("{name} is not a function")));
    }
    let mut call_args = Vec::new();
    for arg in args.get(1..).unwrap_or(&[]) {
      call_args.push(self.state.egress_value(arg.clone())?);
    }
    let bridge = self.state.bridge.borrow().clone();
    let state = self.state.clone();
    let fut = bridge.call_started(CallBody::Host(HostCall::CustomFn {
      runtime_id: self.runtime_id.clone(),
      name,
      args: call_args,
    }));
    Ok(
      async move {
        match fut.await? {
          ReplyBody::Value(value) => Ok(state.ingress_value(value)),
          ReplyBody::Unit => Ok(Value::Undefined),
          _ => Err(ErrorEnvelope::internal(
            "custom function returned a malformed reply",
          )),
        }
      }
      .boxed_local(),
    )
  }

  fn start_fs(&self, args: &[Value]) -> Result<StartedOp, ErrorEnvelope> {
    if !self.state.capabilities.borrow().fs {
      return Err(type_error("fs is not available in this isolate"));
    }
    let op = parse_fs_op(args.first())?;
    let bridge = self.state.bridge.borrow().clone();
    let fut = bridge.call_started(CallBody::Host(HostCall::Fs {
      runtime_id: self.runtime_id.clone(),
      op,
    }));
    Ok(
      async move {
        match fut.await? {
          ReplyBody::Value(value) => Ok(value),
          ReplyBody::Unit => Ok(Value::Undefined),
          _ => Err(ErrorEnvelope::internal(
            "fs callback returned a malformed reply",
          )),
        }
      }
      .boxed_local(),
    )
  }

  fn start_playwright(
    &self,
    args: &[Value],
  ) -> Result<StartedOp, ErrorEnvelope> {
    if !self.state.capabilities.borrow().playwright {
      return Err(type_error("playwright is not available in this isolate"));
    }
    let payload = self
      .state
      .egress_value(args.first().cloned().unwrap_or(Value::Undefined))?;
    let bridge = self.state.bridge.borrow().clone();
    let state = self.state.clone();
    let fut = bridge.call_started(CallBody::Host(HostCall::Playwright {
      runtime_id: self.runtime_id.clone(),
      payload,
    }));
    Ok(
      async move {
        match fut.await? {
          ReplyBody::Value(value) => Ok(state.ingress_value(value)),
          ReplyBody::Unit => Ok(Value::Undefined),
          _ => Err(ErrorEnvelope::internal(
            "playwright callback returned a malformed reply",
          )),
        }
      }
      .boxed_local(),
    )
  }

  fn start_stream_read(
    &self,
    args: &[Value],
  ) -> Result<StartedOp, ErrorEnvelope> {
    let rid = crate::ops::arg_ref(args, 0)?;
    let slot = self.state.readable(rid)?;
    Ok(
      async move {
        let mut readable = slot.lock().await;
        match readable.read().await {
          Some(Ok(chunk)) => Ok(Value::object([
            ("value".to_string(), chunk),
            ("done".to_string(), Value::Bool(false)),
          ])),
          Some(Err(env)) => Err(env),
          None => {
            Ok(Value::object([("done".to_string(), Value::Bool(true))]))
          }
        }
      }
      .boxed_local(),
    )
  }

  async fn run_module_op(
    &mut self,
    module_op: ModuleOp,
  ) -> Result<Value, ErrorEnvelope> {
    let (specifier, referrer, is_import) = match module_op {
      ModuleOp::Require { specifier, referrer } => {
        (specifier, referrer, false)
      }
      ModuleOp::Import { specifier, referrer } => (specifier, referrer, true),
    };
    let importer = referrer
      .and_then(|path| {
        self.graph.lookup(&path).map(|id| self.graph.record(id).importer())
      })
      .unwrap_or_else(|| self.entry_importer.clone());

    let deadline = self.deadline;
    let result = {
      let graph = &mut self.graph;
      let ctx = &mut *self.ctx;
      let fut = async {
        if is_import {
          graph.dynamic_import(ctx, &specifier, &importer).await
        } else {
          graph.require(ctx, &specifier, &importer).await
        }
      };
      with_deadline(deadline, fut).await
    };
    match result {
      Ok(inner) => inner,
      Err(timeout) => {
        self.interrupt.terminate(TerminateReason::Timeout);
        Err(timeout)
      }
    }
  }

  async fn run_tests(
    &mut self,
    timeout_ms: Option<u64>,
  ) -> Result<Value, ErrorEnvelope> {
    let plans = self.state.testenv.borrow().plan();
    let run_deadline =
      timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let mut report = TestReport::default();

    for plan in plans {
      if matches!(plan.mode, TestMode::Skip | TestMode::Todo) {
        report.record(&plan.name, plan.mode, None);
        continue;
      }
      if deadline_passed(run_deadline) {
        return Err(ErrorEnvelope::timeout());
      }

      let mut failure = None;
      for hook in &plan.before {
        if let Err(env) = self.invoke(*hook, run_deadline).await {
          failure = Some(env);
          break;
        }
      }
      if failure.is_none() {
        failure = self.invoke(plan.callback, run_deadline).await.err();
      }
      for hook in &plan.after {
        if let Err(env) = self.invoke(*hook, run_deadline).await {
          failure.get_or_insert(env);
        }
      }
      if let Some(env) = &failure {
        if env.kind == ErrorKind::Timeout {
          return Err(env.clone());
        }
      }
      report.record(
        &plan.name,
        TestMode::Normal,
        Some(match failure {
          None => Ok(()),
          Some(env) => Err(env),
        }),
      );
    }
    Ok(report.to_value())
  }

  async fn invoke(
    &mut self,
    callback: u64,
    run_deadline: Option<Instant>,
  ) -> Result<Value, ErrorEnvelope> {
    if deadline_passed(run_deadline) {
      return Err(ErrorEnvelope::timeout());
    }
    let call = self
      .ctx
      .call_function(callback, Vec::new())
      .map_err(ErrorEnvelope::from)?;
    let fut = Box::pin(self.pump(PumpGoal::Call(call)));
    let result = match run_deadline {
      Some(at) => match tokio::time::timeout_at(at.into(), fut).await {
        Ok(result) => result,
        Err(_) => return Err(ErrorEnvelope::timeout()),
      },
      None => fut.await,
    };
    result.map(|v| v.unwrap_or(Value::Undefined))
  }

  fn classify(&self, reason: TerminateReason) -> ErrorEnvelope {
    match reason {
      TerminateReason::Timeout => ErrorEnvelope::timeout(),
      TerminateReason::OutOfMemory => {
        self.errored.store(true, Ordering::Release);
        ErrorEnvelope::out_of_memory()
      }
      TerminateReason::Disposed => ErrorEnvelope::disposed(),
    }
  }

  /// Timeout/termination drains pending host callbacks as cancelled:
  /// results are dropped, promises never observed again.
  fn cancel_in_flight(&mut self) {
    self.inflight.clear();
    self.module_ops.clear();
    self.test_runs.clear();
    self.state.pending.borrow_mut().clear();
  }
}

fn wrap_op(op: OpId, fut: StartedOp) -> OpFuture {
  async move { (Some(op), fut.await) }.boxed_local()
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
  deadline.is_some_and(|at| Instant::now() >= at)
}

async fn sleep_until_instant(deadline: Option<Instant>) {
  match deadline {
    Some(at) => tokio::time::sleep_until(at.into()).await,
    None => std::future::pending().await,
  }
}

/// Bounds a future by the current eval deadline. The outer error is the
/// timeout; the inner result is the future's own.
async fn with_deadline<T>(
  deadline: Option<Instant>,
  fut: impl std::future::Future<Output = Result<T, ErrorEnvelope>>,
) -> Result<Result<T, ErrorEnvelope>, ErrorEnvelope> {
  match deadline {
    Some(at) => match tokio::time::timeout_at(at.into(), fut).await {
      Ok(result) => Ok(result),
      Err(_) => Err(ErrorEnvelope::timeout()),
    },
    None => Ok(fut.await),
  }
}

fn parse_fs_op(
  value: Option<&Value>,
) -> Result<jsbox_core::protocol::FsOp, ErrorEnvelope> {
  use jsbox_core::protocol::FsOp;
  let obj = value
    .and_then(Value::as_object)
    .ok_or_else(|| type_error("fs op requires a descriptor"))?;
  let op = obj
    .get("op")
    .and_then(Value::as_str)
    .ok_or_else(|| type_error("fs op requires an op name"))?;
  let path = || -> Result<String, ErrorEnvelope> {
    Ok(
      obj
        .get("path")
        .and_then(Value::as_str)
        .ok_or_else(|| type_error("fs op requires a path"))?
        .to_string(),
    )
  };
  match op {
    "readFile" => Ok(FsOp::ReadFile { path: path()? }),
    "writeFile" => {
      let data = match obj.get("data") {
        Some(Value::Bytes(buf)) => buf.clone(),
        Some(Value::String(s)) => s.clone().into_bytes(),
        _ => return Err(type_error("writeFile requires data")),
      };
      Ok(FsOp::WriteFile {
        path: path()?,
        data: serde_bytes::ByteBuf::from(data),
      })
    }
    "unlink" => Ok(FsOp::Unlink { path: path()? }),
    "readdir" => Ok(FsOp::Readdir { path: path()? }),
    "mkdir" => Ok(FsOp::Mkdir { path: path()? }),
    "rmdir" => Ok(FsOp::Rmdir { path: path()? }),
    "stat" => Ok(FsOp::Stat { path: path()? }),
    other => Err(type_error(format!("unknown fs op {other:?}"))),
  }
}

/// Host loader proxied over the bridge.
struct BridgeLoader {
  bridge: Bridge,
  runtime_id: String,
}

impl ModuleLoader for BridgeLoader {
  fn load(
    &self,
    specifier: &str,
    importer: &Importer,
  ) -> futures::future::LocalBoxFuture<
    'static,
    Result<LoaderResult, ErrorEnvelope>,
  > {
    let fut = self.bridge.call_started(CallBody::Host(HostCall::ModuleLoad {
      runtime_id: self.runtime_id.clone(),
      specifier: specifier.to_string(),
      importer: importer.clone(),
    }));
    Box::pin(async move {
      match fut.await? {
        ReplyBody::ModuleSource(loaded) => Ok(loaded),
        _ => Err(ErrorEnvelope::internal(
          "module loader returned a malformed reply",
        )),
      }
    })
  }
}

/// Fires the engine interrupt if a wall-clock deadline elapses while the
/// isolate thread is stuck in non-cooperative code. Disarmed on drop.
struct Watchdog {
  cancel: Option<std::sync::mpsc::Sender<()>>,
}

impl Watchdog {
  fn arm(
    deadline: Option<Instant>,
    interrupt: Arc<dyn InterruptHandle>,
  ) -> Watchdog {
    let Some(deadline) = deadline else {
      return Watchdog { cancel: None };
    };
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::Builder::new()
      .name("jsbox-watchdog".to_string())
      .spawn(move || {
        let wait = deadline.saturating_duration_since(Instant::now());
        if rx.recv_timeout(wait).is_err() {
          interrupt.terminate(TerminateReason::Timeout);
        }
      })
      .ok();
    Watchdog { cancel: Some(tx) }
  }
}

impl Drop for Watchdog {
  fn drop(&mut self) {
    if let Some(cancel) = self.cancel.take() {
      let _ = cancel.send(());
    }
  }
}
