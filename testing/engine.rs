// Copyright 2024-2026 the jsbox authors. MIT license.

//! A scriptable engine: sources are not parsed as JavaScript — tests
//! register a [`Step`] program per source string, and the context
//! interprets it. Ops dispatch through the real [`OpHandler`], async ops
//! genuinely park and resume on `resolve_op`, the interrupt handle
//! genuinely terminates a busy loop, so the worker machinery around the
//! engine is exercised for real.
//!
//! Unregistered sources fall back to pattern interpretation: ES modules
//! contribute their scanned exports (string/number literal initializers
//! are evaluated), CommonJS bodies honor `__exportStar(require("…"),
//! exports)` chains. That covers most fixtures without writing a program.

use jsbox_core::engine::CommonJsScope;
use jsbox_core::engine::CreateParams;
use jsbox_core::engine::EngineModule;
use jsbox_core::engine::InterruptHandle;
use jsbox_core::engine::JsContext;
use jsbox_core::engine::JsEngine;
use jsbox_core::engine::OpHandler;
use jsbox_core::engine::OpId;
use jsbox_core::engine::OpOutcome;
use jsbox_core::engine::OpRequest;
use jsbox_core::engine::PendingCall;
use jsbox_core::engine::TerminateReason;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::error::JsError;
use jsbox_core::modules::interop;
use jsbox_core::modules::scan::ModuleInfo;
use jsbox_core::value::Object;
use jsbox_core::value::Value;
use lazy_regex::regex;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

/// Marker that makes [`JsContext::module_new`] fail like a parse error.
pub const SYNTAX_ERROR_MARKER: &str = "%%syntax-error%%";

#[derive(Clone, Debug)]
pub enum Expr {
  Lit(Value),
  /// Local binding lookup.
  Get(String),
  /// Nested property path on a binding.
  GetPath(String, Vec<String>),
  GlobalGet(String),
  /// The invocation arguments of a callback program.
  Args,
  ArgsAt(usize),
  /// Element of an array-valued binding.
  IndexOf(String, usize),
  Object(Vec<(String, Expr)>),
  Array(Vec<Expr>),
}

#[derive(Clone, Debug)]
pub enum Step {
  Bind(String, Expr),
  SetGlobal(String, Expr),
  CallOp {
    name: String,
    args: Vec<Expr>,
    bind: Option<String>,
  },
  Throw {
    name: String,
    message: String,
  },
  /// Blocks the thread until the interrupt fires, like `while(true){}`.
  BusyLoop,
  /// Terminates the context as if the heap limit was breached.
  TriggerOom,
  Return(Expr),
  /// CommonJS only: `const b = require("spec")`.
  Require {
    specifier: String,
    bind: String,
  },
  /// CommonJS only: `__exportStar(binding, exports)`.
  ExportStar {
    from: String,
  },
  /// CommonJS / module body: `exports.name = value`.
  SetExport {
    name: String,
    value: Expr,
  },
}

pub type Program = Vec<Step>;

#[derive(Default)]
struct Shared {
  programs: Mutex<HashMap<String, Program>>,
  callbacks: Mutex<HashMap<u64, Program>>,
}

/// Factory handed to `start_daemon`; programs may be registered before or
/// after contexts exist.
#[derive(Clone, Default)]
pub struct ScriptEngine {
  shared: Arc<Shared>,
}

impl ScriptEngine {
  pub fn new() -> ScriptEngine {
    ScriptEngine::default()
  }

  /// Registers the program interpreting `source`.
  pub fn program(&self, source: &str, steps: Program) {
    self.shared.programs.lock().insert(source.trim().to_string(), steps);
  }

  /// Registers a sandbox function addressable as `CallbackRef(id)`.
  pub fn callback(&self, id: u64, steps: Program) {
    self.shared.callbacks.lock().insert(id, steps);
  }
}

impl JsEngine for ScriptEngine {
  fn new_context(
    &self,
    _params: CreateParams,
    ops: Rc<dyn OpHandler>,
  ) -> Result<Box<dyn JsContext>, ErrorEnvelope> {
    Ok(Box::new(ScriptContext {
      shared: self.shared.clone(),
      ops,
      globals: HashMap::new(),
      activities: Vec::new(),
      op_results: HashMap::new(),
      call_results: HashMap::new(),
      next_call: 1,
      modules: Vec::new(),
      failure: None,
      interrupt: Arc::new(ScriptInterrupt::default()),
    }))
  }
}

#[derive(Default)]
struct ScriptInterrupt {
  reason: Mutex<Option<TerminateReason>>,
}

impl InterruptHandle for ScriptInterrupt {
  fn terminate(&self, reason: TerminateReason) {
    let mut slot = self.reason.lock();
    if slot.is_none() {
      *slot = Some(reason);
    }
  }
}

#[derive(PartialEq)]
enum ModuleState {
  New,
  Instantiated,
  Evaluated,
}

struct FakeModule {
  name: String,
  source: String,
  info: ModuleInfo,
  synthetic: Option<Value>,
  edges: HashMap<String, EngineModule>,
  state: ModuleState,
  namespace: Option<Value>,
}

struct Activity {
  steps: Program,
  pc: usize,
  bindings: HashMap<String, Value>,
  args: Vec<Value>,
  /// Parked on this op, optionally binding its result.
  waiting: Option<(OpId, Option<String>)>,
  /// Set for callback invocations started by `call_function`.
  call: Option<PendingCall>,
  result: Value,
}

pub struct ScriptContext {
  shared: Arc<Shared>,
  ops: Rc<dyn OpHandler>,
  globals: HashMap<String, Value>,
  activities: Vec<Activity>,
  op_results: HashMap<OpId, Result<Value, ErrorEnvelope>>,
  call_results: HashMap<PendingCall, Result<Value, JsError>>,
  next_call: u64,
  modules: Vec<FakeModule>,
  failure: Option<JsError>,
  interrupt: Arc<ScriptInterrupt>,
}

enum StepOutcome {
  Finished,
  Parked,
  Threw(JsError),
}

impl ScriptContext {
  fn clear_termination(&self) {
    let mut slot = self.interrupt.reason.lock();
    // OOM is permanent; everything else clears at the next execution.
    if *slot != Some(TerminateReason::OutOfMemory) {
      *slot = None;
    }
  }

  fn eval_expr(
    globals: &HashMap<String, Value>,
    activity: &Activity,
    expr: &Expr,
  ) -> Value {
    match expr {
      Expr::Lit(value) => value.clone(),
      Expr::Get(name) => {
        activity.bindings.get(name).cloned().unwrap_or(Value::Undefined)
      }
      Expr::GetPath(name, path) => {
        let mut current =
          activity.bindings.get(name).cloned().unwrap_or(Value::Undefined);
        for key in path {
          current = current.get(key).cloned().unwrap_or(Value::Undefined);
        }
        current
      }
      Expr::GlobalGet(name) => {
        globals.get(name).cloned().unwrap_or(Value::Undefined)
      }
      Expr::Args => Value::Array(activity.args.clone()),
      Expr::ArgsAt(idx) => {
        activity.args.get(*idx).cloned().unwrap_or(Value::Undefined)
      }
      Expr::IndexOf(name, idx) => activity
        .bindings
        .get(name)
        .and_then(|v| v.as_array())
        .and_then(|items| items.get(*idx))
        .cloned()
        .unwrap_or(Value::Undefined),
      Expr::Object(entries) => Value::Object(
        entries
          .iter()
          .map(|(k, e)| (k.clone(), Self::eval_expr(globals, activity, e)))
          .collect(),
      ),
      Expr::Array(items) => Value::Array(
        items
          .iter()
          .map(|e| Self::eval_expr(globals, activity, e))
          .collect(),
      ),
    }
  }

  /// Runs an activity until it parks, finishes or throws.
  fn run_activity(&mut self, mut activity: Activity) -> StepOutcome {
    loop {
      if self.interrupt.reason.lock().is_some() {
        return StepOutcome::Threw(JsError::new(
          "Error",
          "Script execution terminated",
        ));
      }
      if activity.pc >= activity.steps.len() {
        self.finish_activity(activity);
        return StepOutcome::Finished;
      }
      let step = activity.steps[activity.pc].clone();
      activity.pc += 1;
      match step {
        Step::Bind(name, expr) => {
          let value = Self::eval_expr(&self.globals, &activity, &expr);
          activity.bindings.insert(name, value);
        }
        Step::SetGlobal(name, expr) => {
          let value = Self::eval_expr(&self.globals, &activity, &expr);
          self.globals.insert(name, value);
        }
        Step::CallOp { name, args, bind } => {
          let arg_values: Vec<Value> = args
            .iter()
            .map(|e| Self::eval_expr(&self.globals, &activity, e))
            .collect();
          match self.ops.dispatch(OpRequest { name, args: arg_values }) {
            OpOutcome::Sync(Ok(value)) => {
              if let Some(bind) = bind {
                activity.bindings.insert(bind, value);
              }
            }
            OpOutcome::Sync(Err(env)) => {
              return StepOutcome::Threw(env.into());
            }
            OpOutcome::Pending(op) => {
              activity.waiting = Some((op, bind));
              self.activities.push(activity);
              return StepOutcome::Parked;
            }
          }
        }
        Step::Throw { name, message } => {
          return StepOutcome::Threw(JsError::new(name, message));
        }
        Step::BusyLoop => loop {
          if self.interrupt.reason.lock().is_some() {
            return StepOutcome::Threw(JsError::new(
              "Error",
              "Script execution terminated",
            ));
          }
          std::thread::sleep(std::time::Duration::from_millis(1));
        },
        Step::TriggerOom => {
          self.interrupt.terminate(TerminateReason::OutOfMemory);
          return StepOutcome::Threw(JsError::new(
            "RangeError",
            "heap limit exceeded",
          ));
        }
        Step::Return(expr) => {
          activity.result = Self::eval_expr(&self.globals, &activity, &expr);
          activity.pc = activity.steps.len();
        }
        Step::Require { .. } | Step::ExportStar { .. }
        | Step::SetExport { .. } => {
          return StepOutcome::Threw(JsError::new(
            "SyntaxError",
            "module-scope statement outside a module body",
          ));
        }
      }
    }
  }

  fn finish_activity(&mut self, activity: Activity) {
    if let Some(call) = activity.call {
      self.call_results.insert(call, Ok(activity.result));
    }
  }

  fn fail_activity(&mut self, activity_call: Option<PendingCall>, err: JsError) {
    match activity_call {
      Some(call) => {
        self.call_results.insert(call, Err(err));
      }
      None => {
        if self.failure.is_none() {
          self.failure = Some(err);
        }
      }
    }
  }

  fn lookup_program(&self, source: &str) -> Option<Program> {
    self.shared.programs.lock().get(source.trim()).cloned()
  }

  /// Literal-initializer fallback for module bodies without a program:
  /// `export const name = 'text'` and numeric initializers evaluate, the
  /// rest of the scanned export surface is `undefined`.
  fn auto_esm_exports(source: &str, info: &ModuleInfo) -> Object {
    let mut ns = Object::new();
    let string_init = regex!(
      r#"export\s+const\s+([\w$]+)\s*=\s*["']([^"']*)["']"#
    );
    for cap in string_init.captures_iter(source) {
      ns.insert(cap[1].to_string(), Value::String(cap[2].to_string()));
    }
    let number_init =
      regex!(r"export\s+const\s+([\w$]+)\s*=\s*(-?\d+(?:\.\d+)?)");
    for cap in number_init.captures_iter(source) {
      if !ns.contains_key(&cap[1]) {
        let n: f64 = cap[2].parse().unwrap_or(f64::NAN);
        ns.insert(cap[1].to_string(), Value::Number(n));
      }
    }
    for name in &info.local_exports {
      ns.entry(name.clone()).or_insert(Value::Undefined);
    }
    if info.has_default_export {
      ns.entry("default".to_string()).or_insert(Value::Undefined);
    }
    ns
  }

  fn evaluate_module_body(
    &mut self,
    module: EngineModule,
  ) -> Result<(), JsError> {
    let (source, info) = {
      let m = &self.modules[module as usize];
      if m.synthetic.is_some() || m.state == ModuleState::Evaluated {
        let ns = m.synthetic.clone();
        let m = &mut self.modules[module as usize];
        if let Some(ns) = ns {
          m.namespace = Some(ns);
        }
        m.state = ModuleState::Evaluated;
        return Ok(());
      }
      (m.source.clone(), m.info.clone())
    };

    // Imported namespaces are visible to the module-body program as
    // bindings keyed by specifier, so `import { x } from "A"` reads as
    // `GetPath("A", ["x"])`.
    let mut import_bindings = HashMap::new();
    let edges: Vec<(String, EngineModule)> = self.modules[module as usize]
      .edges
      .iter()
      .map(|(spec, dep)| (spec.clone(), *dep))
      .collect();
    for (spec, dep) in edges {
      if let Some(ns) = self.modules[dep as usize].namespace.clone() {
        import_bindings.insert(spec, ns);
      }
    }

    let mut ns = match self.lookup_program(&source) {
      Some(steps) => {
        // Module-body programs are synchronous: SetExport/Bind/CallOp(sync).
        let mut exports = Object::new();
        let mut activity = Activity {
          steps,
          pc: 0,
          bindings: import_bindings,
          args: Vec::new(),
          waiting: None,
          call: None,
          result: Value::Undefined,
        };
        loop {
          if activity.pc >= activity.steps.len() {
            break;
          }
          let step = activity.steps[activity.pc].clone();
          activity.pc += 1;
          match step {
            Step::SetExport { name, value } => {
              let value = Self::eval_expr(&self.globals, &activity, &value);
              exports.insert(name, value);
            }
            Step::Bind(name, expr) => {
              let value = Self::eval_expr(&self.globals, &activity, &expr);
              activity.bindings.insert(name, value);
            }
            Step::SetGlobal(name, expr) => {
              let value = Self::eval_expr(&self.globals, &activity, &expr);
              self.globals.insert(name, value);
            }
            Step::CallOp { name, args, bind } => {
              let arg_values: Vec<Value> = args
                .iter()
                .map(|e| Self::eval_expr(&self.globals, &activity, e))
                .collect();
              match self.ops.dispatch(OpRequest { name, args: arg_values }) {
                OpOutcome::Sync(Ok(value)) => {
                  if let Some(bind) = bind {
                    activity.bindings.insert(bind, value);
                  }
                }
                OpOutcome::Sync(Err(env)) => return Err(env.into()),
                OpOutcome::Pending(_) => {
                  return Err(JsError::new(
                    "Error",
                    "async op during module evaluation",
                  ));
                }
              }
            }
            Step::Throw { name, message } => {
              return Err(JsError::new(name, message));
            }
            _ => {
              return Err(JsError::new(
                "SyntaxError",
                "unsupported statement in module body",
              ));
            }
          }
        }
        exports
      }
      None => Self::auto_esm_exports(&source, &info),
    };

    // Star re-exports: names from the source module, `default` excluded,
    // locals win.
    let star_sources: Vec<EngineModule> = {
      let m = &self.modules[module as usize];
      m.info
        .star_reexports
        .iter()
        .filter_map(|spec| m.edges.get(spec).copied())
        .collect()
    };
    for dep in star_sources {
      self.evaluate_module_body(dep)?;
      if let Some(Value::Object(dep_ns)) =
        self.modules[dep as usize].namespace.clone().as_ref()
      {
        for (key, value) in dep_ns {
          if key != "default" && !ns.contains_key(key) {
            ns.insert(key.clone(), value.clone());
          }
        }
      }
    }

    let m = &mut self.modules[module as usize];
    m.namespace = Some(Value::Object(ns));
    m.state = ModuleState::Evaluated;
    Ok(())
  }
}

impl JsContext for ScriptContext {
  fn execute_script(
    &mut self,
    _filename: &str,
    source: &str,
  ) -> Result<(), JsError> {
    self.clear_termination();
    let Some(steps) = self.lookup_program(source) else {
      // Unscripted sources execute as empty programs.
      return Ok(());
    };
    let activity = Activity {
      steps,
      pc: 0,
      bindings: HashMap::new(),
      args: Vec::new(),
      waiting: None,
      call: None,
      result: Value::Undefined,
    };
    match self.run_activity(activity) {
      StepOutcome::Finished | StepOutcome::Parked => Ok(()),
      StepOutcome::Threw(err) => Err(err),
    }
  }

  fn poll_event_loop(
    &mut self,
    _cx: &mut Context<'_>,
  ) -> Poll<Result<(), JsError>> {
    if self.interrupt.reason.lock().is_some() {
      return Poll::Ready(Err(JsError::new(
        "Error",
        "Script execution terminated",
      )));
    }

    // Resume every activity whose op resolved.
    let mut progressed = true;
    while progressed {
      progressed = false;
      let mut index = 0;
      while index < self.activities.len() {
        let ready = match &self.activities[index].waiting {
          Some((op, _)) => self.op_results.contains_key(op),
          None => true,
        };
        if !ready {
          index += 1;
          continue;
        }
        progressed = true;
        let mut activity = self.activities.swap_remove(index);
        if let Some((op, bind)) = activity.waiting.take() {
          match self.op_results.remove(&op).expect("checked") {
            Ok(value) => {
              if let Some(bind) = bind {
                activity.bindings.insert(bind, value);
              }
            }
            Err(env) => {
              // No catch in the step language: an op failure is an
              // uncaught exception of this activity.
              let call = activity.call;
              self.fail_activity(call, env.into());
              continue;
            }
          }
        }
        let call = activity.call;
        if let StepOutcome::Threw(err) = self.run_activity(activity) {
          self.fail_activity(call, err);
        }
      }
    }

    if let Some(err) = self.failure.take() {
      return Poll::Ready(Err(err));
    }
    if self.activities.is_empty() {
      Poll::Ready(Ok(()))
    } else {
      Poll::Pending
    }
  }

  fn has_pending_work(&self) -> bool {
    !self.activities.is_empty()
  }

  fn resolve_op(&mut self, op: OpId, result: Result<Value, ErrorEnvelope>) {
    self.op_results.insert(op, result);
  }

  fn module_new(
    &mut self,
    _main: bool,
    name: &str,
    source: &str,
    info: &ModuleInfo,
  ) -> Result<EngineModule, JsError> {
    if source.contains(SYNTAX_ERROR_MARKER) {
      return Err(
        JsError::syntax_error("Unexpected token")
          .with_stack(format!("SyntaxError: Unexpected token\n    at {name}")),
      );
    }
    let id = self.modules.len() as EngineModule;
    self.modules.push(FakeModule {
      name: name.to_string(),
      source: source.to_string(),
      info: info.clone(),
      synthetic: None,
      edges: HashMap::new(),
      state: ModuleState::New,
      namespace: None,
    });
    Ok(id)
  }

  fn module_synthetic(
    &mut self,
    name: &str,
    exports: Value,
  ) -> Result<EngineModule, JsError> {
    let id = self.modules.len() as EngineModule;
    self.modules.push(FakeModule {
      name: name.to_string(),
      source: String::new(),
      info: ModuleInfo::default(),
      synthetic: Some(exports.clone()),
      edges: HashMap::new(),
      state: ModuleState::Evaluated,
      namespace: Some(exports),
    });
    Ok(id)
  }

  fn module_instantiate(
    &mut self,
    root: EngineModule,
    resolve: &mut dyn FnMut(EngineModule, &str) -> Option<EngineModule>,
  ) -> Result<(), JsError> {
    let mut worklist = vec![root];
    while let Some(module) = worklist.pop() {
      if self.modules[module as usize].state != ModuleState::New {
        continue;
      }
      let specifiers = self.modules[module as usize]
        .info
        .dependency_specifiers();
      for specifier in specifiers {
        let Some(dep) = resolve(module, &specifier) else {
          let name = self.modules[module as usize].name.clone();
          return Err(JsError::new(
            "Error",
            format!("Cannot resolve module {specifier:?} from {name}"),
          ));
        };
        self.modules[module as usize].edges.insert(specifier, dep);
        worklist.push(dep);
      }
      self.modules[module as usize].state = ModuleState::Instantiated;
    }
    Ok(())
  }

  fn module_evaluate(&mut self, root: EngineModule) -> Result<(), JsError> {
    self.clear_termination();
    // Post-order over the instantiated edges.
    let mut stack = vec![(root, false)];
    let mut visited = std::collections::HashSet::new();
    while let Some((module, children_done)) = stack.pop() {
      if children_done {
        self.evaluate_module_body(module)?;
        continue;
      }
      if !visited.insert(module) {
        continue;
      }
      stack.push((module, true));
      let deps: Vec<EngineModule> = self.modules[module as usize]
        .edges
        .values()
        .copied()
        .collect();
      for dep in deps {
        stack.push((dep, false));
      }
    }
    Ok(())
  }

  fn module_namespace(
    &mut self,
    module: EngineModule,
  ) -> Result<Value, JsError> {
    self.modules[module as usize]
      .namespace
      .clone()
      .ok_or_else(|| JsError::new("Error", "module is not evaluated"))
  }

  fn evaluate_cjs(
    &mut self,
    _filename: &str,
    source: &str,
    scope: &mut dyn CommonJsScope,
  ) -> Result<Value, JsError> {
    if let Some(steps) = self.lookup_program(source) {
      let mut exports = Object::new();
      let mut activity = Activity {
        steps,
        pc: 0,
        bindings: HashMap::new(),
        args: Vec::new(),
        waiting: None,
        call: None,
        result: Value::Undefined,
      };
      loop {
        if activity.pc >= activity.steps.len() {
          return Ok(Value::Object(exports));
        }
        let step = activity.steps[activity.pc].clone();
        activity.pc += 1;
        match step {
          Step::Require { specifier, bind } => {
            let value = scope.require(&specifier).map_err(JsError::from)?;
            activity.bindings.insert(bind, value);
          }
          Step::ExportStar { from } => {
            let required = activity
              .bindings
              .get(&from)
              .cloned()
              .unwrap_or(Value::Undefined);
            interop::export_star(&required, &mut exports);
          }
          Step::SetExport { name, value } => {
            let value = Self::eval_expr(&self.globals, &activity, &value);
            exports.insert(name, value);
          }
          Step::Bind(name, expr) => {
            let value = Self::eval_expr(&self.globals, &activity, &expr);
            activity.bindings.insert(name, value);
          }
          Step::SetGlobal(name, expr) => {
            let value = Self::eval_expr(&self.globals, &activity, &expr);
            self.globals.insert(name, value);
          }
          // `module.exports = value` replaces the exports object.
          Step::Return(expr) => {
            return Ok(Self::eval_expr(&self.globals, &activity, &expr));
          }
          Step::Throw { name, message } => {
            return Err(JsError::new(name, message));
          }
          Step::CallOp { name, args, bind } => {
            let arg_values: Vec<Value> = args
              .iter()
              .map(|e| Self::eval_expr(&self.globals, &activity, e))
              .collect();
            match self.ops.dispatch(OpRequest { name, args: arg_values }) {
              OpOutcome::Sync(Ok(value)) => {
                if let Some(bind) = bind {
                  activity.bindings.insert(bind, value);
                }
              }
              OpOutcome::Sync(Err(env)) => return Err(env.into()),
              OpOutcome::Pending(_) => {
                return Err(JsError::new(
                  "Error",
                  "async op during require",
                ));
              }
            }
          }
          _ => {
            return Err(JsError::new(
              "SyntaxError",
              "unsupported statement in CommonJS body",
            ));
          }
        }
      }
    }

    // Fallback: interpret `__exportStar(require("X"), exports)` chains.
    let star = regex!(r#"__exportStar\(\s*require\(["']([^"']+)["']\)\s*,\s*exports\s*\)"#);
    let mut exports = Object::new();
    for cap in star.captures_iter(source) {
      let required = scope.require(&cap[1]).map_err(JsError::from)?;
      interop::export_star(&required, &mut exports);
    }
    Ok(Value::Object(exports))
  }

  fn call_function(
    &mut self,
    callback: u64,
    args: Vec<Value>,
  ) -> Result<PendingCall, JsError> {
    self.clear_termination();
    let steps =
      self.shared.callbacks.lock().get(&callback).cloned().ok_or_else(
        || JsError::type_error(format!("callback {callback} is not a function")),
      )?;
    let call = self.next_call;
    self.next_call += 1;
    self.activities.push(Activity {
      steps,
      pc: 0,
      bindings: HashMap::new(),
      args,
      waiting: None,
      call: Some(call),
      result: Value::Undefined,
    });
    Ok(call)
  }

  fn take_call_result(
    &mut self,
    call: PendingCall,
  ) -> Option<Result<Value, JsError>> {
    self.call_results.remove(&call)
  }

  fn set_global(&mut self, name: &str, value: Value) {
    self.globals.insert(name.to_string(), value);
  }

  fn get_global(&mut self, name: &str) -> Value {
    self.globals.get(name).cloned().unwrap_or(Value::Undefined)
  }

  fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
    self.interrupt.clone()
  }

  fn heap_used(&self) -> usize {
    0
  }

  fn terminated(&self) -> Option<TerminateReason> {
    *self.interrupt.reason.lock()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use jsbox_core::modules::scan;
  use pretty_assertions::assert_eq;

  struct SyncOps;
  impl OpHandler for SyncOps {
    fn dispatch(&self, req: OpRequest) -> OpOutcome {
      match req.name.as_str() {
        "op_echo" => OpOutcome::Sync(Ok(Value::Array(req.args))),
        _ => OpOutcome::Pending(7),
      }
    }
  }

  fn context(engine: &ScriptEngine) -> Box<dyn JsContext> {
    engine
      .new_context(CreateParams::default(), Rc::new(SyncOps))
      .unwrap()
  }

  #[test]
  fn globals_persist_across_scripts() {
    let engine = ScriptEngine::new();
    engine.program(
      "globalThis.x = 1",
      vec![Step::SetGlobal("x".into(), Expr::Lit(Value::Number(1.0)))],
    );
    let mut ctx = context(&engine);
    ctx.execute_script("/main.js", "globalThis.x = 1").unwrap();
    assert_eq!(ctx.get_global("x"), Value::Number(1.0));
  }

  #[test]
  fn pending_ops_park_the_activity() {
    let engine = ScriptEngine::new();
    engine.program(
      "await slow()",
      vec![
        Step::CallOp {
          name: "op_slow".into(),
          args: vec![],
          bind: Some("r".into()),
        },
        Step::SetGlobal("r".into(), Expr::Get("r".into())),
      ],
    );
    let mut ctx = context(&engine);
    ctx.execute_script("/main.js", "await slow()").unwrap();
    assert!(ctx.has_pending_work());

    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    assert!(ctx.poll_event_loop(&mut cx).is_pending());
    ctx.resolve_op(7, Ok(Value::String("done".into())));
    assert!(matches!(ctx.poll_event_loop(&mut cx), Poll::Ready(Ok(()))));
    assert_eq!(ctx.get_global("r"), Value::String("done".into()));
  }

  #[test]
  fn interrupt_terminates_and_clears_on_next_execution() {
    let engine = ScriptEngine::new();
    let mut ctx = context(&engine);
    ctx.interrupt_handle().terminate(TerminateReason::Timeout);
    assert_eq!(ctx.terminated(), Some(TerminateReason::Timeout));
    ctx.execute_script("/main.js", "noop").unwrap();
    assert_eq!(ctx.terminated(), None);
  }

  #[test]
  fn auto_esm_exports_evaluate_literals() {
    let engine = ScriptEngine::new();
    let mut ctx = context(&engine);
    let source = "export const deepValue = 'found-it';\nexport const n = 3;";
    let info = scan::parse(source);
    let m = ctx.module_new(true, "/m.js", source, &info).unwrap();
    ctx.module_instantiate(m, &mut |_, _| None).unwrap();
    ctx.module_evaluate(m).unwrap();
    let ns = ctx.module_namespace(m).unwrap();
    assert_eq!(ns.get("deepValue"), Some(&Value::String("found-it".into())));
    assert_eq!(ns.get("n"), Some(&Value::Number(3.0)));
  }
}
