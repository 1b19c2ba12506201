// Copyright 2024-2026 the jsbox authors. MIT license.

//! The module graph: resolution, caching, linking and evaluation of ES and
//! CommonJS modules inside one isolate.
//!
//! Records live in an arena indexed by [`ModuleId`]; the id — not a pointer —
//! is what importers hold during linking, so partially-linked cycles are
//! safe. Loading is split in two phases the worker drives separately:
//!
//! 1. an async *load* phase that walks the static dependency graph through
//!    the host loader (memoized, cycle-tolerant), and
//! 2. a sync *link/evaluate* phase against the engine context: CommonJS
//!    bodies run first in dependency post-order (their facades become
//!    synthetic engine modules), then the ES subgraph is instantiated and
//!    evaluated in one go.
//!
//! The cache is shared between static `import`, dynamic `import()` and
//! `require`; a record that failed stays failed and re-surfaces the same
//! error on every subsequent resolution.

pub mod builtin;
pub mod interop;
pub mod scan;

use crate::engine::CommonJsScope;
use crate::engine::EngineModule;
use crate::engine::JsContext;
use crate::error::ErrorEnvelope;
use crate::error::ErrorKind;
use crate::path_util;
use crate::protocol::Importer;
use crate::protocol::LoaderResult;
use crate::value::Object;
use crate::value::Value;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use self::scan::ModuleInfo;
use std::collections::HashMap;
use std::collections::HashSet;
use std::rc::Rc;

pub type ModuleId = usize;

/// Host side of module resolution, implemented over the bridge by the
/// runtime. `'static` futures so the graph can hold the loader across
/// awaits.
pub trait ModuleLoader {
  fn load(
    &self,
    specifier: &str,
    importer: &Importer,
  ) -> LocalBoxFuture<'static, Result<LoaderResult, ErrorEnvelope>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordFormat {
  Esm,
  Cjs,
  Builtin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalState {
  Unloaded,
  Linking,
  Linked,
  Evaluating,
  Evaluated,
  Error,
}

pub struct ModuleRecord {
  pub canonical: String,
  pub format: RecordFormat,
  pub source: String,
  pub filename: String,
  pub resolve_dir: String,
  pub static_hint: bool,
  pub info: ModuleInfo,
  pub state: EvalState,
  /// Specifier → resolved record, in source order.
  pub deps: IndexMap<String, ModuleId>,
  pub engine_module: Option<EngineModule>,
  /// CommonJS: the final `module.exports` value.
  pub exports: Option<Value>,
  /// ES namespace (or CJS facade) snapshot.
  pub namespace: Option<Value>,
  pub error: Option<ErrorEnvelope>,
}

impl ModuleRecord {
  pub fn importer(&self) -> Importer {
    Importer {
      path: self.canonical.clone(),
      resolve_dir: self.resolve_dir.clone(),
    }
  }
}

#[derive(Default)]
pub struct ModuleGraph {
  records: Vec<ModuleRecord>,
  by_canonical: HashMap<String, ModuleId>,
  /// (specifier, resolve_dir) → record, so one loader round-trip per edge.
  resolution_cache: HashMap<(String, String), ModuleId>,
  loader: Option<Rc<dyn ModuleLoader>>,
  /// Records whose evaluation is on the current stack; require back-edges
  /// into these observe partial exports.
  evaluating: HashSet<ModuleId>,
}

impl ModuleGraph {
  pub fn new() -> ModuleGraph {
    ModuleGraph::default()
  }

  /// Replaces the host loader. Called on first create and again on
  /// namespace reuse when the new connection re-registers callbacks; the
  /// cache itself is untouched.
  pub fn set_loader(&mut self, loader: Option<Rc<dyn ModuleLoader>>) {
    self.loader = loader;
  }

  pub fn record(&self, id: ModuleId) -> &ModuleRecord {
    &self.records[id]
  }

  pub fn lookup(&self, canonical: &str) -> Option<ModuleId> {
    self.by_canonical.get(canonical).copied()
  }

  pub fn len(&self) -> usize {
    self.records.len()
  }

  pub fn is_empty(&self) -> bool {
    self.records.is_empty()
  }

  /// Registers the entry script of an `eval` as a module and loads its
  /// static dependency closure. Entry records are deliberately kept out of
  /// the canonical cache: every eval is a fresh script even under the same
  /// filename, while its imports still share the isolate-wide cache.
  pub async fn load_entry(
    &mut self,
    code: &str,
    entry_path: &str,
  ) -> Result<ModuleId, ErrorEnvelope> {
    let info = scan::parse(code);
    let resolve_dir = path_util::dirname(entry_path);
    let id = self.records.len();
    self.records.push(ModuleRecord {
      canonical: entry_path.to_string(),
      format: RecordFormat::Esm,
      source: code.to_string(),
      filename: entry_path.to_string(),
      resolve_dir: resolve_dir.clone(),
      static_hint: false,
      info,
      state: EvalState::Linking,
      deps: IndexMap::new(),
      engine_module: None,
      exports: None,
      namespace: None,
      error: None,
    });
    self.load_deps(id).await?;
    if self.records[id].error.is_none() {
      self.records[id].state = EvalState::Linked;
    }
    Ok(id)
  }

  /// Resolves one specifier (loader or builtin fallback) and loads its
  /// static closure. The returned record may be in any state if it was
  /// already cached.
  pub async fn load(
    &mut self,
    specifier: &str,
    importer: &Importer,
  ) -> Result<ModuleId, ErrorEnvelope> {
    self.resolve_record(specifier.to_string(), importer.clone()).await
  }

  fn resolve_record(
    &mut self,
    specifier: String,
    importer: Importer,
  ) -> LocalBoxFuture<'_, Result<ModuleId, ErrorEnvelope>> {
    Box::pin(async move {
      let res_key = (specifier.clone(), importer.resolve_dir.clone());
      if let Some(&id) = self.resolution_cache.get(&res_key) {
        return self.sticky(id);
      }

      let builtin = builtin::builtin_name(&specifier);
      let loaded = match (&self.loader, builtin) {
        (None, None) => return Err(ErrorEnvelope::no_module_loader()),
        (None, Some(_)) => None,
        (Some(loader), Some(_)) => {
          // Loader override wins; its failure selects the fallback.
          loader.load(&specifier, &importer).await.ok()
        }
        (Some(loader), None) => Some(
          loader
            .load(&specifier, &importer)
            .await
            .map_err(|e| ErrorEnvelope::module_load(&specifier, e))?,
        ),
      };

      let id = match loaded {
        Some(loaded) => self.insert_loaded_record(&specifier, loaded),
        None => {
          let name = builtin.expect("fallback only selected for builtins");
          self.insert_builtin_record(name)?
        }
      };
      // Cache the resolution before descending, so a cycle back to this
      // specifier reuses the record instead of re-fetching it.
      self.resolution_cache.insert(res_key, id);

      if self.records[id].state == EvalState::Unloaded {
        self.records[id].state = EvalState::Linking;
        // A dep failure is recorded on this record (sticky) rather than
        // propagated here, so later resolutions re-surface the same error.
        let _ = self.load_deps(id).await;
        if self.records[id].error.is_none() {
          self.records[id].state = EvalState::Linked;
        }
      }
      self.sticky(id)
    })
  }

  fn insert_loaded_record(
    &mut self,
    specifier: &str,
    loaded: LoaderResult,
  ) -> ModuleId {
    let filename = loaded.filename.as_deref().unwrap_or(specifier);
    let canonical = path_util::join(&loaded.resolve_dir, filename);
    if let Some(&id) = self.by_canonical.get(&canonical) {
      return id;
    }

    let format = match loaded.format.as_deref() {
      Some("cjs") => RecordFormat::Cjs,
      Some(_) => RecordFormat::Esm,
      None => match scan::infer_format(&loaded.code) {
        scan::ModuleFormat::Cjs => RecordFormat::Cjs,
        scan::ModuleFormat::Esm => RecordFormat::Esm,
      },
    };
    let info = scan::parse(&loaded.code);
    let id = self.records.len();
    self.records.push(ModuleRecord {
      canonical: canonical.clone(),
      format,
      source: loaded.code,
      filename: filename.to_string(),
      resolve_dir: loaded.resolve_dir,
      static_hint: loaded.static_hint.unwrap_or(false),
      info,
      state: EvalState::Unloaded,
      deps: IndexMap::new(),
      engine_module: None,
      exports: None,
      namespace: None,
      error: None,
    });
    self.by_canonical.insert(canonical, id);
    id
  }

  fn insert_builtin_record(
    &mut self,
    name: &'static str,
  ) -> Result<ModuleId, ErrorEnvelope> {
    let canonical = builtin::canonical_id(name);
    if let Some(&id) = self.by_canonical.get(&canonical) {
      return Ok(id);
    }
    let source = builtin::source(name).ok_or_else(|| {
      ErrorEnvelope::internal(format!("missing builtin source for {name}"))
    })?;
    let info = scan::parse(source);
    let id = self.records.len();
    self.records.push(ModuleRecord {
      canonical: canonical.clone(),
      format: RecordFormat::Builtin,
      source: source.to_string(),
      filename: canonical.clone(),
      resolve_dir: "/".to_string(),
      static_hint: true,
      info,
      state: EvalState::Unloaded,
      deps: IndexMap::new(),
      engine_module: None,
      exports: None,
      namespace: None,
      error: None,
    });
    self.by_canonical.insert(canonical, id);
    Ok(id)
  }

  async fn load_deps(&mut self, id: ModuleId) -> Result<(), ErrorEnvelope> {
    let specifiers = self.records[id].info.dependency_specifiers();
    let importer = self.records[id].importer();
    for specifier in specifiers {
      if self.records[id].deps.contains_key(&specifier) {
        continue;
      }
      let dep = match self.resolve_record(specifier.clone(), importer.clone()).await
      {
        Ok(dep) => dep,
        Err(err) => {
          self.fail(id, err.clone());
          return Err(err);
        }
      };
      self.records[id].deps.insert(specifier, dep);
    }
    Ok(())
  }

  /// Links and runs a loaded record and everything it needs, in dependency
  /// post-order. Synchronous with respect to the loader: the closure is
  /// already in the arena. Top-level await keeps the engine's event loop
  /// pending after this returns.
  pub fn ensure_evaluated(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
  ) -> Result<(), ErrorEnvelope> {
    match self.records[id].state {
      EvalState::Evaluated => return Ok(()),
      EvalState::Error => return self.sticky(id).map(|_| ()),
      _ if self.evaluating.contains(&id) => return Ok(()),
      _ => {}
    }

    match self.records[id].format {
      RecordFormat::Cjs => self.evaluate_cjs(ctx, id),
      RecordFormat::Esm | RecordFormat::Builtin => self.evaluate_esm(ctx, id),
    }
  }

  fn evaluate_cjs(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
  ) -> Result<(), ErrorEnvelope> {
    self.records[id].state = EvalState::Evaluating;
    self.evaluating.insert(id);

    // Dependencies first, so every literal require resolves from cache.
    let deps: Vec<ModuleId> = self.records[id].deps.values().copied().collect();
    for dep in deps {
      if let Err(err) = self.ensure_evaluated(ctx, dep) {
        self.evaluating.remove(&id);
        self.fail(id, err.clone());
        return Err(err);
      }
    }

    let mut resolved = HashMap::new();
    let dep_entries: Vec<(String, ModuleId)> = self.records[id]
      .deps
      .iter()
      .map(|(s, d)| (s.clone(), *d))
      .collect();
    for (specifier, dep) in dep_entries {
      resolved.insert(specifier, self.require_value(ctx, dep));
    }

    let mut scope = PreparedCjsScope {
      filename: self.records[id].canonical.clone(),
      dirname: self.records[id].resolve_dir.clone(),
      resolved,
    };
    let source = self.records[id].source.clone();
    let filename = self.records[id].canonical.clone();
    let result = ctx.evaluate_cjs(&filename, &source, &mut scope);
    self.evaluating.remove(&id);

    match result {
      Ok(exports) => {
        let namespace = interop::cjs_namespace(&exports);
        let engine_module =
          match ctx.module_synthetic(&filename, namespace.clone()) {
            Ok(engine_module) => engine_module,
            Err(js_err) => {
              let env: ErrorEnvelope = js_err.into();
              self.fail(id, env.clone());
              return Err(env);
            }
          };
        let record = &mut self.records[id];
        record.exports = Some(exports);
        record.namespace = Some(namespace);
        record.engine_module = Some(engine_module);
        record.state = EvalState::Evaluated;
        Ok(())
      }
      Err(js_err) => {
        let env: ErrorEnvelope = js_err.into();
        self.fail(id, env.clone());
        Err(env)
      }
    }
  }

  fn evaluate_esm(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
  ) -> Result<(), ErrorEnvelope> {
    self.records[id].state = EvalState::Evaluating;
    self.evaluating.insert(id);

    let mut esm_closure = Vec::new();
    let register = self.register_subgraph(ctx, id, &mut esm_closure);
    if let Err(err) = register {
      self.evaluating.remove(&id);
      self.fail(id, err.clone());
      return Err(err);
    }

    let engine_to_record: HashMap<EngineModule, ModuleId> = self
      .records
      .iter()
      .enumerate()
      .filter_map(|(rid, rec)| rec.engine_module.map(|em| (em, rid)))
      .collect();

    let root_engine = self.records[id]
      .engine_module
      .expect("register_subgraph assigns engine modules");

    let records = &self.records;
    let mut resolve = |referrer: EngineModule, specifier: &str| {
      let rid = engine_to_record.get(&referrer)?;
      let dep = records[*rid].deps.get(specifier)?;
      records[*dep].engine_module
    };

    let linked = ctx.module_instantiate(root_engine, &mut resolve);
    if let Err(js_err) = linked {
      self.evaluating.remove(&id);
      let env: ErrorEnvelope = js_err.into();
      self.fail(id, env.clone());
      return Err(env);
    }

    let evaluated = ctx.module_evaluate(root_engine);
    self.evaluating.remove(&id);
    match evaluated {
      Ok(()) => {
        // The engine ran the whole ES closure; mark it settled.
        for rid in esm_closure {
          if self.records[rid].state != EvalState::Error {
            self.records[rid].state = EvalState::Evaluated;
          }
        }
        self.records[id].state = EvalState::Evaluated;
        Ok(())
      }
      Err(js_err) => {
        let env: ErrorEnvelope = js_err.into();
        self.fail(id, env.clone());
        Err(env)
      }
    }
  }

  /// Registers engine modules for the ES closure of `id`. CommonJS records
  /// encountered on the way are fully evaluated (their facade must exist
  /// before instantiation); ES records are only registered — the engine
  /// owns their evaluation order.
  fn register_subgraph(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
    esm_closure: &mut Vec<ModuleId>,
  ) -> Result<(), ErrorEnvelope> {
    if esm_closure.contains(&id) {
      return Ok(());
    }
    match self.records[id].state {
      EvalState::Error => return self.sticky(id).map(|_| ()),
      EvalState::Evaluated => return Ok(()),
      _ => {}
    }
    if self.records[id].format == RecordFormat::Cjs {
      return self.ensure_evaluated(ctx, id);
    }

    esm_closure.push(id);
    if self.records[id].engine_module.is_none() {
      let main = !self.by_canonical.contains_key(&self.records[id].canonical);
      let (canonical, source, info) = {
        let record = &self.records[id];
        (record.canonical.clone(), record.source.clone(), record.info.clone())
      };
      match ctx.module_new(main, &canonical, &source, &info) {
        Ok(engine_module) => {
          self.records[id].engine_module = Some(engine_module);
        }
        Err(js_err) => {
          let env: ErrorEnvelope = js_err.into();
          self.fail(id, env.clone());
          return Err(env);
        }
      }
    }

    let deps: Vec<ModuleId> = self.records[id].deps.values().copied().collect();
    for dep in deps {
      self.register_subgraph(ctx, dep, esm_closure)?;
    }
    Ok(())
  }

  /// What `require(specifier)` hands back for an already-evaluated record:
  /// raw `module.exports` for CommonJS, the namespace for ES modules. A
  /// record still on the evaluation stack yields its partial exports.
  fn require_value(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
  ) -> Result<Value, ErrorEnvelope> {
    if let Some(err) = &self.records[id].error {
      return Err(err.clone());
    }
    if self.evaluating.contains(&id)
      && self.records[id].state != EvalState::Evaluated
    {
      return Ok(
        self.records[id]
          .exports
          .clone()
          .unwrap_or(Value::Object(Object::new())),
      );
    }
    match self.records[id].format {
      RecordFormat::Cjs => Ok(
        self.records[id]
          .exports
          .clone()
          .unwrap_or(Value::Object(Object::new())),
      ),
      RecordFormat::Esm | RecordFormat::Builtin => self.namespace(ctx, id),
    }
  }

  /// Loads, evaluates and returns the require-value of a specifier. The
  /// sandbox sees this as synchronous; the suspension happens in the op
  /// machinery.
  pub async fn require(
    &mut self,
    ctx: &mut dyn JsContext,
    specifier: &str,
    importer: &Importer,
  ) -> Result<Value, ErrorEnvelope> {
    let id = self.load(specifier, importer).await?;
    self.ensure_evaluated(ctx, id)?;
    self.require_value(ctx, id)
  }

  /// Dynamic `import()`: same cache, namespace-shaped result.
  pub async fn dynamic_import(
    &mut self,
    ctx: &mut dyn JsContext,
    specifier: &str,
    importer: &Importer,
  ) -> Result<Value, ErrorEnvelope> {
    let id = self.load(specifier, importer).await?;
    self.ensure_evaluated(ctx, id)?;
    self.namespace(ctx, id)
  }

  /// Namespace snapshot of an evaluated record.
  pub fn namespace(
    &mut self,
    ctx: &mut dyn JsContext,
    id: ModuleId,
  ) -> Result<Value, ErrorEnvelope> {
    if let Some(err) = &self.records[id].error {
      return Err(err.clone());
    }
    if let Some(ns) = &self.records[id].namespace {
      return Ok(ns.clone());
    }
    let engine_module = self.records[id].engine_module.ok_or_else(|| {
      ErrorEnvelope::internal("namespace requested before linking")
    })?;
    let ns = ctx.module_namespace(engine_module).map_err(|js_err| {
      let env: ErrorEnvelope = js_err.into();
      self.fail(id, env.clone());
      env
    })?;
    self.records[id].namespace = Some(ns.clone());
    Ok(ns)
  }

  /// The set of names `export`ed by a record, per the ES linking rules:
  /// local declarations win, star re-exports contribute everything but
  /// `default`, cycles are walked once.
  pub fn exported_names(&self, id: ModuleId) -> Vec<String> {
    let mut visited = HashSet::new();
    self.exported_names_inner(id, &mut visited)
  }

  fn exported_names_inner(
    &self,
    id: ModuleId,
    visited: &mut HashSet<ModuleId>,
  ) -> Vec<String> {
    if !visited.insert(id) {
      return Vec::new();
    }
    let record = &self.records[id];

    if record.format == RecordFormat::Cjs {
      return match &record.namespace {
        Some(Value::Object(ns)) => ns.keys().cloned().collect(),
        _ => Vec::new(),
      };
    }

    let info = &record.info;
    let mut names: Vec<String> = Vec::new();
    let mut push = |name: String, names: &mut Vec<String>| {
      if !names.contains(&name) {
        names.push(name);
      }
    };
    for name in &info.local_exports {
      push(name.clone(), &mut names);
    }
    if info.has_default_export {
      push("default".to_string(), &mut names);
    }
    for (name, _) in &info.named_reexports {
      push(name.clone(), &mut names);
    }
    for (name, _) in &info.star_as_reexports {
      push(name.clone(), &mut names);
    }
    for source in &info.star_reexports {
      let Some(&dep) = record.deps.get(source) else {
        continue;
      };
      for name in self.exported_names_inner(dep, visited) {
        if name != "default" {
          push(name, &mut names);
        }
      }
    }
    names
  }

  fn fail(&mut self, id: ModuleId, err: ErrorEnvelope) {
    let record = &mut self.records[id];
    record.state = EvalState::Error;
    if record.error.is_none() {
      record.error = Some(err);
    }
  }

  fn sticky(&self, id: ModuleId) -> Result<ModuleId, ErrorEnvelope> {
    match &self.records[id].error {
      Some(err) => Err(err.clone()),
      None => Ok(id),
    }
  }
}

/// Scope for one CommonJS body: every literal require was resolved before
/// evaluation started, so lookups never re-enter the engine.
struct PreparedCjsScope {
  filename: String,
  dirname: String,
  resolved: HashMap<String, Result<Value, ErrorEnvelope>>,
}

impl CommonJsScope for PreparedCjsScope {
  fn filename(&self) -> &str {
    &self.filename
  }

  fn dirname(&self) -> &str {
    &self.dirname
  }

  fn require(&mut self, specifier: &str) -> Result<Value, ErrorEnvelope> {
    match self.resolved.get(specifier) {
      Some(result) => result.clone(),
      None => Err(ErrorEnvelope::module_load(
        specifier,
        ErrorEnvelope::new(
          ErrorKind::ModuleLoad,
          "Error",
          format!("Cannot require {specifier:?}: not statically resolvable"),
        ),
      )),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::engine::InterruptHandle;
  use crate::error::JsError;
  use crate::engine::OpId;
  use crate::engine::PendingCall;
  use crate::engine::TerminateReason;
  use pretty_assertions::assert_eq;
  use std::cell::Cell;
  use std::cell::RefCell;
  use std::sync::Arc;
  use std::task::Poll;

  /// Loader over a static table, counting fetches per specifier.
  #[derive(Default)]
  struct TableLoader {
    sources: HashMap<String, LoaderResult>,
    errors: HashMap<String, ErrorEnvelope>,
    fetches: Rc<RefCell<HashMap<String, u32>>>,
  }

  impl TableLoader {
    fn with(mut self, specifier: &str, code: &str) -> Self {
      self.sources.insert(
        specifier.to_string(),
        LoaderResult {
          code: code.to_string(),
          resolve_dir: "/src".to_string(),
          filename: Some(format!("{}.resolved", specifier)),
          format: None,
          static_hint: None,
        },
      );
      self
    }

    fn with_cjs(mut self, specifier: &str, code: &str) -> Self {
      self.sources.insert(
        specifier.to_string(),
        LoaderResult {
          code: code.to_string(),
          resolve_dir: "/src".to_string(),
          filename: Some(format!("{}.resolved", specifier)),
          format: Some("cjs".to_string()),
          static_hint: None,
        },
      );
      self
    }

    fn with_error(mut self, specifier: &str, err: ErrorEnvelope) -> Self {
      self.errors.insert(specifier.to_string(), err);
      self
    }
  }

  impl ModuleLoader for TableLoader {
    fn load(
      &self,
      specifier: &str,
      _importer: &Importer,
    ) -> LocalBoxFuture<'static, Result<LoaderResult, ErrorEnvelope>> {
      *self
        .fetches
        .borrow_mut()
        .entry(specifier.to_string())
        .or_insert(0) += 1;
      let result = match self.errors.get(specifier) {
        Some(err) => Err(err.clone()),
        None => match self.sources.get(specifier) {
          Some(loaded) => Ok(loaded.clone()),
          None => Err(ErrorEnvelope::new(
            ErrorKind::ModuleLoad,
            "NotFoundError",
            format!("module not found: {specifier}"),
          )),
        },
      };
      Box::pin(async move { result })
    }
  }

  struct NoopInterrupt;
  impl InterruptHandle for NoopInterrupt {
    fn terminate(&self, _reason: TerminateReason) {}
  }

  type CjsBody =
    Box<dyn Fn(&mut dyn CommonJsScope) -> Result<Value, JsError>>;

  /// Just enough of a context for graph tests: modules are registered and
  /// "evaluated" by bookkeeping; CJS bodies and ES namespaces come from
  /// test-registered tables.
  #[derive(Default)]
  struct MockContext {
    next_module: Cell<EngineModule>,
    registered: RefCell<Vec<String>>,
    evaluated: RefCell<Vec<String>>,
    names: HashMap<EngineModule, String>,
    cjs_bodies: HashMap<String, CjsBody>,
    esm_namespaces: HashMap<String, Value>,
  }

  impl MockContext {
    fn body(mut self, canonical: &str, body: CjsBody) -> Self {
      self.cjs_bodies.insert(canonical.to_string(), body);
      self
    }

    fn namespace_of(mut self, canonical: &str, ns: Value) -> Self {
      self.esm_namespaces.insert(canonical.to_string(), ns);
      self
    }
  }

  impl JsContext for MockContext {
    fn execute_script(
      &mut self,
      _filename: &str,
      _source: &str,
    ) -> Result<(), JsError> {
      Ok(())
    }

    fn poll_event_loop(
      &mut self,
      _cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), JsError>> {
      Poll::Ready(Ok(()))
    }

    fn has_pending_work(&self) -> bool {
      false
    }

    fn resolve_op(
      &mut self,
      _op: OpId,
      _result: Result<Value, ErrorEnvelope>,
    ) {
    }

    fn module_new(
      &mut self,
      _main: bool,
      name: &str,
      _source: &str,
      _info: &ModuleInfo,
    ) -> Result<EngineModule, JsError> {
      let id = self.next_module.get();
      self.next_module.set(id + 1);
      self.names.insert(id, name.to_string());
      self.registered.borrow_mut().push(name.to_string());
      Ok(id)
    }

    fn module_synthetic(
      &mut self,
      name: &str,
      exports: Value,
    ) -> Result<EngineModule, JsError> {
      let id = self.next_module.get();
      self.next_module.set(id + 1);
      self.names.insert(id, name.to_string());
      self.esm_namespaces.insert(name.to_string(), exports);
      Ok(id)
    }

    fn module_instantiate(
      &mut self,
      _root: EngineModule,
      _resolve: &mut dyn FnMut(EngineModule, &str) -> Option<EngineModule>,
    ) -> Result<(), JsError> {
      Ok(())
    }

    fn module_evaluate(
      &mut self,
      root: EngineModule,
    ) -> Result<(), JsError> {
      let name = self.names[&root].clone();
      self.evaluated.borrow_mut().push(name);
      Ok(())
    }

    fn module_namespace(
      &mut self,
      module: EngineModule,
    ) -> Result<Value, JsError> {
      let name = &self.names[&module];
      Ok(
        self
          .esm_namespaces
          .get(name)
          .cloned()
          .unwrap_or_else(|| Value::Object(Object::new())),
      )
    }

    fn evaluate_cjs(
      &mut self,
      filename: &str,
      _source: &str,
      scope: &mut dyn CommonJsScope,
    ) -> Result<Value, JsError> {
      self.evaluated.borrow_mut().push(filename.to_string());
      match self.cjs_bodies.get(filename) {
        Some(body) => body(scope),
        None => Ok(Value::Object(Object::new())),
      }
    }

    fn call_function(
      &mut self,
      _callback: u64,
      _args: Vec<Value>,
    ) -> Result<PendingCall, JsError> {
      Ok(0)
    }

    fn take_call_result(
      &mut self,
      _call: PendingCall,
    ) -> Option<Result<Value, JsError>> {
      None
    }

    fn set_global(&mut self, _name: &str, _value: Value) {}

    fn get_global(&mut self, _name: &str) -> Value {
      Value::Undefined
    }

    fn interrupt_handle(&self) -> Arc<dyn InterruptHandle> {
      Arc::new(NoopInterrupt)
    }

    fn heap_used(&self) -> usize {
      0
    }

    fn terminated(&self) -> Option<TerminateReason> {
      None
    }
  }

  fn entry_importer() -> Importer {
    Importer {
      path: "/src/main.js".to_string(),
      resolve_dir: "/src".to_string(),
    }
  }

  fn load(
    graph: &mut ModuleGraph,
    specifier: &str,
  ) -> Result<ModuleId, ErrorEnvelope> {
    futures::executor::block_on(graph.load(specifier, &entry_importer()))
  }

  #[test]
  fn loader_is_called_once_per_module() {
    let loader = TableLoader::default()
      .with("./a.js", "import './b.js'; export const a = 1;")
      .with("./b.js", "export const b = 2;");
    let fetches = loader.fetches.clone();
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));

    let a1 = load(&mut graph, "./a.js").unwrap();
    let a2 = load(&mut graph, "./a.js").unwrap();
    let b = load(&mut graph, "./b.js").unwrap();
    assert_eq!(a1, a2);
    assert_eq!(fetches.borrow()["./a.js"], 1);
    assert_eq!(fetches.borrow()["./b.js"], 1);
    assert_eq!(graph.record(b).canonical, "/src/b.js.resolved");
  }

  #[test]
  fn cyclic_imports_terminate_with_one_fetch_each() {
    let loader = TableLoader::default()
      .with("./a.js", "import './b.js'; export const a = 1;")
      .with("./b.js", "import './a.js'; export const b = 2;");
    let fetches = loader.fetches.clone();
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));

    let a = load(&mut graph, "./a.js").unwrap();
    assert_eq!(fetches.borrow()["./a.js"], 1);
    assert_eq!(fetches.borrow()["./b.js"], 1);
    let mut ctx = MockContext::default();
    graph.ensure_evaluated(&mut ctx, a).unwrap();
    assert_eq!(graph.record(a).state, EvalState::Evaluated);
  }

  #[test]
  fn no_loader_is_a_fixed_error() {
    let mut graph = ModuleGraph::new();
    let err = load(&mut graph, "./a.js").unwrap_err();
    assert_eq!(err.kind, ErrorKind::NoModuleLoader);
    assert_eq!(err.message, "No module loader registered");
  }

  #[test]
  fn builtin_fallback_without_loader() {
    let mut graph = ModuleGraph::new();
    let id = load(&mut graph, "node:crypto").unwrap();
    let record = graph.record(id);
    assert_eq!(record.format, RecordFormat::Builtin);
    assert!(record.source.contains("randomUUID"));
    // Bare alias shares the record.
    let bare = load(&mut graph, "crypto").unwrap();
    assert_eq!(id, bare);
  }

  #[test]
  fn loader_override_beats_builtin() {
    let loader = TableLoader::default()
      .with("node:events", "export class EventEmitter { custom = true; }");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let id = load(&mut graph, "node:events").unwrap();
    assert_eq!(graph.record(id).format, RecordFormat::Esm);
    assert!(graph.record(id).source.contains("custom = true"));
  }

  #[test]
  fn loader_failure_on_builtin_selects_fallback() {
    let loader = TableLoader::default().with_error(
      "node:crypto",
      ErrorEnvelope::new(ErrorKind::ModuleLoad, "Error", "not handled"),
    );
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let id = load(&mut graph, "node:crypto").unwrap();
    assert_eq!(graph.record(id).format, RecordFormat::Builtin);
  }

  #[test]
  fn loader_errors_propagate_verbatim_and_stick() {
    let loader = TableLoader::default().with_error(
      "./broken.js",
      ErrorEnvelope::new(ErrorKind::UserError, "NotFoundError", "no such file"),
    );
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let first = load(&mut graph, "./broken.js").unwrap_err();
    assert_eq!(first.kind, ErrorKind::ModuleLoad);
    assert_eq!(first.name, "NotFoundError");
    assert_eq!(first.message, "no such file");
    let second = load(&mut graph, "./broken.js").unwrap_err();
    assert_eq!(first, second);
  }

  #[test]
  fn dep_failure_sticks_to_the_importer() {
    let loader = TableLoader::default()
      .with("./top.js", "import './missing.js';");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let id = load(&mut graph, "./top.js").unwrap_err();
    assert_eq!(id.kind, ErrorKind::ModuleLoad);
    // The record exists, failed, and re-surfaces the same error.
    let again = load(&mut graph, "./top.js").unwrap_err();
    assert_eq!(id, again);
  }

  #[test]
  fn export_star_chain_through_cjs() {
    // A (cjs) re-exports B (cjs) which re-exports C (esm).
    let loader = TableLoader::default()
      .with_cjs("A", "__exportStar(require(\"B\"), exports);")
      .with_cjs("B", "__exportStar(require(\"C\"), exports);")
      .with("C", "export const deepValue = 'found-it';");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));

    let star_body = |dep: &'static str| -> CjsBody {
      Box::new(move |scope| {
        let required = scope.require(dep).map_err(JsError::from)?;
        let mut exports = Object::new();
        interop::export_star(&required, &mut exports);
        Ok(Value::Object(exports))
      })
    };
    let mut ctx = MockContext::default()
      .body("/src/A.resolved", star_body("B"))
      .body("/src/B.resolved", star_body("C"))
      .namespace_of(
        "/src/C.resolved",
        Value::object([
          ("deepValue".to_string(), Value::String("found-it".into())),
          ("default".to_string(), Value::Undefined),
        ]),
      );

    let a = load(&mut graph, "A").unwrap();
    graph.ensure_evaluated(&mut ctx, a).unwrap();

    // `import { deepValue } from "A"`.
    let names = graph.exported_names(a);
    assert!(names.contains(&"deepValue".to_string()));
    let ns = graph.namespace(&mut ctx, a).unwrap();
    assert_eq!(ns.get("deepValue"), Some(&Value::String("found-it".into())));
  }

  #[test]
  fn require_of_esm_returns_namespace() {
    let loader = TableLoader::default()
      .with("esm", "export default 'd'; export const e = 1;");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let mut ctx = MockContext::default().namespace_of(
      "/src/esm.resolved",
      Value::object([
        ("default".to_string(), Value::String("d".into())),
        ("e".to_string(), Value::Number(1.0)),
      ]),
    );
    let value = futures::executor::block_on(graph.require(
      &mut ctx,
      "esm",
      &entry_importer(),
    ))
    .unwrap();
    assert_eq!(value.get("default"), Some(&Value::String("d".into())));
    assert_eq!(value.get("e"), Some(&Value::Number(1.0)));
  }

  #[test]
  fn import_of_cjs_object_exports() {
    let loader =
      TableLoader::default().with_cjs("cjs", "module.exports = { a: 1 };");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let mut ctx = MockContext::default().body(
      "/src/cjs.resolved",
      Box::new(|_scope| {
        Ok(Value::object([("a".to_string(), Value::Number(1.0))]))
      }),
    );
    let value = futures::executor::block_on(graph.dynamic_import(
      &mut ctx,
      "cjs",
      &entry_importer(),
    ))
    .unwrap();
    // `import X from cjs; X.a === 1`
    assert_eq!(value.get("default").unwrap().get("a"), Some(&Value::Number(1.0)));
    // `import { a } from cjs` also works.
    assert_eq!(value.get("a"), Some(&Value::Number(1.0)));
  }

  #[test]
  fn exported_names_star_excludes_default_and_local_wins() {
    let loader = TableLoader::default()
      .with(
        "outer",
        "export const local = 1;\nexport * from 'inner';",
      )
      .with(
        "inner",
        "export const local = 2;\nexport const inner = 3;\nexport default 4;",
      );
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let outer = load(&mut graph, "outer").unwrap();
    let names = graph.exported_names(outer);
    assert_eq!(names, vec!["local".to_string(), "inner".to_string()]);
  }

  #[test]
  fn cjs_evaluation_is_post_order_and_cached() {
    let loader = TableLoader::default()
      .with_cjs("a", "require('b'); module.exports = { a: 1 };")
      .with_cjs("b", "module.exports = { b: 1 };");
    let mut graph = ModuleGraph::new();
    graph.set_loader(Some(Rc::new(loader)));
    let mut ctx = MockContext::default();
    let a = load(&mut graph, "a").unwrap();
    graph.ensure_evaluated(&mut ctx, a).unwrap();
    assert_eq!(
      *ctx.evaluated.borrow(),
      vec!["/src/b.resolved".to_string(), "/src/a.resolved".to_string()]
    );
    // Second require of `b` reuses the evaluated record.
    let b = load(&mut graph, "b").unwrap();
    graph.ensure_evaluated(&mut ctx, b).unwrap();
    assert_eq!(ctx.evaluated.borrow().len(), 2);
  }
}
