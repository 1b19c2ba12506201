// Copyright 2024-2026 the jsbox authors. MIT license.

//! The namespace registry: maps namespace ids to cached isolates, enforces
//! the isolate capacity, and owns the soft/hard dispose state machine.
//!
//! Namespace ids are byte-preserving (the empty string is a valid,
//! distinct key). At most one *active* isolate per namespace; reuse
//! requires the entry to be disposed. Construction options freeze on first
//! create — a reusing `createRuntime` re-registers the connection's
//! callbacks but its construction options are silently ignored.

use crate::bridge::Bridge;
use crate::worker::spawn_isolate;
use crate::worker::IsolateHandle;
use jsbox_core::engine::JsEngine;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol::CreateRuntimeOptions;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NsState {
  Active,
  Disposed,
}

struct NamespaceEntry {
  isolate: IsolateHandle,
  state: NsState,
  disposed_at: Option<Instant>,
  owner: Option<u64>,
  /// Frozen on first create; reuse ignores newly supplied options.
  options: CreateRuntimeOptions,
}

struct AnonymousEntry {
  isolate: IsolateHandle,
  owner: u64,
}

#[derive(Default)]
struct Inner {
  namespaces: HashMap<String, NamespaceEntry>,
  anonymous: HashMap<String, AnonymousEntry>,
}

pub struct Registry {
  engine: Arc<dyn JsEngine>,
  max_isolates: usize,
  // One coarse critical section per operation; creation awaits inside it
  // so capacity checks and inserts cannot interleave.
  inner: Mutex<Inner>,
  isolates_created: AtomicU64,
}

impl Registry {
  pub fn new(engine: Arc<dyn JsEngine>, max_isolates: usize) -> Registry {
    assert!(max_isolates > 0, "maxIsolates must be strictly positive");
    Registry {
      engine,
      max_isolates,
      inner: Mutex::new(Inner::default()),
      isolates_created: AtomicU64::new(0),
    }
  }

  pub fn isolates_created(&self) -> u64 {
    self.isolates_created.load(Ordering::Relaxed)
  }

  /// `createRuntime`. Returns the runtime id and whether a cached isolate
  /// was reused.
  pub async fn create_runtime(
    &self,
    conn_id: u64,
    options: CreateRuntimeOptions,
    namespace: Option<String>,
    bridge: Bridge,
  ) -> Result<(String, bool), ErrorEnvelope> {
    let mut inner = self.inner.lock().await;

    let Some(namespace) = namespace else {
      self.make_room(&mut inner)?;
      let isolate = self.spawn(options, bridge).await?;
      let id = isolate.id().to_string();
      inner
        .anonymous
        .insert(id.clone(), AnonymousEntry { isolate, owner: conn_id });
      return Ok((id, false));
    };

    match inner.namespaces.get_mut(&namespace) {
      Some(entry) if entry.state == NsState::Active => {
        Err(ErrorEnvelope::namespace_busy(&namespace))
      }
      Some(entry) if entry.isolate.is_errored() => {
        // The cached isolate died (OOM); reuse gets a fresh construction.
        entry.isolate.shutdown();
        let isolate = self.spawn(options.clone(), bridge).await?;
        let id = isolate.id().to_string();
        let entry = inner.namespaces.get_mut(&namespace).expect("checked");
        *entry = NamespaceEntry {
          isolate,
          state: NsState::Active,
          disposed_at: None,
          owner: Some(conn_id),
          options,
        };
        Ok((id, false))
      }
      Some(entry) => {
        // Reuse preserves the original construction: only the callback
        // registration (capabilities) follows the new connection.
        entry.state = NsState::Active;
        entry.disposed_at = None;
        entry.owner = Some(conn_id);
        let isolate = entry.isolate.clone();
        let capabilities = options.capabilities;
        let id = isolate.id().to_string();
        drop(inner);
        isolate.rebind(bridge, capabilities).await;
        Ok((id, true))
      }
      None => {
        self.make_room(&mut inner)?;
        let isolate = self.spawn(options.clone(), bridge).await?;
        let id = isolate.id().to_string();
        inner.namespaces.insert(
          namespace,
          NamespaceEntry {
            isolate,
            state: NsState::Active,
            disposed_at: None,
            owner: Some(conn_id),
            options,
          },
        );
        Ok((id, false))
      }
    }
  }

  async fn spawn(
    &self,
    options: CreateRuntimeOptions,
    bridge: Bridge,
  ) -> Result<IsolateHandle, ErrorEnvelope> {
    let id = uuid::Uuid::new_v4().to_string();
    let isolate =
      spawn_isolate(self.engine.clone(), id, options, bridge).await?;
    self.isolates_created.fetch_add(1, Ordering::Relaxed);
    Ok(isolate)
  }

  /// Evicts the least recently disposed entry when at capacity. Active
  /// entries are never evicted.
  fn make_room(&self, inner: &mut Inner) -> Result<(), ErrorEnvelope> {
    let count = inner.namespaces.len() + inner.anonymous.len();
    if count < self.max_isolates {
      return Ok(());
    }
    let victim = inner
      .namespaces
      .iter()
      .filter(|(_, entry)| entry.state == NsState::Disposed)
      .min_by_key(|(_, entry)| entry.disposed_at)
      .map(|(ns, _)| ns.clone());
    match victim {
      Some(ns) => {
        debug!("evicting namespace {ns:?}");
        if let Some(entry) = inner.namespaces.remove(&ns) {
          entry.isolate.shutdown();
        }
        Ok(())
      }
      None => Err(ErrorEnvelope::capacity_exhausted(self.max_isolates)),
    }
  }

  /// Routes `eval`/`dispatchRequest` to an isolate by runtime id.
  pub async fn find(&self, runtime_id: &str) -> Option<IsolateHandle> {
    let inner = self.inner.lock().await;
    if let Some(entry) = inner.anonymous.get(runtime_id) {
      return Some(entry.isolate.clone());
    }
    inner
      .namespaces
      .values()
      .find(|entry| entry.isolate.id() == runtime_id)
      .map(|entry| entry.isolate.clone())
  }

  /// `dispose`: soft for namespaced isolates, hard otherwise. Unknown ids
  /// are a no-op.
  pub async fn dispose(&self, runtime_id: &str) {
    let mut inner = self.inner.lock().await;
    if let Some(entry) = inner.anonymous.remove(runtime_id) {
      entry.isolate.shutdown();
      return;
    }
    let mut target = None;
    for entry in inner.namespaces.values_mut() {
      if entry.isolate.id() == runtime_id && entry.state == NsState::Active {
        entry.state = NsState::Disposed;
        entry.disposed_at = Some(Instant::now());
        entry.owner = None;
        target = Some(entry.isolate.clone());
        break;
      }
    }
    drop(inner);
    if let Some(isolate) = target {
      isolate.soft_dispose().await;
    }
  }

  /// Connection teardown: namespaced isolates soft-dispose, anonymous ones
  /// are destroyed.
  pub async fn connection_closed(&self, conn_id: u64) {
    let mut inner = self.inner.lock().await;
    let orphaned: Vec<String> = inner
      .anonymous
      .iter()
      .filter(|(_, entry)| entry.owner == conn_id)
      .map(|(id, _)| id.clone())
      .collect();
    for id in orphaned {
      if let Some(entry) = inner.anonymous.remove(&id) {
        entry.isolate.shutdown();
      }
    }
    let mut soft = Vec::new();
    for entry in inner.namespaces.values_mut() {
      if entry.owner == Some(conn_id) && entry.state == NsState::Active {
        entry.state = NsState::Disposed;
        entry.disposed_at = Some(Instant::now());
        entry.owner = None;
        soft.push(entry.isolate.clone());
      }
    }
    drop(inner);
    for isolate in soft {
      isolate.soft_dispose().await;
    }
  }

  /// Daemon shutdown: every isolate goes away.
  pub async fn shutdown_all(&self) {
    let mut inner = self.inner.lock().await;
    for (_, entry) in inner.anonymous.drain() {
      entry.isolate.shutdown();
    }
    for (_, entry) in inner.namespaces.drain() {
      entry.isolate.shutdown();
    }
  }

  /// The frozen construction options of a namespace entry, for callers
  /// that need to inspect what reuse preserved.
  pub async fn frozen_options(
    &self,
    namespace: &str,
  ) -> Option<CreateRuntimeOptions> {
    let inner = self.inner.lock().await;
    inner.namespaces.get(namespace).map(|entry| entry.options.clone())
  }
}
