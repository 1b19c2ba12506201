// Copyright 2024-2026 the jsbox authors. MIT license.

//! A typed client over the bridge protocol, plus the host-side callback
//! fixture ([`TestHost`]) integration tests program with closures: module
//! loader, console sink, fetch, custom functions, filesystem.

use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol::CallBody;
use jsbox_core::protocol::ConsoleEntry;
use jsbox_core::protocol::CreateRuntimeOptions;
use jsbox_core::protocol::EvalOptions;
use jsbox_core::protocol::FsOp;
use jsbox_core::protocol::HostCall;
use jsbox_core::protocol::Importer;
use jsbox_core::protocol::LoaderResult;
use jsbox_core::protocol::ReplyBody;
use jsbox_core::protocol::RequestSpec;
use jsbox_core::protocol::ResponseSpec;
use jsbox_core::protocol::Stats;
use jsbox_core::value::Value;
use jsbox_runtime::streams::boxed;
use jsbox_runtime::streams::RemoteStream;
use jsbox_runtime::Bridge;
use jsbox_runtime::CallHandler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

type LoaderFn = Box<
  dyn Fn(&str, &Importer) -> Result<LoaderResult, ErrorEnvelope>
    + Send
    + Sync,
>;
type FetchFn = Box<
  dyn Fn(RequestSpec) -> Result<(ResponseSpec, Option<Vec<Value>>), ErrorEnvelope>
    + Send
    + Sync,
>;
type FsFn = Box<dyn Fn(FsOp) -> Result<Value, ErrorEnvelope> + Send + Sync>;
type CustomFn =
  Box<dyn Fn(Vec<Value>) -> CustomReply + Send + Sync>;

/// What a host custom function hands back: a plain value, or a chunk
/// sequence marshalled as an async iterator.
pub enum CustomReply {
  Value(Result<Value, ErrorEnvelope>),
  Stream(Vec<Result<Value, ErrorEnvelope>>),
}

/// Client-side callback fixture. Register closures before connecting;
/// every host callback the daemon dispatches lands here.
#[derive(Default)]
pub struct TestHost {
  pub console: Mutex<Vec<ConsoleEntry>>,
  loader: Mutex<Option<LoaderFn>>,
  pub loader_calls: Mutex<Vec<String>>,
  fetch: Mutex<Option<FetchFn>>,
  fs: Mutex<Option<FsFn>>,
  playwright: Mutex<Option<FsFn>>,
  custom: Mutex<HashMap<String, CustomFn>>,
  bridge: OnceLock<Bridge>,
}

impl TestHost {
  pub fn new() -> Arc<TestHost> {
    Arc::new(TestHost::default())
  }

  pub fn set_loader(
    &self,
    loader: impl Fn(&str, &Importer) -> Result<LoaderResult, ErrorEnvelope>
      + Send
      + Sync
      + 'static,
  ) {
    *self.loader.lock() = Some(Box::new(loader));
  }

  /// Table-driven loader: specifier → (code, format).
  pub fn set_loader_table(
    &self,
    table: HashMap<String, (String, Option<String>)>,
  ) {
    self.set_loader(move |specifier, _importer| {
      match table.get(specifier) {
        Some((code, format)) => Ok(LoaderResult {
          code: code.clone(),
          resolve_dir: "/src".to_string(),
          filename: Some(specifier.to_string()),
          format: format.clone(),
          static_hint: None,
        }),
        None => Err(ErrorEnvelope::new(
          jsbox_core::error::ErrorKind::ModuleLoad,
          "NotFoundError",
          format!("module not found: {specifier}"),
        )),
      }
    });
  }

  pub fn set_fetch(
    &self,
    fetch: impl Fn(RequestSpec) -> Result<(ResponseSpec, Option<Vec<Value>>), ErrorEnvelope>
      + Send
      + Sync
      + 'static,
  ) {
    *self.fetch.lock() = Some(Box::new(fetch));
  }

  pub fn set_fs(
    &self,
    fs: impl Fn(FsOp) -> Result<Value, ErrorEnvelope> + Send + Sync + 'static,
  ) {
    *self.fs.lock() = Some(Box::new(fs));
  }

  pub fn set_custom(
    &self,
    name: &str,
    f: impl Fn(Vec<Value>) -> CustomReply + Send + Sync + 'static,
  ) {
    self.custom.lock().insert(name.to_string(), Box::new(f));
  }

  pub fn console_lines(&self) -> Vec<String> {
    self.console.lock().iter().map(|e| e.stdout.clone()).collect()
  }

  fn register_chunks(
    &self,
    chunks: Vec<Result<Value, ErrorEnvelope>>,
  ) -> Result<u64, ErrorEnvelope> {
    let bridge = self
      .bridge
      .get()
      .ok_or_else(|| ErrorEnvelope::internal("host not connected"))?;
    Ok(
      bridge
        .streams()
        .register_source(boxed(futures::stream::iter(chunks))),
    )
  }
}

#[async_trait::async_trait]
impl CallHandler for TestHost {
  async fn handle(&self, call: CallBody) -> Result<ReplyBody, ErrorEnvelope> {
    let CallBody::Host(host_call) = call else {
      return Err(ErrorEnvelope::protocol(
        "client received a non-host call",
      ));
    };
    match host_call {
      HostCall::ConsoleEntry { entry, .. } => {
        self.console.lock().push(entry);
        Ok(ReplyBody::Unit)
      }
      HostCall::ModuleLoad { specifier, importer, .. } => {
        self.loader_calls.lock().push(specifier.clone());
        let loader = self.loader.lock();
        match loader.as_ref() {
          Some(loader) => Ok(ReplyBody::ModuleSource(loader(
            &specifier, &importer,
          )?)),
          None => Err(ErrorEnvelope::internal(
            "host has no module loader registered",
          )),
        }
      }
      HostCall::Fetch { request, .. } => {
        let fetch = self.fetch.lock();
        let Some(fetch) = fetch.as_ref() else {
          return Err(ErrorEnvelope::internal("host has no fetch handler"));
        };
        let (mut response, body) = fetch(request)?;
        drop(fetch);
        if let Some(chunks) = body {
          response.body =
            Some(self.register_chunks(chunks.into_iter().map(Ok).collect())?);
        }
        Ok(ReplyBody::Response(response))
      }
      HostCall::CustomFn { name, args, .. } => {
        let reply = {
          let custom = self.custom.lock();
          let Some(f) = custom.get(&name) else {
            return Err(ErrorEnvelope::new(
              jsbox_core::error::ErrorKind::UserError,
              "TypeError",
              format!("{name} is not registered on the host"),
            ));
          };
          f(args)
        };
        match reply {
          CustomReply::Value(result) => Ok(ReplyBody::Value(result?)),
          CustomReply::Stream(chunks) => Ok(ReplyBody::Value(
            Value::IteratorRef(self.register_chunks(chunks)?),
          )),
        }
      }
      HostCall::Fs { op, .. } => {
        let fs = self.fs.lock();
        match fs.as_ref() {
          Some(fs) => Ok(ReplyBody::Value(fs(op)?)),
          None => Err(ErrorEnvelope::internal("host has no fs handler")),
        }
      }
      HostCall::Playwright { payload, .. } => {
        let playwright = self.playwright.lock();
        match playwright.as_ref() {
          Some(_handler) => Ok(ReplyBody::Value(payload)),
          None => {
            Err(ErrorEnvelope::internal("host has no playwright handler"))
          }
        }
      }
      HostCall::TestEvent { .. } => Ok(ReplyBody::Unit),
    }
  }
}

/// Typed wrapper over one daemon connection.
pub struct Client {
  bridge: Bridge,
  host: Arc<TestHost>,
}

impl Client {
  pub async fn connect(
    socket_path: &Path,
    host: Arc<TestHost>,
  ) -> std::io::Result<Client> {
    let stream = tokio::net::UnixStream::connect(socket_path).await?;
    let bridge = Bridge::new(stream, host.clone() as Arc<dyn CallHandler>);
    let _ = host.bridge.set(bridge.clone());
    Ok(Client { bridge, host })
  }

  pub fn host(&self) -> &Arc<TestHost> {
    &self.host
  }

  pub fn bridge(&self) -> &Bridge {
    &self.bridge
  }

  pub async fn create_runtime(
    &self,
    options: CreateRuntimeOptions,
    namespace: Option<&str>,
  ) -> Result<(String, bool), ErrorEnvelope> {
    match self
      .bridge
      .call(CallBody::CreateRuntime {
        options,
        namespace: namespace.map(str::to_string),
      })
      .await?
    {
      ReplyBody::RuntimeCreated { id, reused } => Ok((id, reused)),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn eval(
    &self,
    runtime_id: &str,
    code: &str,
    options: EvalOptions,
  ) -> Result<(), ErrorEnvelope> {
    match self
      .bridge
      .call(CallBody::Eval {
        runtime_id: runtime_id.to_string(),
        code: code.to_string(),
        options,
      })
      .await?
    {
      ReplyBody::Unit => Ok(()),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn dispatch(
    &self,
    runtime_id: &str,
    request: RequestSpec,
  ) -> Result<ResponseSpec, ErrorEnvelope> {
    match self
      .bridge
      .call(CallBody::DispatchRequest {
        runtime_id: runtime_id.to_string(),
        request,
      })
      .await?
    {
      ReplyBody::Response(response) => Ok(response),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn dispose(&self, runtime_id: &str) -> Result<(), ErrorEnvelope> {
    match self
      .bridge
      .call(CallBody::Dispose { runtime_id: runtime_id.to_string() })
      .await?
    {
      ReplyBody::Unit => Ok(()),
      other => Err(unexpected(&other)),
    }
  }

  pub async fn stats(&self) -> Result<Stats, ErrorEnvelope> {
    match self.bridge.call(CallBody::GetStats).await? {
      ReplyBody::Stats(stats) => Ok(stats),
      other => Err(unexpected(&other)),
    }
  }

  /// Opens a consumer for a stream handle received from the daemon (e.g. a
  /// response body).
  pub fn open_stream(&self, handle: u64) -> RemoteStream {
    self.bridge.streams().open_sink(handle)
  }

  /// Disconnects. The daemon soft-disposes namespaced isolates and
  /// destroys anonymous ones.
  pub fn close(self) {
    self.bridge.close();
  }
}

fn unexpected(reply: &ReplyBody) -> ErrorEnvelope {
  ErrorEnvelope::protocol(format!("unexpected reply {reply:?}"))
}
