// Copyright 2024-2026 the jsbox authors. MIT license.

//! The daemon control plane: binds the Unix socket, authenticates peers,
//! spawns one bridge per connection and routes control calls to the
//! registry and isolates. The daemon keeps no state across restarts; a
//! stale socket file left by a previous process is removed on startup.

use crate::bridge::Bridge;
use crate::bridge::CallHandler;
use crate::registry::Registry;
use jsbox_core::engine::JsEngine;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol::CallBody;
use jsbox_core::protocol::ReplyBody;
use jsbox_core::protocol::Stats;
use log::debug;
use log::info;
use log::warn;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct DaemonOptions {
  pub socket_path: PathBuf,
  pub max_isolates: usize,
}

#[derive(Default)]
pub struct DaemonStats {
  requests_processed: AtomicU64,
  active_connections: AtomicU64,
}

/// A running daemon. Dropping it does not stop the accept loop; call
/// [`Daemon::shutdown`].
pub struct Daemon {
  socket_path: PathBuf,
  registry: Arc<Registry>,
  stats: Arc<DaemonStats>,
  cancel: CancellationToken,
}

pub async fn start_daemon(
  options: DaemonOptions,
  engine: Arc<dyn JsEngine>,
) -> Result<Daemon, ErrorEnvelope> {
  if options.socket_path.exists() {
    // Stale socket from a dead daemon; nothing persists across restarts.
    let _ = std::fs::remove_file(&options.socket_path);
  }
  let listener = UnixListener::bind(&options.socket_path).map_err(|err| {
    ErrorEnvelope::internal(format!(
      "failed to bind {}: {err}",
      options.socket_path.display()
    ))
  })?;
  info!("daemon listening on {}", options.socket_path.display());

  let registry = Arc::new(Registry::new(engine, options.max_isolates));
  let stats = Arc::new(DaemonStats::default());
  let cancel = CancellationToken::new();

  let accept_registry = registry.clone();
  let accept_stats = stats.clone();
  let accept_cancel = cancel.clone();
  tokio::spawn(async move {
    let mut next_conn = 1u64;
    loop {
      let accepted = tokio::select! {
        _ = accept_cancel.cancelled() => break,
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok((stream, _addr)) => {
          if !peer_is_same_user(&stream) {
            warn!("rejecting connection from foreign uid");
            continue;
          }
          let conn_id = next_conn;
          next_conn += 1;
          serve_connection(
            stream,
            conn_id,
            accept_registry.clone(),
            accept_stats.clone(),
          );
        }
        Err(err) => {
          warn!("accept failed: {err}");
          break;
        }
      }
    }
  });

  Ok(Daemon { socket_path: options.socket_path, registry, stats, cancel })
}

impl Daemon {
  pub fn socket_path(&self) -> &Path {
    &self.socket_path
  }

  pub fn stats(&self) -> Stats {
    Stats {
      total_isolates_created: self.registry.isolates_created(),
      total_requests_processed: self
        .stats
        .requests_processed
        .load(Ordering::Relaxed),
      active_connections: self
        .stats
        .active_connections
        .load(Ordering::Relaxed),
    }
  }

  /// Stops accepting, destroys every isolate and unlinks the socket.
  pub async fn shutdown(self) {
    self.cancel.cancel();
    self.registry.shutdown_all().await;
    let _ = std::fs::remove_file(&self.socket_path);
  }
}

/// Same-uid check over `SO_PEERCRED`. The socket is a local trust
/// boundary, not an authentication scheme.
fn peer_is_same_user(stream: &UnixStream) -> bool {
  match stream.peer_cred() {
    // SAFETY: geteuid cannot fail.
    Ok(cred) => cred.uid() == unsafe { libc::geteuid() },
    Err(err) => {
      warn!("failed to read peer credentials: {err}");
      false
    }
  }
}

fn serve_connection(
  stream: UnixStream,
  conn_id: u64,
  registry: Arc<Registry>,
  stats: Arc<DaemonStats>,
) {
  debug!("connection {conn_id} accepted");
  stats.active_connections.fetch_add(1, Ordering::Relaxed);

  let handler = Arc::new(ConnectionHandler {
    conn_id,
    registry: registry.clone(),
    stats: stats.clone(),
    bridge: OnceLock::new(),
  });
  let bridge = Bridge::new(stream, handler.clone() as Arc<dyn CallHandler>);
  handler
    .bridge
    .set(bridge.clone())
    .unwrap_or_else(|_| unreachable!("bridge set exactly once"));

  tokio::spawn(async move {
    bridge.closed().await;
    debug!("connection {conn_id} closed");
    stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    registry.connection_closed(conn_id).await;
  });
}

struct ConnectionHandler {
  conn_id: u64,
  registry: Arc<Registry>,
  stats: Arc<DaemonStats>,
  bridge: OnceLock<Bridge>,
}

#[async_trait::async_trait]
impl CallHandler for ConnectionHandler {
  async fn handle(&self, call: CallBody) -> Result<ReplyBody, ErrorEnvelope> {
    match call {
      CallBody::CreateRuntime { options, namespace } => {
        let bridge =
          self.bridge.get().expect("bridge installed before serving").clone();
        let (id, reused) = self
          .registry
          .create_runtime(self.conn_id, options, namespace, bridge)
          .await?;
        Ok(ReplyBody::RuntimeCreated { id, reused })
      }
      CallBody::Eval { runtime_id, code, options } => {
        let isolate = self
          .registry
          .find(&runtime_id)
          .await
          .ok_or_else(ErrorEnvelope::disposed)?;
        isolate.eval(code, options).await?;
        Ok(ReplyBody::Unit)
      }
      CallBody::DispatchRequest { runtime_id, request } => {
        let isolate = self
          .registry
          .find(&runtime_id)
          .await
          .ok_or_else(ErrorEnvelope::disposed)?;
        let response = isolate.dispatch(request).await?;
        self.stats.requests_processed.fetch_add(1, Ordering::Relaxed);
        Ok(ReplyBody::Response(response))
      }
      CallBody::Dispose { runtime_id } => {
        self.registry.dispose(&runtime_id).await;
        Ok(ReplyBody::Unit)
      }
      CallBody::GetStats => Ok(ReplyBody::Stats(Stats {
        total_isolates_created: self.registry.isolates_created(),
        total_requests_processed: self
          .stats
          .requests_processed
          .load(Ordering::Relaxed),
        active_connections: self
          .stats
          .active_connections
          .load(Ordering::Relaxed),
      })),
      CallBody::Host(_) => Err(ErrorEnvelope::protocol(
        "host callbacks flow daemon-to-client, not client-to-daemon",
      )),
      // Stream control is intercepted by the bridge itself.
      CallBody::StreamPull { .. } | CallBody::StreamCancel { .. } => {
        Err(ErrorEnvelope::protocol("stream control escaped the mux"))
      }
    }
  }
}
