// Copyright 2024-2026 the jsbox authors. MIT license.

//! The RPC mux: one duplex transport, many concurrent calls.
//!
//! Per connection the bridge keeps the two tables the protocol requires —
//! outgoing calls awaiting their terminal reply, and the incoming handler
//! that serves peer calls — plus the stream table shared with the
//! marshaller. A single writer task serializes frames; the reader task
//! routes by frame kind:
//!
//! - `Reply`/`Err` complete the pending call with the same correlation id;
//! - `StreamChunk`/`StreamEnd`/`StreamErr` feed the stream table;
//! - `Call` is either stream control (`StreamPull`/`StreamCancel`, handled
//!   by the table) or dispatched to the registered [`CallHandler`] on its
//!   own task, so a slow handler never blocks the mux.
//!
//! Transport closure fails every pending call with `ConnectionClosed` and
//! error-terminates every open stream.

use crate::streams::StreamTable;
use dashmap::DashMap;
use futures::SinkExt;
use futures::StreamExt;
use jsbox_core::codec::Frame;
use jsbox_core::codec::FrameCodec;
use jsbox_core::codec::FrameKind;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol;
use jsbox_core::protocol::CallBody;
use jsbox_core::protocol::ReplyBody;
use log::debug;
use log::warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Notify;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

/// Serves calls arriving from the peer. The daemon side routes control
/// calls to the registry and workers; the client side serves host
/// callbacks.
#[async_trait::async_trait]
pub trait CallHandler: Send + Sync + 'static {
  async fn handle(&self, call: CallBody) -> Result<ReplyBody, ErrorEnvelope>;
}

/// Cheap clone; all clones speak for the same connection.
#[derive(Clone)]
pub struct Bridge {
  inner: Arc<BridgeInner>,
}

struct BridgeInner {
  next_correlation: AtomicU64,
  pending:
    DashMap<u64, oneshot::Sender<Result<ReplyBody, ErrorEnvelope>>>,
  writer: mpsc::UnboundedSender<Frame>,
  streams: StreamTable,
  closed: AtomicBool,
  closed_notify: Notify,
  stop: CancellationToken,
}

impl Bridge {
  /// Splits the transport and spawns the reader/writer tasks. The handler
  /// serves peer-initiated calls for the life of the connection.
  pub fn new<T>(transport: T, handler: Arc<dyn CallHandler>) -> Bridge
  where
    T: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (read_half, write_half) = tokio::io::split(transport);
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Frame>();

    let stop = CancellationToken::new();
    let inner = Arc::new(BridgeInner {
      next_correlation: AtomicU64::new(1),
      pending: DashMap::new(),
      writer: writer_tx.clone(),
      streams: StreamTable::new(writer_tx),
      closed: AtomicBool::new(false),
      closed_notify: Notify::new(),
      stop: stop.clone(),
    });
    let bridge = Bridge { inner: inner.clone() };

    let writer_stop = stop.clone();
    let mut sink = FramedWrite::new(write_half, FrameCodec::new());
    tokio::spawn(async move {
      loop {
        let frame = tokio::select! {
          _ = writer_stop.cancelled() => break,
          frame = writer_rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(err) = sink.send(frame).await {
          debug!("bridge writer stopped: {err}");
          break;
        }
      }
      // Dropping the sink sends FIN; the peer observes a clean close.
    });

    let reader_bridge = bridge.clone();
    tokio::spawn(async move {
      let mut source = FramedRead::new(read_half, FrameCodec::new());
      let fault = loop {
        let next = tokio::select! {
          _ = stop.cancelled() => break None,
          next = source.next() => next,
        };
        match next {
          Some(Ok(frame)) => {
            if let Err(env) = reader_bridge.route(frame, &handler).await {
              break Some(env);
            }
          }
          Some(Err(err)) => break Some(err.into()),
          None => break None,
        }
      };
      if let Some(env) = &fault {
        warn!("connection fault: {env}");
      }
      reader_bridge.shutdown(fault.unwrap_or_else(ErrorEnvelope::connection_closed));
    });

    bridge
  }

  /// Sends a call and awaits its terminal reply.
  pub async fn call(
    &self,
    body: CallBody,
  ) -> Result<ReplyBody, ErrorEnvelope> {
    self.call_started(body).await
  }

  /// Puts the call on the wire *now* and returns the future awaiting its
  /// reply. Callers that must preserve submission order (console entries)
  /// rely on the send happening before this returns.
  pub fn call_started(
    &self,
    body: CallBody,
  ) -> impl std::future::Future<Output = Result<ReplyBody, ErrorEnvelope>>
  + Send
  + 'static {
    let inner = self.inner.clone();
    let mut rx = None;
    if inner.closed.load(Ordering::Acquire) {
      // fall through; rx stays None
    } else {
      let correlation = inner.next_correlation.fetch_add(1, Ordering::Relaxed);
      let (tx, receiver) = oneshot::channel();
      inner.pending.insert(correlation, tx);
      let frame = Frame::call(correlation, protocol::encode_body(&body));
      if inner.writer.send(frame).is_err() {
        inner.pending.remove(&correlation);
      } else {
        rx = Some(receiver);
      }
    }
    async move {
      match rx {
        Some(rx) => match rx.await {
          Ok(result) => result,
          Err(_) => Err(ErrorEnvelope::connection_closed()),
        },
        None => Err(ErrorEnvelope::connection_closed()),
      }
    }
  }

  pub fn streams(&self) -> &StreamTable {
    &self.inner.streams
  }

  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::Acquire)
  }

  /// Closes the connection from this side: both transport tasks stop, the
  /// write half drops (FIN), and every pending call fails.
  pub fn close(&self) {
    self.inner.stop.cancel();
    self.shutdown(ErrorEnvelope::connection_closed());
  }

  pub async fn closed(&self) {
    // Register interest before re-checking, so a shutdown that lands in
    // between still wakes us.
    let notified = self.inner.closed_notify.notified();
    if self.is_closed() {
      return;
    }
    notified.await;
  }

  async fn route(
    &self,
    frame: Frame,
    handler: &Arc<dyn CallHandler>,
  ) -> Result<(), ErrorEnvelope> {
    match frame.kind {
      FrameKind::Call => {
        let body: CallBody = protocol::decode_body(&frame.body)?;
        match body {
          CallBody::StreamPull { handle, n } => {
            self.inner.streams.pull(handle, n);
            self.reply(frame.correlation, Ok(ReplyBody::Unit));
          }
          CallBody::StreamCancel { handle, reason } => {
            self.inner.streams.cancel_source(handle, reason);
            // Ack even when the handle is already gone: cancel is
            // idempotent and must never leave the peer waiting.
            self.reply(frame.correlation, Ok(ReplyBody::Unit));
          }
          // Console entries are handled in the reader itself so the order
          // the host observes is frame order.
          notification @ CallBody::Host(
            protocol::HostCall::ConsoleEntry { .. },
          ) => {
            let result = handler.handle(notification).await;
            self.reply(frame.correlation, result);
          }
          other => {
            let handler = handler.clone();
            let bridge = self.clone();
            let correlation = frame.correlation;
            tokio::spawn(async move {
              let result = handler.handle(other).await;
              bridge.reply(correlation, result);
            });
          }
        }
        Ok(())
      }
      FrameKind::Reply => {
        if let Some((_, tx)) = self.inner.pending.remove(&frame.correlation)
        {
          let body = protocol::decode_body(&frame.body)?;
          let _ = tx.send(Ok(body));
        }
        Ok(())
      }
      FrameKind::Err => {
        if let Some((_, tx)) = self.inner.pending.remove(&frame.correlation)
        {
          let env: ErrorEnvelope = protocol::decode_body(&frame.body)?;
          let _ = tx.send(Err(env));
        }
        Ok(())
      }
      FrameKind::StreamChunk => {
        let chunk = protocol::decode_body(&frame.body)?;
        self.inner.streams.deliver_chunk(frame.correlation, chunk);
        Ok(())
      }
      FrameKind::StreamEnd => {
        self.inner.streams.deliver_end(frame.correlation);
        Ok(())
      }
      FrameKind::StreamErr => {
        let env: ErrorEnvelope = protocol::decode_body(&frame.body)?;
        self.inner.streams.deliver_error(frame.correlation, env);
        Ok(())
      }
    }
  }

  fn reply(
    &self,
    correlation: u64,
    result: Result<ReplyBody, ErrorEnvelope>,
  ) {
    let frame = match result {
      Ok(body) => Frame::reply(correlation, protocol::encode_body(&body)),
      Err(env) => Frame::error(correlation, &env),
    };
    let _ = self.inner.writer.send(frame);
  }

  /// Tears the connection down: every pending call and open stream observes
  /// the fault.
  fn shutdown(&self, fault: ErrorEnvelope) {
    if self.inner.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let correlations: Vec<u64> =
      self.inner.pending.iter().map(|entry| *entry.key()).collect();
    for correlation in correlations {
      if let Some((_, tx)) = self.inner.pending.remove(&correlation) {
        let _ = tx.send(Err(fault.clone()));
      }
    }
    self.inner.streams.shutdown(fault);
    self.inner.closed_notify.notify_waiters();
  }
}
