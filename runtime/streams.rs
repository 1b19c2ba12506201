// Copyright 2024-2026 the jsbox authors. MIT license.

//! The streaming marshaller: pull-based chunk sequences crossing the
//! bridge, plus the host-side stream combinators (tee, transform, reader
//! locks) the sandbox glue is built on.
//!
//! A connection has one [`StreamTable`] with two maps:
//!
//! - **sources** — locally produced sequences the peer consumes. Each source
//!   runs a pump task that waits for `streamPull` demand, forwards chunks
//!   through the shared writer (so chunk order is frame order), and emits
//!   exactly one terminator.
//! - **sinks** — remote sequences consumed locally through [`RemoteStream`],
//!   which manages its pull window and discards chunks that race a cancel.
//!
//! Cancel is idempotent by construction: the first cancel removes the table
//! entry and stops the pump; anything later finds nothing and still acks.

use futures::Stream;
use futures::StreamExt;
use jsbox_core::codec::Frame;
use jsbox_core::codec::FrameKind;
use jsbox_core::error::ErrorEnvelope;
use jsbox_core::protocol;
use jsbox_core::protocol::CallBody;
use jsbox_core::protocol::StreamHandle;
use jsbox_core::value::Value;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;

/// How many chunks a consumer requests per `streamPull`. Kept well under
/// the protocol's 64-chunk eager-buffer allowance.
pub const PULL_BATCH: u32 = 16;

/// Bounded lag between tee branches before the source stalls.
pub const TEE_BUFFER: usize = 64;

/// A pull-based sequence of values with an explicit upstream cancel. The
/// default cancel is drop-based, which is right for plain host iterators;
/// remote streams and tee branches override it to propagate.
pub trait ChunkSource:
  Stream<Item = Result<Value, ErrorEnvelope>> + Send + Unpin
{
  fn cancel(&mut self, _reason: Option<String>) {}
}

pub type BoxChunkSource = Pin<Box<dyn ChunkSource>>;

/// Wraps any plain stream as a [`ChunkSource`].
pub struct IterSource<S>(pub S);

impl<S> Stream for IterSource<S>
where
  S: Stream<Item = Result<Value, ErrorEnvelope>> + Send + Unpin,
{
  type Item = Result<Value, ErrorEnvelope>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Option<Self::Item>> {
    self.0.poll_next_unpin(cx)
  }
}

impl<S> ChunkSource for IterSource<S> where
  S: Stream<Item = Result<Value, ErrorEnvelope>> + Send + Unpin
{
}

pub fn boxed<S>(stream: S) -> BoxChunkSource
where
  S: Stream<Item = Result<Value, ErrorEnvelope>> + Send + Unpin + 'static,
{
  Box::pin(IterSource(stream))
}

enum SourceMsg {
  Demand(u32),
  Cancel,
}

enum SinkEvent {
  Chunk(Value),
  End,
  Error(ErrorEnvelope),
}

struct TableInner {
  next_handle: u64,
  sources: HashMap<StreamHandle, mpsc::UnboundedSender<SourceMsg>>,
  sinks: HashMap<StreamHandle, mpsc::UnboundedSender<SinkEvent>>,
}

/// Per-connection stream state. Cheap clone.
#[derive(Clone)]
pub struct StreamTable {
  inner: Arc<Mutex<TableInner>>,
  writer: mpsc::UnboundedSender<Frame>,
  /// Correlation counter shared with the bridge, so stream-control calls
  /// stay unique per direction. Their acks are intentionally untracked.
  correlations: Arc<AtomicU64>,
}

impl StreamTable {
  pub fn new(writer: mpsc::UnboundedSender<Frame>) -> StreamTable {
    StreamTable {
      inner: Arc::new(Mutex::new(TableInner {
        next_handle: 1,
        sources: HashMap::new(),
        sinks: HashMap::new(),
      })),
      writer,
      correlations: Arc::new(AtomicU64::new(1 << 62)),
    }
  }

  /// Registers a local producer and returns the handle to embed in an
  /// outgoing value (`StreamRef`/`IteratorRef`).
  pub fn register_source(&self, mut producer: BoxChunkSource) -> StreamHandle {
    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();
    let handle = {
      let mut inner = self.inner.lock();
      let handle = inner.next_handle;
      inner.next_handle += 1;
      inner.sources.insert(handle, ctl_tx);
      handle
    };

    let table = self.clone();
    let writer = self.writer.clone();
    tokio::spawn(async move {
      let mut demand: u32 = 0;
      let terminator = loop {
        if demand == 0 {
          // Strictly demand-driven: nothing is pulled off the producer
          // until the consumer asks.
          match ctl_rx.recv().await {
            Some(SourceMsg::Demand(n)) => demand = demand.saturating_add(n),
            Some(SourceMsg::Cancel) | None => {
              producer.cancel(None);
              break None;
            }
          }
          continue;
        }
        tokio::select! {
          msg = ctl_rx.recv() => match msg {
            Some(SourceMsg::Demand(n)) => demand = demand.saturating_add(n),
            Some(SourceMsg::Cancel) | None => {
              producer.cancel(None);
              break None;
            }
          },
          item = producer.next() => match item {
            Some(Ok(chunk)) => {
              demand -= 1;
              let frame = Frame {
                kind: FrameKind::StreamChunk,
                flags: 0,
                correlation: handle,
                body: protocol::encode_body(&chunk),
              };
              if writer.send(frame).is_err() {
                break None;
              }
            }
            Some(Err(env)) => break Some(Err(env)),
            None => break Some(Ok(())),
          },
        }
      };

      table.inner.lock().sources.remove(&handle);
      match terminator {
        Some(Ok(())) => {
          let _ = writer.send(Frame {
            kind: FrameKind::StreamEnd,
            flags: 0,
            correlation: handle,
            body: bytes::Bytes::new(),
          });
        }
        Some(Err(env)) => {
          let _ = writer.send(Frame {
            kind: FrameKind::StreamErr,
            flags: 0,
            correlation: handle,
            body: protocol::encode_body(&env),
          });
        }
        None => {}
      }
    });

    handle
  }

  /// Demand from the peer for a source we own.
  pub fn pull(&self, handle: StreamHandle, n: u32) {
    let inner = self.inner.lock();
    if let Some(ctl) = inner.sources.get(&handle) {
      let _ = ctl.send(SourceMsg::Demand(n));
    }
  }

  /// Peer cancelled a source we own. Removing the entry first makes
  /// repeated cancels no-ops and frees the pump even if it never runs
  /// again.
  pub fn cancel_source(&self, handle: StreamHandle, _reason: Option<String>) {
    let ctl = self.inner.lock().sources.remove(&handle);
    if let Some(ctl) = ctl {
      let _ = ctl.send(SourceMsg::Cancel);
    }
  }

  /// Opens a consumer for a handle received from the peer.
  pub fn open_sink(&self, handle: StreamHandle) -> RemoteStream {
    let (tx, rx) = mpsc::unbounded_channel();
    self.inner.lock().sinks.insert(handle, tx);
    RemoteStream {
      handle,
      rx,
      credit: 0,
      done: false,
      table: self.clone(),
    }
  }

  pub(crate) fn deliver_chunk(&self, handle: StreamHandle, chunk: Value) {
    let inner = self.inner.lock();
    match inner.sinks.get(&handle) {
      Some(tx) => {
        let _ = tx.send(SinkEvent::Chunk(chunk));
      }
      // Raced a cancel; never surfaced to user code.
      None => debug!("discarding chunk for cancelled stream {handle}"),
    }
  }

  pub(crate) fn deliver_end(&self, handle: StreamHandle) {
    if let Some(tx) = self.inner.lock().sinks.remove(&handle) {
      let _ = tx.send(SinkEvent::End);
    }
  }

  pub(crate) fn deliver_error(&self, handle: StreamHandle, env: ErrorEnvelope) {
    if let Some(tx) = self.inner.lock().sinks.remove(&handle) {
      let _ = tx.send(SinkEvent::Error(env));
    }
  }

  /// Connection teardown: every consumer observes an error terminator,
  /// every pump stops.
  pub(crate) fn shutdown(&self, fault: ErrorEnvelope) {
    let (sinks, sources) = {
      let mut inner = self.inner.lock();
      (
        inner.sinks.drain().collect::<Vec<_>>(),
        inner.sources.drain().collect::<Vec<_>>(),
      )
    };
    for (_, tx) in sinks {
      let _ = tx.send(SinkEvent::Error(fault.clone()));
    }
    for (_, ctl) in sources {
      let _ = ctl.send(SourceMsg::Cancel);
    }
  }

  fn send_call(&self, body: &CallBody) {
    let correlation = self.correlations.fetch_add(1, Ordering::Relaxed);
    let _ = self
      .writer
      .send(Frame::call(correlation, protocol::encode_body(body)));
  }

  fn cancel_sink(&self, handle: StreamHandle, reason: Option<String>) {
    let removed = self.inner.lock().sinks.remove(&handle).is_some();
    if removed {
      self.send_call(&CallBody::StreamCancel { handle, reason });
    }
  }
}

/// Local consumer of a peer-owned stream. Pull credit is replenished in
/// [`PULL_BATCH`] windows; chunks arriving after a cancel are discarded at
/// the table.
pub struct RemoteStream {
  handle: StreamHandle,
  rx: mpsc::UnboundedReceiver<SinkEvent>,
  credit: u32,
  done: bool,
  table: StreamTable,
}

impl RemoteStream {
  pub fn handle(&self) -> StreamHandle {
    self.handle
  }

  /// Cancels upstream and releases the sink. Safe to call at any point,
  /// any number of times.
  pub fn cancel(&mut self, reason: Option<String>) {
    if !self.done {
      self.done = true;
      self.table.cancel_sink(self.handle, reason);
    }
  }
}

impl Stream for RemoteStream {
  type Item = Result<Value, ErrorEnvelope>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Option<Self::Item>> {
    use std::task::Poll;
    if self.done {
      return Poll::Ready(None);
    }
    if self.credit == 0 {
      self.credit = PULL_BATCH;
      let handle = self.handle;
      self
        .table
        .send_call(&CallBody::StreamPull { handle, n: PULL_BATCH });
    }
    match self.rx.poll_recv(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(None) => {
        self.done = true;
        Poll::Ready(None)
      }
      Poll::Ready(Some(SinkEvent::Chunk(chunk))) => {
        self.credit = self.credit.saturating_sub(1);
        Poll::Ready(Some(Ok(chunk)))
      }
      Poll::Ready(Some(SinkEvent::End)) => {
        self.done = true;
        Poll::Ready(None)
      }
      Poll::Ready(Some(SinkEvent::Error(env))) => {
        self.done = true;
        Poll::Ready(Some(Err(env)))
      }
    }
  }
}

impl ChunkSource for RemoteStream {
  fn cancel(&mut self, reason: Option<String>) {
    RemoteStream::cancel(self, reason);
  }
}

impl Drop for RemoteStream {
  fn drop(&mut self) {
    self.cancel(None);
  }
}

struct TeeCtrl {
  cancelled: [std::sync::atomic::AtomicBool; 2],
}

/// One branch of a tee. Cancelling a branch stops its feed; cancelling the
/// last live branch cancels the shared source.
pub struct TeeBranch {
  rx: mpsc::Receiver<Result<Value, ErrorEnvelope>>,
  ctrl: Arc<TeeCtrl>,
  index: usize,
}

impl Stream for TeeBranch {
  type Item = Result<Value, ErrorEnvelope>;

  fn poll_next(
    mut self: Pin<&mut Self>,
    cx: &mut std::task::Context<'_>,
  ) -> std::task::Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}

impl ChunkSource for TeeBranch {
  fn cancel(&mut self, _reason: Option<String>) {
    self.ctrl.cancelled[self.index].store(true, Ordering::Release);
    self.rx.close();
  }
}

/// Splits a source in two independent branches. The source is pulled at the
/// pace of the faster consumer until the slower branch lags by
/// [`TEE_BUFFER`] chunks, at which point the distributor stalls (bounded
/// buffering, then backpressure).
pub fn tee(mut source: BoxChunkSource) -> (TeeBranch, TeeBranch) {
  let (tx1, rx1) = mpsc::channel(TEE_BUFFER);
  let (tx2, rx2) = mpsc::channel(TEE_BUFFER);
  let ctrl = Arc::new(TeeCtrl {
    cancelled: [
      std::sync::atomic::AtomicBool::new(false),
      std::sync::atomic::AtomicBool::new(false),
    ],
  });

  let task_ctrl = ctrl.clone();
  tokio::spawn(async move {
    let live = |i: usize| !task_ctrl.cancelled[i].load(Ordering::Acquire);
    loop {
      if !live(0) && !live(1) {
        source.cancel(None);
        break;
      }
      let Some(item) = source.next().await else {
        break;
      };
      if live(0) && tx1.send(item.clone()).await.is_err() {
        task_ctrl.cancelled[0].store(true, Ordering::Release);
      }
      if live(1) && tx2.send(item).await.is_err() {
        task_ctrl.cancelled[1].store(true, Ordering::Release);
      }
    }
  });

  (
    TeeBranch { rx: rx1, ctrl: ctrl.clone(), index: 0 },
    TeeBranch { rx: rx2, ctrl, index: 1 },
  )
}

/// Pipes a source through a chunk function. `None` is the identity
/// transform: same chunks, same order. `Some(f)` maps each chunk to zero or
/// one output chunks (a filtering transform returns `None` to drop).
pub fn transform(
  source: BoxChunkSource,
  f: Option<Box<dyn FnMut(Value) -> Option<Value> + Send>>,
) -> BoxChunkSource {
  match f {
    None => source,
    Some(mut f) => boxed(
      source
        .filter_map(move |item| {
          let mapped = match item {
            Ok(chunk) => f(chunk).map(Ok),
            Err(env) => Some(Err(env)),
          };
          futures::future::ready(mapped)
        })
        .boxed(),
    ),
  }
}

/// A readable with WHATWG-style reader-lock semantics, backing the sandbox
/// `ReadableStream` glue.
pub struct Readable {
  source: BoxChunkSource,
  locked: bool,
  done: bool,
}

impl Readable {
  pub fn new(source: BoxChunkSource) -> Readable {
    Readable { source, locked: false, done: false }
  }

  pub fn is_locked(&self) -> bool {
    self.locked
  }

  /// `getReader()`: at most one reader at a time.
  pub fn lock_reader(&mut self) -> Result<(), ErrorEnvelope> {
    if self.locked {
      return Err(ErrorEnvelope::locked_stream());
    }
    self.locked = true;
    Ok(())
  }

  /// `reader.releaseLock()`.
  pub fn release_reader(&mut self) {
    self.locked = false;
  }

  pub async fn read(&mut self) -> Option<Result<Value, ErrorEnvelope>> {
    if self.done {
      return None;
    }
    let item = self.source.next().await;
    if item.is_none() {
      self.done = true;
    }
    item
  }

  /// `stream.cancel()`: rejects locally on a locked stream, without
  /// emitting anything upstream.
  pub fn cancel_via_stream(
    &mut self,
    reason: Option<String>,
  ) -> Result<(), ErrorEnvelope> {
    if self.locked {
      return Err(ErrorEnvelope::locked_stream());
    }
    self.done = true;
    self.source.cancel(reason);
    Ok(())
  }

  /// `reader.cancel()`: releases the reader and propagates upstream.
  /// Idempotent.
  pub fn cancel_via_reader(&mut self, reason: Option<String>) {
    self.locked = false;
    if !self.done {
      self.done = true;
      self.source.cancel(reason);
    }
  }

  /// `tee()`: consumes this readable. Fails on a locked stream.
  pub fn tee(self) -> Result<(Readable, Readable), ErrorEnvelope> {
    if self.locked {
      return Err(ErrorEnvelope::locked_stream());
    }
    let (a, b) = tee(self.source);
    Ok((Readable::new(Box::pin(a)), Readable::new(Box::pin(b))))
  }

  /// `pipeThrough(TransformStream)` with a host-side chunk function; `None`
  /// is the identity transform.
  pub fn pipe_through(
    self,
    f: Option<Box<dyn FnMut(Value) -> Option<Value> + Send>>,
  ) -> Result<Readable, ErrorEnvelope> {
    if self.locked {
      return Err(ErrorEnvelope::locked_stream());
    }
    Ok(Readable::new(transform(self.source, f)))
  }

  /// Unwraps the underlying source, e.g. to register it as an outgoing
  /// bridge stream. Consuming a locked stream is refused.
  pub fn into_source(self) -> Result<BoxChunkSource, ErrorEnvelope> {
    if self.locked {
      return Err(ErrorEnvelope::locked_stream());
    }
    Ok(self.source)
  }
}
