//! The client-side call engine. One [CallConn] per destination key:
//! a pending table keyed by call id, a per-call spawned write task so a
//! blocked peer never stalls the next caller, and a dedicated receive
//! loop that resolves pending entries by id. A call moves
//! `Created -> Sent -> (Resolved | TimedOut)`; at most one response is
//! ever delivered per call.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use crossfire::{MAsyncRx, MTx};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::codec::{Codec, CodecKind};
use crate::config::TimeoutSetting;
use crate::context::Context;
use crate::error::{self, CallError};
use crate::frame;
use crate::proto::{Request, Response};

/// Invoked exactly once when the connection is torn down, after every
/// pending call has been failed with connection-closed.
pub(crate) type OnClose = Box<dyn FnOnce() + Send>;

struct PendingCall {
    name: String,
    method: String,
    done_tx: oneshot::Sender<Response>,
}

pub struct CallConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    key: String,
    conn_id: u64,
    codec: Codec,
    seq: AtomicU64,
    closed: AtomicBool,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, PendingCall>>,
    close_tx: Mutex<Option<MTx<()>>>,
    on_close: Mutex<Option<OnClose>>,
    write_timeout: Duration,
}

impl fmt::Debug for ConnInner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn {}#{:x}", self.key, self.conn_id)
    }
}

impl CallConn {
    /// Wrap an established stream. `conn_id` names this connection for
    /// identity-checked eviction. Spawns the receive loop; the
    /// connection lives until an I/O failure, an offline eviction or
    /// [CallConn::close].
    pub(crate) fn new(
        key: &str, conn_id: u64, stream: TcpStream, codec: Codec, timeout: &TimeoutSetting,
        on_close: Option<OnClose>,
    ) -> Self {
        let (rd, wr) = stream.into_split();
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let inner = Arc::new(ConnInner {
            key: key.to_string(),
            conn_id,
            codec,
            seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(wr),
            pending: Mutex::new(HashMap::new()),
            close_tx: Mutex::new(Some(close_tx)),
            on_close: Mutex::new(on_close),
            write_timeout: timeout.write_timeout,
        });
        let recv = inner.clone();
        tokio::spawn(async move {
            recv.receive_loop(rd, close_rx).await;
        });
        Self { inner }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn conn_id(&self) -> u64 {
        self.inner.conn_id
    }

    /// Mark closed and wake the receive loop, which sweeps the pending
    /// table and runs the on-close callback. Idempotent.
    pub fn close(&self) {
        self.inner.mark_closed();
    }

    /// One round trip: register a pending entry, hand the framed
    /// request to the write path, then wait on the delivery slot racing
    /// the caller's deadline.
    pub async fn call_raw(
        &self, ctx: &Context, name: &str, method: &str, kind: CodecKind, arg: Vec<u8>,
    ) -> Result<Response, CallError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CallError::new(error::CONNECT_CLOSE, "connection already closed"));
        }
        if ctx.expired() {
            // fail fast, no network I/O for a dead deadline
            return Err(CallError::new(error::REQUEST_TIMEOUT, "deadline already elapsed"));
        }

        let id = format!("{:016x}-{}", inner.conn_id, inner.seq.fetch_add(1, Ordering::Relaxed));
        let req = Request {
            id: id.clone(),
            name: name.to_string(),
            method: method.to_string(),
            ttl: ctx.ttl(),
            timeout: ctx.deadline(),
            trace_id: ctx.trace_id().to_string(),
            is_test: ctx.is_test(),
            address: ctx.address().to_string(),
            source: ctx.source().to_string(),
            data: ctx.data().clone(),
            token: ctx.token().to_string(),
            code: kind.tag().to_string(),
            arg,
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut pending = inner.pending.lock().unwrap();
            if pending.contains_key(&id) {
                // never overwrite an in-flight entry
                return Err(CallError::new(
                    error::INTERNAL_SERVER_ERROR,
                    "call id already in flight",
                ));
            }
            pending.insert(
                id.clone(),
                PendingCall { name: req.name.clone(), method: req.method.clone(), done_tx },
            );
        }

        let buf = match inner.codec.encode(CodecKind::Msgpack, &req) {
            Ok(buf) => buf,
            Err(_) => {
                inner.pending.lock().unwrap().remove(&id);
                return Err(CallError::new(error::PARAM_ERROR, "encode request failed"));
            }
        };

        // Detach the write so a slow peer cannot stall this caller's
        // ability to time out, nor the next call.
        let sender = inner.clone();
        let send_id = id.clone();
        tokio::spawn(async move {
            sender.send_frame(&send_id, buf).await;
        });

        // callers are expected to stamp a deadline; a day is "forever"
        let wait = ctx.remaining().unwrap_or(Duration::from_secs(86400));
        tokio::select! {
            r = done_rx => match r {
                Ok(resp) => Ok(resp),
                // sender dropped without a sweep; treat as closed
                Err(_) => Err(CallError::new(error::CONNECT_CLOSE, "connection closed")),
            },
            _ = tokio::time::sleep(wait) => {
                // the caller moves on; a late response is dropped by
                // the receive loop finding no entry
                inner.pending.lock().unwrap().remove(&id);
                Err(CallError::new(error::REQUEST_TIMEOUT, "request timeout"))
            }
        }
    }
}

impl ConnInner {
    async fn send_frame(&self, id: &str, buf: Vec<u8>) {
        let mut wr = self.writer.lock().await;
        match tokio::time::timeout(self.write_timeout, frame::write_frame(&mut *wr, &buf)).await {
            Ok(Ok(())) => {
                trace!("{:?} sent request {}", self, id);
            }
            Ok(Err(e)) => {
                warn!("{:?} write request {} err: {:?}", self, id, e);
                drop(wr);
                self.mark_closed();
            }
            Err(_) => {
                warn!("{:?} write request {} timed out", self, id);
                drop(wr);
                self.mark_closed();
            }
        }
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // dropping the sender wakes the receive loop's select
            self.close_tx.lock().unwrap().take();
        }
    }

    async fn receive_loop(self: Arc<Self>, mut rd: OwnedReadHalf, close_rx: MAsyncRx<()>) {
        let mut buf = BytesMut::with_capacity(512);
        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    break;
                }
                r = frame::read_frame(&mut rd, &mut buf) => {
                    match r {
                        Err(e) => {
                            debug!("{:?} read resp err: {:?}", self, e);
                            break;
                        }
                        Ok(()) => {
                            match self.codec.decode::<Response>(CodecKind::Msgpack, &buf) {
                                // a malformed frame is not fatal to the
                                // connection, only unmatchable
                                Err(_) => continue,
                                Ok(resp) => self.resolve(resp),
                            }
                        }
                    }
                }
            }
        }
        self.teardown();
    }

    fn resolve(&self, resp: Response) {
        let entry = self.pending.lock().unwrap().remove(&resp.id);
        match entry {
            Some(p) => {
                // the caller may have timed out between remove and send
                let _ = p.done_tx.send(resp);
            }
            None => {
                trace!("{:?} unmatched response {} dropped", self, resp.id);
            }
        }
    }

    /// Fail every still-pending call with connection-closed, then run
    /// the on-close callback so the manager evicts this key.
    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let entries: Vec<(String, PendingCall)> =
            self.pending.lock().unwrap().drain().collect();
        for (id, p) in entries {
            let resp = Response::failure(
                id,
                p.name,
                p.method,
                CallError::new(error::CONNECT_CLOSE, "connection closed"),
            );
            let _ = p.done_tx.send(resp);
        }
        if let Some(cb) = self.on_close.lock().unwrap().take() {
            cb();
        }
        debug!("{:?} closed", self);
    }
}

impl Drop for CallConn {
    fn drop(&mut self) {
        self.inner.mark_closed();
    }
}
