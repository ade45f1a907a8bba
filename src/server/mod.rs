//! The serve-side facade. [RpcService] owns the listener, the typed
//! method router, admission control and the per-request dispatch
//! pipeline; every failure an admitted request can hit is answered with
//! a structured error, never a dropped connection.

mod router;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::BytesMut;
use crossfire::MTx;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::codec::{Codec, CodecKind};
use crate::config::RpcConfig;
use crate::context::Context;
use crate::error::{self, unix_ts, CallError};
use crate::frame;
use crate::limiter::Limiter;
use crate::proto::{Request, Response};
use crate::selector::ServiceInstance;

use router::Router;

/// Token check run before an auth-marked method dispatches, given the
/// call context, the method name and the caller's token.
pub type AuthFn = Arc<dyn Fn(&Context, &str, &str) -> Result<(), CallError> + Send + Sync>;

#[derive(Clone)]
pub struct RpcService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    name: String,
    config: RpcConfig,
    codec: Codec,
    router: Router,
    limiter: Limiter,
    auth: RwLock<Option<AuthFn>>,
    closed: AtomicBool,
    /// Strong count minus one is the number of in-flight requests.
    inflight: Arc<()>,
    close_tx: Mutex<Option<MTx<()>>>,
}

impl RpcService {
    /// Must be created inside an async runtime (the limiter spawns its
    /// refill ticker).
    pub fn new(name: impl Into<String>, config: RpcConfig) -> Self {
        let limiter = Limiter::new(config.max_service_rate);
        Self {
            inner: Arc::new(ServiceInner {
                name: name.into(),
                config,
                codec: Codec::default(),
                router: Router::default(),
                limiter,
                auth: RwLock::new(None),
                closed: AtomicBool::new(false),
                inflight: Arc::new(()),
                close_tx: Mutex::new(None),
            }),
        }
    }

    /// Register one typed method. `is_auth` methods run the auth hook
    /// before dispatch.
    pub fn register<A, R, F, Fut>(&self, name: &str, level: i8, is_auth: bool, explain: &str, f: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
    {
        self.inner.router.register(name, level, is_auth, explain, f);
    }

    pub fn set_auth(&self, f: AuthFn) {
        *self.inner.auth.write().unwrap() = Some(f);
    }

    /// The instance record this service advertises to discovery:
    /// destination key, reachable address and the full method list.
    pub fn instance(&self, address: &str, port: u16) -> ServiceInstance {
        ServiceInstance {
            key: format!("{}:{}", address, port),
            name: self.inner.name.clone(),
            address: address.to_string(),
            port,
            methods: self.inner.router.method_list(),
            time: unix_ts(),
        }
    }

    /// Bind and run the accept loop until [RpcService::close]. A bind
    /// failure is fatal and returned to the caller; a failed accept is
    /// logged and the loop continues.
    pub async fn serve(&self, bind: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind).await?;
        self.serve_listener(listener).await;
        Ok(())
    }

    /// Accept-loop half of [RpcService::serve], for callers that bind
    /// themselves (e.g. to an ephemeral port).
    pub async fn serve_listener(&self, listener: TcpListener) {
        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        *self.inner.close_tx.lock().unwrap() = Some(close_tx);
        if let Ok(addr) = listener.local_addr() {
            info!("service {} listening on {}", self.inner.name, addr);
        }
        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    info!("service {} accept loop stopped", self.inner.name);
                    return;
                }
                r = listener.accept() => match r {
                    Ok((stream, peer)) => {
                        let _ = stream.set_nodelay(true);
                        let inner = self.inner.clone();
                        tokio::spawn(async move {
                            inner.serve_conn(stream, peer.to_string()).await;
                        });
                    }
                    Err(e) => {
                        warn!("service {} accept err: {:?}", self.inner.name, e);
                    }
                }
            }
        }
    }

    /// Graceful shutdown: stop accepting, answer new requests with an
    /// error, wait for in-flight requests to drain (capped at about 90
    /// seconds).
    pub async fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::SeqCst);
        inner.close_tx.lock().unwrap().take();
        let mut waited = 0u32;
        while Arc::strong_count(&inner.inflight) > 1 && waited < 900 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            waited += 1;
        }
        info!("service {} closed", inner.name);
    }
}

impl ServiceInner {
    async fn serve_conn(self: Arc<Self>, stream: TcpStream, peer: String) {
        let (mut rd, wr) = stream.into_split();
        let wr = Arc::new(tokio::sync::Mutex::new(wr));
        let mut buf = BytesMut::with_capacity(512);
        loop {
            if let Err(e) = frame::read_frame(&mut rd, &mut buf).await {
                debug!("conn {} read err: {:?}", peer, e);
                break;
            }
            let req = match self.codec.decode::<Request>(CodecKind::Msgpack, &buf) {
                Ok(req) => req,
                Err(_) => {
                    // a peer speaking garbage is not worth keeping
                    warn!("conn {} sent malformed request, dropping it", peer);
                    break;
                }
            };
            // shed over-limit work before it occupies a task
            if self.limiter.is_limit() {
                let mut resp = Response::reply_to(&req);
                resp.error =
                    Some(CallError::new(error::SERVICE_LIMIT, "service rate limited"));
                let inner = self.clone();
                let wr = wr.clone();
                tokio::spawn(async move {
                    inner.write_response(wr, resp).await;
                });
                continue;
            }
            let inner = self.clone();
            let wr = wr.clone();
            tokio::spawn(async move {
                inner.handle_request(wr, req).await;
            });
        }
        debug!("conn {} disconnected", peer);
    }

    /// One request end to end: admit, dispatch, answer. The reply
    /// always echoes the request's correlation fields.
    async fn handle_request(&self, wr: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, req: Request) {
        let _guard = self.inflight.clone();
        let mut resp = Response::reply_to(&req);
        let kind = CodecKind::from_tag(&req.code);
        match self.process(&req, kind).await {
            Ok(reply) => resp.reply = Some(reply),
            Err(e) => {
                debug!("request {} {}.{} err: {}", req.id, req.name, req.method, e);
                resp.error = Some(e);
            }
        }
        self.write_response(wr, resp).await;
    }

    async fn write_response(&self, wr: Arc<tokio::sync::Mutex<OwnedWriteHalf>>, resp: Response) {
        let buf = match self.codec.encode(CodecKind::Msgpack, &resp) {
            Ok(buf) => buf,
            Err(_) => return,
        };
        let mut wr = wr.lock().await;
        match tokio::time::timeout(
            self.config.timeout.write_timeout,
            frame::write_frame(&mut *wr, &buf),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("write response {} err: {:?}", resp.id, e);
            }
            Err(_) => {
                warn!("write response {} timed out", resp.id);
            }
        }
    }

    async fn process(&self, req: &Request, kind: CodecKind) -> Result<Vec<u8>, CallError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CallError::new(error::INTERNAL_SERVER_ERROR, "server closing"));
        }
        let ctx = Context::from_request(req);
        if ctx.expired() {
            // the caller has already given up; do not burn the handler
            return Err(CallError::new(error::REQUEST_TIMEOUT, "deadline already elapsed"));
        }
        let entry = match self.router.lookup(&req.method) {
            Some(entry) => entry,
            None => {
                return Err(CallError::new(
                    error::RPC_NOT_FOUND,
                    format!("method {} not found", req.method),
                ));
            }
        };
        if entry.info.is_auth {
            let auth = self.auth.read().unwrap().clone();
            match auth {
                Some(check) => check(&ctx, &req.method, &req.token)?,
                None => {
                    return Err(CallError::new(
                        error::INTERNAL_SERVER_ERROR,
                        "auth required but no auth hook installed",
                    ));
                }
            }
        }
        (entry.handler)(ctx, kind, req.arg.clone()).await
    }
}
