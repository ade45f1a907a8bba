//! The caller-side facade. [RpcClient] wires together admission
//! control, instance selection, the circuit breaker and the connection
//! manager; application code only sees typed calls on logical service
//! names.

mod conn;
mod manager;

use std::sync::Arc;

use crossfire::{MAsyncRx, MTx};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::breaker::Breaker;
use crate::codec::{Codec, CodecKind};
use crate::config::RpcConfig;
use crate::context::Context;
use crate::discovery::DiscoveryEvent;
use crate::error::{self, CallError};
use crate::limiter::Limiter;
use crate::selector::{Mode, Selector, ServiceInstance};

use manager::ConnManager;

pub struct RpcClient {
    config: RpcConfig,
    codec: Codec,
    selector: Arc<Selector>,
    breaker: Arc<Breaker>,
    limiter: Limiter,
    manager: Arc<ConnManager>,
    close_tx: Option<MTx<()>>,
}

impl RpcClient {
    /// Must be created inside an async runtime. `events` is the stream
    /// from a discovery backend; the client applies online/offline
    /// notifications to the selector and evicts dead destinations from
    /// the connection cache.
    pub fn new(config: RpcConfig, events: MAsyncRx<DiscoveryEvent>) -> Self {
        let codec = Codec::default();
        let selector = Arc::new(Selector::new());
        let breaker = Arc::new(Breaker::new(config.breaker));
        let limiter = Limiter::new(config.max_client_rate);
        let manager = ConnManager::new(codec, config.timeout);

        let (close_tx, close_rx) = crossfire::mpmc::unbounded_async::<()>();
        let pump_selector = selector.clone();
        let pump_manager = manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = close_rx.recv() => {
                        return;
                    }
                    ev = events.recv() => match ev {
                        Err(_) => return,
                        Ok(DiscoveryEvent::InstanceOnline(ins)) => {
                            pump_selector.add_service(ins);
                        }
                        Ok(DiscoveryEvent::InstanceOffline(key)) => {
                            pump_selector.del_service(&key);
                            pump_manager.remove(&key).await;
                        }
                    }
                }
            }
        });

        Self { config, codec, selector, breaker, limiter, manager, close_tx: Some(close_tx) }
    }

    /// Typed call with the default msgpack payload codec.
    pub async fn call<A: Serialize, R: DeserializeOwned>(
        &self, ctx: &Context, mode: Mode, name: &str, method: &str, arg: &A,
    ) -> Result<R, CallError> {
        self.call_with(ctx, mode, name, method, CodecKind::Msgpack, arg).await
    }

    /// Typed call with an explicit payload codec.
    pub async fn call_with<A: Serialize, R: DeserializeOwned>(
        &self, ctx: &Context, mode: Mode, name: &str, method: &str, kind: CodecKind, arg: &A,
    ) -> Result<R, CallError> {
        let arg = self.encode_arg(kind, arg)?;
        let reply = self.send_request(ctx, mode, name, method, kind, arg).await?;
        self.decode_reply(kind, &reply)
    }

    /// Untyped core: admission control, deadline stamping, mode
    /// dispatch. Returns the raw reply payload.
    pub async fn send_request(
        &self, ctx: &Context, mode: Mode, name: &str, method: &str, kind: CodecKind,
        arg: Vec<u8>,
    ) -> Result<Vec<u8>, CallError> {
        if self.limiter.is_limit() {
            return Err(CallError::new(error::CLIENT_LIMIT, "client rate limited"));
        }
        let ctx = self.effective(ctx);
        match mode {
            Mode::Random => {
                let ins = self.selector.random_mode(&self.breaker, name, method)?;
                self.call_instance(&ctx, &ins, name, method, kind, arg).await
            }
            Mode::Custom => {
                let ins = self.selector.custom_mode(&self.breaker, name, method)?;
                self.call_instance(&ctx, &ins, name, method, kind, arg).await
            }
            Mode::Hash => {
                let ins = self.selector.hash_mode(&self.breaker, name, method)?;
                self.call_instance(&ctx, &ins, name, method, kind, arg).await
            }
            Mode::Range => {
                // walk the non-fused set until one succeeds
                let candidates = self.selector.filtered(&self.breaker, name, method)?;
                let mut last = CallError::new(error::INTERNAL_SERVER_ERROR, "no available service");
                for ins in candidates {
                    match self
                        .call_instance(&ctx, &ins, name, method, kind, arg.clone())
                        .await
                    {
                        Ok(reply) => return Ok(reply),
                        Err(e) => {
                            debug!("range call {}.{} via {} err: {}", name, method, ins.key, e);
                            last = e;
                        }
                    }
                }
                Err(last)
            }
        }
    }

    /// Typed call pinned to one instance by `address:port`, bypassing
    /// load balancing but not the breaker.
    pub async fn call_by_address<A: Serialize, R: DeserializeOwned>(
        &self, ctx: &Context, address: &str, name: &str, method: &str, arg: &A,
    ) -> Result<R, CallError> {
        if self.limiter.is_limit() {
            return Err(CallError::new(error::CLIENT_LIMIT, "client rate limited"));
        }
        let kind = CodecKind::Msgpack;
        let arg = self.encode_arg(kind, arg)?;
        let ctx = self.effective(ctx);
        let ins = self.selector.by_address(&self.breaker, name, method, address)?;
        let reply = self.call_instance(&ctx, &ins, name, method, kind, arg).await?;
        self.decode_reply(kind, &reply)
    }

    /// Fan the same call out to every non-fused instance of `name`,
    /// concurrently. Per-instance outcomes are returned keyed by the
    /// destination key; only admission and encoding fail the whole
    /// broadcast.
    pub async fn broadcast<A: Serialize, R: DeserializeOwned>(
        &self, ctx: &Context, name: &str, method: &str, arg: &A,
    ) -> Result<Vec<(String, Result<R, CallError>)>, CallError> {
        if self.limiter.is_limit() {
            return Err(CallError::new(error::CLIENT_LIMIT, "client rate limited"));
        }
        let kind = CodecKind::Msgpack;
        let arg = self.encode_arg(kind, arg)?;
        let ctx = self.effective(ctx);
        let candidates = self.selector.filtered(&self.breaker, name, method)?;
        let calls = candidates.iter().map(|ins| {
            let arg = arg.clone();
            let ctx = ctx.clone();
            async move {
                let r = self.call_instance(&ctx, ins, name, method, kind, arg).await;
                (ins.key.clone(), r.and_then(|reply| self.decode_reply(kind, &reply)))
            }
        });
        Ok(futures::future::join_all(calls).await)
    }

    /// Live instances of one logical name, for diagnostics.
    pub fn instances(&self, name: &str) -> Vec<Arc<ServiceInstance>> {
        self.selector.snapshot(name)
    }

    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    pub fn set_rate_limit(&self, max: i64) {
        self.limiter.set_limit(max);
    }

    /// Tear down every cached connection. In-flight calls fail with
    /// connection-closed.
    pub async fn close(&self) {
        self.manager.close_all().await;
    }

    async fn call_instance(
        &self, ctx: &Context, ins: &ServiceInstance, name: &str, method: &str,
        kind: CodecKind, arg: Vec<u8>,
    ) -> Result<Vec<u8>, CallError> {
        self.breaker.add_method(&ins.key, method);
        let result = self.dispatch(ctx, ins, name, method, kind, arg).await;
        if let Err(err) = &result {
            self.breaker.add_error_method(&ins.key, method, err);
        }
        result
    }

    async fn dispatch(
        &self, ctx: &Context, ins: &ServiceInstance, name: &str, method: &str,
        kind: CodecKind, arg: Vec<u8>,
    ) -> Result<Vec<u8>, CallError> {
        let conn = self.manager.get(&ins.key, &ins.addr()).await?;
        let resp = conn.call_raw(ctx, name, method, kind, arg).await?;
        if let Some(err) = resp.error {
            return Err(err);
        }
        Ok(resp.reply.unwrap_or_default())
    }

    fn encode_arg<A: Serialize>(&self, kind: CodecKind, arg: &A) -> Result<Vec<u8>, CallError> {
        self.codec
            .encode(kind, arg)
            .map_err(|_| CallError::new(error::PARAM_ERROR, "encode argument failed"))
    }

    fn decode_reply<R: DeserializeOwned>(
        &self, kind: CodecKind, reply: &[u8],
    ) -> Result<R, CallError> {
        self.codec
            .decode(kind, reply)
            .map_err(|_| CallError::new(error::PARAM_ERROR, "decode reply failed"))
    }

    fn effective(&self, ctx: &Context) -> Context {
        if ctx.deadline() != 0 {
            ctx.clone()
        } else {
            ctx.clone().with_timeout(self.config.timeout.default_ttl)
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close_tx.take();
    }
}
