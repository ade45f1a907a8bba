//! Typed method registry. Handlers are registered as
//! `async fn(Context, A) -> Result<R, CallError>` and erased into a
//! uniform bytes-in/bytes-out closure; the payload codec of each call
//! is decided by the request's codec tag, not at registration.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{Codec, CodecKind};
use crate::context::Context;
use crate::error::{self, CallError};
use crate::selector::MethodInfo;

pub(crate) type HandlerFn =
    Arc<dyn Fn(Context, CodecKind, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, CallError>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MethodEntry {
    pub info: MethodInfo,
    pub handler: HandlerFn,
}

#[derive(Default)]
pub(crate) struct Router {
    // lowercased method name -> entry
    methods: RwLock<HashMap<String, MethodEntry>>,
}

impl Router {
    pub fn register<A, R, F, Fut>(
        &self, name: &str, level: i8, is_auth: bool, explain: &str, f: F,
    ) where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, CallError>> + Send + 'static,
    {
        let codec = Codec::default();
        let f = Arc::new(f);
        let handler: HandlerFn = Arc::new(move |ctx, kind, arg| {
            let f = f.clone();
            Box::pin(async move {
                let a: A = codec.decode(kind, &arg).map_err(|_| {
                    CallError::new(error::PARAM_ERROR, "decode argument failed")
                })?;
                let r = f(ctx, a).await?;
                codec.encode(kind, &r).map_err(|_| {
                    CallError::new(error::INTERNAL_SERVER_ERROR, "encode reply failed")
                })
            })
        });
        let info = MethodInfo {
            name: name.to_string(),
            level,
            is_auth,
            explain: explain.to_string(),
        };
        let mut methods = self.methods.write().unwrap();
        if methods.insert(name.to_lowercase(), MethodEntry { info, handler }).is_some() {
            warn!("method {} re-registered, previous handler replaced", name);
        }
    }

    /// Method names are matched case-insensitively.
    pub fn lookup(&self, method: &str) -> Option<MethodEntry> {
        self.methods.read().unwrap().get(&method.to_lowercase()).cloned()
    }

    /// Every registered method's metadata, for instance advertisement.
    pub fn method_list(&self) -> Vec<MethodInfo> {
        self.methods.read().unwrap().values().map(|e| e.info.clone()).collect()
    }
}
