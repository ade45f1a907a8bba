//! Per-destination connection cache. At most one live [CallConn] per
//! key; the map lock is held across the dial so concurrent callers to
//! the same destination share a single connection attempt.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::client::conn::{CallConn, OnClose};
use crate::codec::Codec;
use crate::config::TimeoutSetting;
use crate::error::{self, CallError};

pub(crate) struct ConnManager {
    conns: Mutex<HashMap<String, Arc<CallConn>>>,
    codec: Codec,
    timeout: TimeoutSetting,
}

impl ConnManager {
    pub fn new(codec: Codec, timeout: TimeoutSetting) -> Arc<Self> {
        Arc::new(Self { conns: Mutex::new(HashMap::new()), codec, timeout })
    }

    /// Return the live connection for `key`, dialing `addr` if there is
    /// none. A cached but closed connection is evicted and redialed.
    pub async fn get(self: &Arc<Self>, key: &str, addr: &str) -> Result<Arc<CallConn>, CallError> {
        let mut conns = self.conns.lock().await;
        if let Some(c) = conns.get(key) {
            if !c.is_closed() {
                return Ok(c.clone());
            }
            conns.remove(key);
        }
        let stream =
            match tokio::time::timeout(self.timeout.connect_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => {
                    warn!("dial {} ({}) err: {:?}", addr, key, e);
                    return Err(CallError::new(
                        error::CONNECT_CLOSE,
                        format!("dial {} err: {}", addr, e),
                    ));
                }
                Err(_) => {
                    warn!("dial {} ({}) timed out", addr, key);
                    return Err(CallError::new(
                        error::CONNECT_CLOSE,
                        format!("dial {} timed out", addr),
                    ));
                }
            };
        let _ = stream.set_nodelay(true);

        let conn_id = rand::random::<u64>();
        let mgr = Arc::downgrade(self);
        let evict_key = key.to_string();
        let on_close: OnClose = Box::new(move || {
            // runs inside the connection's receive loop; hop off it
            if let Some(m) = mgr.upgrade() {
                tokio::spawn(async move {
                    m.evict(&evict_key, conn_id).await;
                });
            }
        });
        let conn = Arc::new(CallConn::new(
            key, conn_id, stream, self.codec, &self.timeout, Some(on_close),
        ));
        conns.insert(key.to_string(), conn.clone());
        debug!("dialed {} for {}", addr, key);
        Ok(conn)
    }

    /// Unconditional removal, driven by instance-offline notifications:
    /// whatever is cached for `key` is no longer wanted.
    pub async fn remove(&self, key: &str) {
        if let Some(c) = self.conns.lock().await.remove(key) {
            c.close();
        }
    }

    /// Removal on connection close. Only the connection that actually
    /// closed is taken out; a replacement dialed under the same key in
    /// the meantime is left alone.
    pub async fn evict(&self, key: &str, conn_id: u64) {
        let mut conns = self.conns.lock().await;
        let matched = conns.get(key).map_or(false, |c| c.conn_id() == conn_id);
        if matched {
            if let Some(c) = conns.remove(key) {
                c.close();
            }
        }
    }

    pub async fn close_all(&self) {
        let conns: Vec<Arc<CallConn>> = self.conns.lock().await.drain().map(|(_, c)| c).collect();
        for c in conns {
            c.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::runtime::{Builder, Runtime};

    fn rt() -> Runtime {
        Builder::new_multi_thread().worker_threads(2).enable_all().build().unwrap()
    }

    async fn accept_and_hold() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                });
            }
        });
        addr
    }

    #[test]
    fn test_stale_evict_spares_replacement() {
        rt().block_on(async {
            let addr = accept_and_hold().await;
            let manager = ConnManager::new(Codec::default(), TimeoutSetting::default());

            let old = manager.get("k", &addr).await.unwrap();
            let old_id = old.conn_id();
            old.close();

            // a caller redials under the same key before the dead
            // connection's own eviction lands
            let fresh = manager.get("k", &addr).await.unwrap();
            assert_ne!(fresh.conn_id(), old_id);

            // the late eviction names the dead connection and must not
            // touch the replacement
            manager.evict("k", old_id).await;
            assert!(!fresh.is_closed());
            let cached = manager.get("k", &addr).await.unwrap();
            assert_eq!(cached.conn_id(), fresh.conn_id());

            // an eviction naming the live connection does remove it
            manager.evict("k", fresh.conn_id()).await;
            assert!(fresh.is_closed());
        });
    }

    #[test]
    fn test_remove_is_unconditional() {
        rt().block_on(async {
            let addr = accept_and_hold().await;
            let manager = ConnManager::new(Codec::default(), TimeoutSetting::default());
            let conn = manager.get("k", &addr).await.unwrap();
            manager.remove("k").await;
            assert!(conn.is_closed());
        });
    }
}
