mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use tokio::net::TcpListener;

use drover_rpc::server::AuthFn;
use drover_rpc::{discovery, error};
use drover_rpc::{CallError, CodecKind, Context, Mode, RpcClient, RpcConfig, RpcService};

#[derive(Clone, Copy, Serialize, Deserialize)]
struct Pair {
    x: i64,
    y: i64,
}

async fn start_billing(config: RpcConfig) -> (RpcService, u16) {
    let svc = RpcService::new("billing", config);
    svc.register("Add", 1, false, "x + y", |_ctx, arg: Pair| async move { Ok(arg.x + arg.y) });
    svc.register("Withdraw", 1, false, "always short", |_ctx, _arg: Pair| async move {
        Err::<i64, CallError>(CallError::app(1001, "insufficient funds"))
    });
    svc.register("Balance", 2, true, "needs a token", |_ctx, _arg: Pair| async move {
        Ok(42i64)
    });
    let auth: AuthFn = Arc::new(|_ctx: &Context, _method: &str, token: &str| {
        if token == "sesame" {
            Ok(())
        } else {
            Err(CallError::app(401, "bad token"))
        }
    });
    svc.set_auth(auth);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let serving = svc.clone();
    tokio::spawn(async move {
        serving.serve_listener(listener).await;
    });
    (svc, port)
}

async fn connect_client(ports: &[u16]) -> RpcClient {
    let (handle, events) = discovery::channel();
    let client = RpcClient::new(common::test_config(), events);
    for port in ports {
        handle.online(drover_rpc::ServiceInstance {
            key: format!("127.0.0.1:{}", port),
            name: "billing".to_string(),
            address: "127.0.0.1".to_string(),
            port: *port,
            methods: Vec::new(),
            time: 0,
        });
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    client
}

#[test]
fn test_typed_call() {
    common::setup().block_on(async {
        let (svc, port) = start_billing(common::test_config()).await;
        let client = connect_client(&[port]).await;
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        // the advertised instance carries the full method list
        let ins = svc.instance("127.0.0.1", port);
        assert_eq!(ins.key, format!("127.0.0.1:{}", port));
        let mut names: Vec<String> = ins.methods.into_iter().map(|m| m.name).collect();
        names.sort();
        assert_eq!(names, vec!["Add".to_string(), "Balance".to_string(), "Withdraw".to_string()]);

        let sum: i64 = client
            .call(&ctx, Mode::Random, "billing", "Add", &Pair { x: 2, y: 3 })
            .await
            .unwrap();
        assert_eq!(sum, 5);

        // same method over the json payload codec
        let sum: i64 = client
            .call_with(&ctx, Mode::Random, "billing", "add", CodecKind::Json, &Pair {
                x: 40,
                y: 2,
            })
            .await
            .unwrap();
        assert_eq!(sum, 42);

        // custom mode falls back to uniform selection
        let sum: i64 = client
            .call(&ctx, Mode::Custom, "billing", "Add", &Pair { x: 1, y: 1 })
            .await
            .unwrap();
        assert_eq!(sum, 2);

        let err = client
            .call::<Pair, i64>(&ctx, Mode::Random, "billing", "Refund", &Pair { x: 1, y: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code, error::RPC_NOT_FOUND);
        client.close().await;
    });
}

#[test]
fn test_app_error_verbatim_and_not_fused() {
    common::setup().block_on(async {
        let (_svc, port) = start_billing(common::test_config()).await;
        let client = connect_client(&[port]).await;
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        // enough failures to clear the volume floor, all application
        // errors
        for _ in 0..15 {
            let err = client
                .call::<Pair, i64>(&ctx, Mode::Random, "billing", "Withdraw", &Pair {
                    x: 1,
                    y: 0,
                })
                .await
                .unwrap_err();
            assert_eq!(err.code, 1001);
            assert_eq!(err.msg, "insufficient funds");
        }
        client.breaker().sweep();
        assert!(!client.breaker().is_fusing(&format!("127.0.0.1:{}", port), "Withdraw"));
        client.close().await;
    });
}

#[test]
fn test_auth_hook() {
    common::setup().block_on(async {
        let (_svc, port) = start_billing(common::test_config()).await;
        let client = connect_client(&[port]).await;

        let mut ctx = Context::background().with_timeout(Duration::from_secs(5));
        let err = client
            .call::<Pair, i64>(&ctx, Mode::Random, "billing", "Balance", &Pair { x: 0, y: 0 })
            .await
            .unwrap_err();
        assert_eq!(err.code, 401);

        ctx.set_token("sesame");
        let balance: i64 = client
            .call(&ctx, Mode::Random, "billing", "Balance", &Pair { x: 0, y: 0 })
            .await
            .unwrap();
        assert_eq!(balance, 42);
        client.close().await;
    });
}

#[test]
fn test_broadcast_and_range() {
    common::setup().block_on(async {
        let (svc_a, port_a) = start_billing(common::test_config()).await;
        let (_svc_b, port_b) = start_billing(common::test_config()).await;
        let client = connect_client(&[port_a, port_b]).await;
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let results: Vec<(String, Result<i64, CallError>)> = client
            .broadcast(&ctx, "billing", "Add", &Pair { x: 10, y: 5 })
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        for (_key, r) in results {
            assert_eq!(r.unwrap(), 15);
        }

        // one instance down: range mode still lands on the survivor
        svc_a.close().await;
        for _ in 0..4 {
            let sum: i64 = client
                .call(&ctx, Mode::Range, "billing", "Add", &Pair { x: 3, y: 4 })
                .await
                .unwrap();
            assert_eq!(sum, 7);
        }
        client.close().await;
    });
}

#[test]
fn test_graceful_close() {
    common::setup().block_on(async {
        let (svc, port) = start_billing(common::test_config()).await;
        let client = connect_client(&[port]).await;
        let ctx = Context::background().with_timeout(Duration::from_secs(5));

        let sum: i64 = client
            .call(&ctx, Mode::Random, "billing", "Add", &Pair { x: 2, y: 3 })
            .await
            .unwrap();
        assert_eq!(sum, 5);

        svc.close().await;
        // the live connection answers with a structured refusal
        let err = client
            .call::<Pair, i64>(&ctx, Mode::Random, "billing", "Add", &Pair { x: 2, y: 3 })
            .await
            .unwrap_err();
        assert_eq!(err.code, error::INTERNAL_SERVER_ERROR);
        assert!(err.msg.contains("closing"));
        client.close().await;
    });
}

#[test]
fn test_hash_mode_rejected() {
    common::setup().block_on(async {
        let (_svc, port) = start_billing(common::test_config()).await;
        let client = connect_client(&[port]).await;
        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        let err = client
            .call::<Pair, i64>(&ctx, Mode::Hash, "billing", "Add", &Pair { x: 1, y: 1 })
            .await
            .unwrap_err();
        assert!(err.msg.contains("not supported"));
        client.close().await;
    });
}
