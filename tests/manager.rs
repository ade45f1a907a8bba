mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::TcpListener;

use drover_rpc::proto::{Request, Response};
use drover_rpc::{discovery, frame};
use drover_rpc::{Codec, CodecKind, Context, Mode, RpcClient, ServiceInstance};

fn instance(name: &str, port: u16) -> ServiceInstance {
    ServiceInstance {
        key: format!("127.0.0.1:{}", port),
        name: name.to_string(),
        address: "127.0.0.1".to_string(),
        port,
        methods: Vec::new(),
        time: 0,
    }
}

/// Echo server that counts accepted connections.
async fn counting_echo_server(listener: TcpListener, accepts: Arc<AtomicUsize>) {
    loop {
        let (stream, _) = listener.accept().await.unwrap();
        accepts.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let (mut rd, mut wr) = stream.into_split();
            let codec = Codec::default();
            let mut buf = BytesMut::with_capacity(512);
            loop {
                if frame::read_frame(&mut rd, &mut buf).await.is_err() {
                    return;
                }
                let req: Request = codec.decode(CodecKind::Msgpack, &buf).unwrap();
                let mut resp = Response::reply_to(&req);
                resp.reply = Some(req.arg.clone());
                let out = codec.encode(CodecKind::Msgpack, &resp).unwrap();
                if frame::write_frame(&mut wr, &out).await.is_err() {
                    return;
                }
            }
        });
    }
}

#[test]
fn test_connection_reuse_and_eviction() {
    common::setup().block_on(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepts = Arc::new(AtomicUsize::new(0));
        tokio::spawn(counting_echo_server(listener, accepts.clone()));

        let (handle, events) = discovery::channel();
        let client = RpcClient::new(common::test_config(), events);
        handle.online(instance("echo", port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = Context::background().with_timeout(Duration::from_secs(5));
        for i in 0u64..3 {
            let got: u64 = client.call(&ctx, Mode::Random, "echo", "Echo", &i).await.unwrap();
            assert_eq!(got, i);
        }
        // three sequential calls share one connection
        assert_eq!(accepts.load(Ordering::SeqCst), 1);

        // an offline notification evicts the cached connection
        let key = format!("127.0.0.1:{}", port);
        handle.offline(key);
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.online(instance("echo", port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let got: u64 = client.call(&ctx, Mode::Random, "echo", "Echo", &9).await.unwrap();
        assert_eq!(got, 9);
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
        client.close().await;
    });
}

#[test]
fn test_dial_failure() {
    common::setup().block_on(async {
        // grab a free port and release it; nothing listens there
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let (handle, events) = discovery::channel();
        let client = RpcClient::new(common::test_config(), events);
        handle.online(instance("ghost", port));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ctx = Context::background().with_timeout(Duration::from_secs(2));
        let err =
            client.call::<u64, u64>(&ctx, Mode::Random, "ghost", "Echo", &1).await.unwrap_err();
        assert_eq!(err.code, drover_rpc::error::CONNECT_CLOSE);
        client.close().await;
    });
}
