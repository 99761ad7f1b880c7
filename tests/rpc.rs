use async_trait::async_trait;
use serde_json::{json, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use labwire::protocol::codec::{self, read_frame, write_frame};
use labwire::{
    //
    MethodError,
    MethodTable,
    Params,
    RemoteErrorKind,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcObject,
    RpcResponse,
    RpcServer,
    ServerConfig,
};

/// A stateful object implementing the trait by hand.
struct Thermometer {
    reads: AtomicUsize,
}

#[async_trait]
impl RpcObject for Thermometer {
    // ---
    fn methods(&self) -> Vec<String> {
        vec!["read".into(), "reads".into(), "_calibrate".into()]
    }

    async fn invoke(&self, method: &str, params: Params) -> Result<Value, MethodError> {
        // ---
        match method {
            "read" => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                let unit: Option<String> = params.get_opt(0, "unit")?;
                match unit.as_deref() {
                    None | Some("C") => Ok(json!(21.5)),
                    Some("F") => Ok(json!(70.7)),
                    Some(other) => Err(MethodError::invalid_argument(format!("unknown unit {other}"))),
                }
            }
            "reads" => Ok(json!(self.reads.load(Ordering::SeqCst))),
            _ => Err(MethodError::unsupported(method)),
        }
    }
}

struct TestServer {
    server: RpcServer,
    notified: Arc<AtomicUsize>,
    thermometer: Arc<Thermometer>,
}

impl TestServer {
    // ---
    async fn start() -> Self {
        // ---
        init_logging();

        let config = ServerConfig::default()
            .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_name("bench");
        let server = RpcServer::bind(config).await.unwrap();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();

        let foo = MethodTable::new()
            .method("bar", |_: Params| async { Ok::<_, MethodError>("bar") })
            .method("baz", |p: Params| async move {
                let a: i64 = p.get(0, "a")?;
                let b: i64 = p.get(1, "b")?;
                Ok(a * b)
            });
        server.register_object("foo", Arc::new(foo)).await.unwrap();

        let dev = MethodTable::new()
            .method("fail", |_: Params| async {
                Err::<(), _>(MethodError::runtime("bad arg"))
            })
            .method("slow", |_: Params| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, MethodError>("late")
            })
            .method("poke", move |_: Params| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MethodError>(())
                }
            })
            .method("crash", |_: Params| async {
                let readings: Vec<f64> = Vec::new();
                Ok::<_, MethodError>(readings[3])
            });

        let thermometer = Arc::new(Thermometer {
            reads: AtomicUsize::new(0),
        });

        server.register_object("dev", Arc::new(dev)).await.unwrap();
        server
            .register_object("thermo", thermometer.clone())
            .await
            .unwrap();
        server.spawn().unwrap();

        Self {
            server,
            notified,
            thermometer,
        }
    }

    fn config(&self) -> RpcConfig {
        RpcConfig::new("127.0.0.1", self.server.port())
    }

    async fn client(&self) -> RpcClient {
        RpcClient::connect(self.config()).await.unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

#[tokio::test]
async fn test_method_discovery() {
    // ---
    let bench = TestServer::start().await;
    bench.server.unregister_object("dev").await;
    bench.server.unregister_object("thermo").await;

    let client = bench.client().await;

    assert_eq!(client.methods(), vec!["foo.bar", "foo.baz"]);
    let names: Vec<String> = client.proxies().iter().map(|p| p.name().to_string()).collect();
    assert_eq!(names, vec!["foo.bar", "foo.baz"]);

    let result = client.call("rpc_getMethods", Params::new()).await.unwrap();
    assert_eq!(result, json!(["foo.bar", "foo.baz"]));
}

#[tokio::test]
async fn test_refresh_sees_new_objects() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;
    assert!(!client.has_method("extra.ping"));

    let extra = MethodTable::new().method("ping", |_: Params| async { Ok::<_, MethodError>("pong") });
    bench.server.register_object("extra", Arc::new(extra)).await.unwrap();

    client.refresh().await.unwrap();
    assert!(client.has_method("extra.ping"));

    bench.server.unregister_object("extra").await;
    client.refresh().await.unwrap();
    assert!(!client.has_method("extra.ping"));
}

#[tokio::test]
async fn test_call_with_positional_and_named_args() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let product: i64 = client
        .call_as("foo.baz", Params::new().arg(6).kwarg("b", 7))
        .await
        .unwrap();
    assert_eq!(product, 42);

    let temp: f64 = client
        .call_as("thermo.read", Params::new().kwarg("unit", "F"))
        .await
        .unwrap();
    assert_eq!(temp, 70.7);
    assert_eq!(bench.thermometer.reads.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_nested_proxy() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let bar = client.method("foo").attr("bar");
    assert_eq!(bar.name(), "foo.bar");
    assert!(bar.exists());
    assert_eq!(bar.call(Params::new()).await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_server_exception_carries_message() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    match client.call("dev.fail", Params::new()).await {
        Err(RpcError::ServerException { kind, message }) => {
            assert_eq!(kind, RemoteErrorKind::Runtime("RuntimeError".into()));
            assert!(message.contains("bad arg"));
        }
        other => panic!("expected server exception, got {other:?}"),
    }

    match client.call("thermo.read", Params::new().arg("K")).await {
        Err(RpcError::ServerException { kind, .. }) => {
            assert_eq!(kind, RemoteErrorKind::InvalidArgument);
        }
        other => panic!("expected server exception, got {other:?}"),
    }
}

#[tokio::test]
async fn test_panic_reported_and_connection_survives() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let err = client.call("dev.crash", Params::new()).await.unwrap_err();
    assert!(matches!(
        err,
        RpcError::ServerException {
            kind: RemoteErrorKind::Panic,
            ..
        }
    ));

    assert_eq!(client.call("foo.bar", Params::new()).await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_method_not_found() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    for method in ["foo.missing", "nobody.bar", "thermo._calibrate", "_private"] {
        let err = client.call(method, Params::new()).await.unwrap_err();
        assert!(
            matches!(&err, RpcError::MethodNotFound(m) if m == method),
            "{method}: {err:?}"
        );
    }
}

#[tokio::test]
async fn test_invalid_params() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let err = client
        .call("foo.baz", Params::new().arg("six"))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::InvalidParams(_)));
}

#[tokio::test]
async fn test_notify_runs_without_response() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    client.notify("dev.poke", Params::new()).await.unwrap();
    client.notify("dev.poke", Params::new()).await.unwrap();

    // Requests on one connection are handled in order
    client.call("foo.bar", Params::new()).await.unwrap();
    assert_eq!(bench.notified.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_timeout_then_recovers() {
    // ---
    let bench = TestServer::start().await;
    let client = RpcClient::connect(bench.config().with_request_timeout(Duration::from_millis(100)))
        .await
        .unwrap();

    let err = client.call("dev.slow", Params::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout));

    assert_eq!(client.call("foo.bar", Params::new()).await.unwrap(), json!("bar"));
}

#[tokio::test]
async fn test_builtins_and_hostname() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    assert!(client.hostname().is_some_and(|h| !h.is_empty()));

    let port: u16 = client.call_as("rpc_getPort", Params::new()).await.unwrap();
    assert_eq!(port, bench.server.port());

    let connections: usize = client.call_as("rpc_getConnections", Params::new()).await.unwrap();
    assert!(connections >= 1);

    let uptime: f64 = client.call_as("rpc_uptime", Params::new()).await.unwrap();
    assert!(uptime >= 0.0);
}

#[tokio::test]
async fn test_concurrent_clients() {
    // ---
    let bench = TestServer::start().await;

    let mut handles = Vec::new();
    for i in 0..8i64 {
        let client = bench.client().await;
        handles.push(tokio::spawn(async move {
            client
                .call_as::<i64>("foo.baz", Params::new().arg(i).arg(2))
                .await
                .unwrap()
        }));
    }

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap(), i as i64 * 2);
    }
}

#[tokio::test]
async fn test_shared_client_serializes_calls() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let calls: Vec<_> = (0..10i64)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call_as::<i64>("foo.baz", Params::new().arg(i).arg(i))
                    .await
            })
        })
        .collect();

    for (i, call) in calls.into_iter().enumerate() {
        let i = i as i64;
        assert_eq!(call.await.unwrap().unwrap(), i * i);
    }
}

#[tokio::test]
async fn test_notifications_reach_callbacks() {
    // ---
    let bench = TestServer::start().await;
    let client = bench.client().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    client.register_callback("handle_event", move |params: &Params| {
        let _ = tx.send(params.args().to_vec());
    });

    let addr = client.enable_notifications().await.unwrap();
    assert!(client.notifications_enabled());
    assert_eq!(bench.server.listeners(), vec![addr]);

    let sent = bench
        .server
        .notify_clients("handle_event", Params::new().arg("resource_added"))
        .await
        .unwrap();
    assert_eq!(sent, 1);

    let args = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(args, vec![json!("resource_added")]);

    client.disable_notifications().await.unwrap();
    assert!(bench.server.listeners().is_empty());
    assert_eq!(
        bench
            .server
            .notify_clients("handle_event", Params::new())
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_server_not_found() {
    // ---
    init_logging();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = RpcClient::connect(RpcConfig::new("127.0.0.1", port))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, RpcError::ServerNotFound(_)));
}

/// Fake server that closes the first connection as soon as it sees a
/// `dev.flaky` request and answers it on the next one.
async fn flaky_server() -> (u16, Arc<AtomicUsize>) {
    // ---
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        let mut drop_next_flaky = true;
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);

            'conn: while let Ok(Some(frame)) = read_frame(&mut stream, 1 << 20).await {
                if codec::decode_hello(&frame).is_some() {
                    continue;
                }
                let batch = codec::decode(&frame);
                let mut responses = Vec::new();

                for req in batch.requests {
                    let Some(id) = req.id() else { continue };
                    let result = match req.method() {
                        "rpc_getHostname" => json!("fake"),
                        "rpc_getMethods" => json!(["dev.flaky"]),
                        "dev.flaky" if drop_next_flaky => {
                            drop_next_flaky = false;
                            break 'conn;
                        }
                        "dev.flaky" => json!(42),
                        _ => continue,
                    };
                    responses.push(RpcResponse::result(id, result));
                }

                let payload = codec::encode(&[], &responses).unwrap();
                write_frame(&mut stream, &payload).await.unwrap();
            }
        }
    });

    (port, accepted)
}

#[tokio::test]
async fn test_reset_connection_is_retried_once() {
    // ---
    init_logging();
    let (port, accepted) = flaky_server().await;

    let client = RpcClient::connect(RpcConfig::new("127.0.0.1", port)).await.unwrap();
    assert_eq!(client.hostname().as_deref(), Some("fake"));

    let value: i64 = client.call_as("dev.flaky", Params::new()).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_reset_without_retry_is_connection_lost() {
    // ---
    init_logging();
    let (port, _) = flaky_server().await;

    let client = RpcClient::connect(RpcConfig::new("127.0.0.1", port).with_retry(None))
        .await
        .unwrap();

    let err = client.call("dev.flaky", Params::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::ConnectionLost));

    // The next call opens a fresh connection
    let value: i64 = client.call_as("dev.flaky", Params::new()).await.unwrap();
    assert_eq!(value, 42);
}

#[tokio::test]
async fn test_shutdown_releases_running_call() {
    // ---
    init_logging();
    let config = ServerConfig::default()
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_name("stopping");
    let server = RpcServer::bind(config).await.unwrap();
    let dev = MethodTable::new().method("stuck", |_: Params| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        Ok::<_, MethodError>("done")
    });
    server.register_object("dev", Arc::new(dev)).await.unwrap();
    let handle = server.spawn().unwrap();

    let client = RpcClient::connect(
        RpcConfig::new("127.0.0.1", server.port())
            .with_request_timeout(Duration::from_secs(10))
            .with_retry(None),
    )
    .await
    .unwrap();

    let call = tokio::spawn(async move { client.call("dev.stuck", Params::new()).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    server.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("call still blocked after shutdown")
        .unwrap();
    assert!(matches!(result, Err(RpcError::ConnectionLost)), "got {result:?}");
    assert!(started.elapsed() < Duration::from_secs(1));

    handle.await.unwrap();
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
