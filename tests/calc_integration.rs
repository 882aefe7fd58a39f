//! Integration tests against a real TCP calculator service.
//!
//! The server speaks JSON-RPC 1.0 the way classic `Calc.Compute` services do:
//! every response carries both `result` and `error`, one of them `null`, and
//! errors are plain strings. `Calc.Subscribe` pushes an `id == 0`
//! notification before answering.
//!
//! # Running
//!
//! ```bash
//! cargo test --test calc_integration -- --nocapture
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use linerpc::{
    completion, Client, ClientConfig, ClientError, MethodCall, Notifications, Reply,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Test timeout to prevent hanging tests.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Args {
    #[serde(rename = "A")]
    a: f64,
    #[serde(rename = "B")]
    b: f64,
    #[serde(rename = "Op")]
    op: String,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct CalcReply {
    #[serde(rename = "Msg", default)]
    msg: String,
    #[serde(rename = "Data")]
    data: f64,
}

fn compute(args: &Args) -> Result<CalcReply, String> {
    let data = match args.op.as_str() {
        "+" => args.a + args.b,
        "-" => args.a - args.b,
        "*" => args.a * args.b,
        "/" if args.b == 0.0 => return Err("in divide op, B can't be zero".to_string()),
        "/" => args.a / args.b,
        other => return Err(format!("unsupported op:{}", other)),
    };
    Ok(CalcReply {
        msg: "ok".to_string(),
        data,
    })
}

/// Answer one request line, optionally pushing a notification first.
fn respond(line: &str) -> Vec<Value> {
    let request: Value = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => return Vec::new(),
    };
    let id = request["id"].clone();

    match request["method"].as_str() {
        Some("Calc.Compute") => {
            let args: Result<Vec<Args>, _> = serde_json::from_value(request["params"].clone());
            let outcome = match args.as_deref() {
                Ok([args]) => compute(args),
                _ => Err("expected exactly one argument".to_string()),
            };
            match outcome {
                Ok(reply) => vec![json!({"id": id, "result": reply, "error": null})],
                Err(message) => vec![json!({"id": id, "result": null, "error": message})],
            }
        }
        Some("Calc.Subscribe") => vec![
            json!({"id": 0, "method": "push.event", "params": ["subscribed"]}),
            json!({"id": id, "result": true, "error": null}),
        ],
        Some(other) => vec![json!({
            "id": id,
            "result": null,
            "error": format!("rpc: can't find method {}", other)
        })],
        None => Vec::new(),
    }
}

/// Start a calculator server on an ephemeral port.
async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("No local address");

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    for frame in respond(&line) {
                        let text = format!("{}\n", frame);
                        if write_half.write_all(text.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    addr
}

fn compute_request(a: f64, b: f64, op: &str) -> MethodCall<Vec<Args>> {
    MethodCall::new(
        "Calc.Compute",
        vec![Args {
            a,
            b,
            op: op.to_string(),
        }],
    )
}

#[tokio::test]
async fn test_calc_compute_add_and_subtract() {
    let addr = start_server().await;
    let client = Client::dial(addr, Notifications::none(), ClientConfig::default())
        .await
        .expect("Should connect to server");

    let reply = timeout(
        TEST_TIMEOUT,
        client.call(compute_request(10.0, 20.0, "+"), Reply::<CalcReply>::new()),
    )
    .await
    .expect("Test timed out")
    .expect("Call should succeed");
    assert_eq!(reply.result.get().map(|r| r.data), Some(30.0));

    let reply = timeout(
        TEST_TIMEOUT,
        client.call(compute_request(10.0, 20.0, "-"), Reply::<CalcReply>::new()),
    )
    .await
    .expect("Test timed out")
    .expect("Call should succeed");
    assert_eq!(reply.result.get().map(|r| r.data), Some(-10.0));

    client.close().await.expect("Close should succeed");
}

#[tokio::test]
async fn test_many_concurrent_calls_on_one_connection() {
    let addr = start_server().await;
    let client = Client::dial(addr, Notifications::none(), ClientConfig::default())
        .await
        .expect("Should connect to server");

    let (done, mut rx) = completion(50).expect("Capacity is non-zero");
    for i in 0..50 {
        let request = compute_request(f64::from(i), 1.0, "*");
        let sent = client.go(request, Reply::<CalcReply>::new(), &done).await;
        assert!(sent.is_some(), "Call {} should be sent", i);
    }

    for _ in 0..50 {
        let call = timeout(TEST_TIMEOUT, rx.recv())
            .await
            .expect("Test timed out")
            .expect("Channel closed");
        assert!(call.error().is_none(), "Call failed: {:?}", call.error());
        let a = call.request().params[0].a;
        assert_eq!(call.reply().result.get().map(|r| r.data), Some(a));
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_request_surfaces_string_server_error() {
    let addr = start_server().await;
    let client = Client::dial(addr, Notifications::none(), ClientConfig::default())
        .await
        .expect("Should connect to server");

    let result: Result<CalcReply, ClientError> = timeout(
        TEST_TIMEOUT,
        client.request("Calc.Compute", json!([{"A": 1, "B": 0, "Op": "/"}])),
    )
    .await
    .expect("Test timed out");

    match result {
        Err(ClientError::Server { message, .. }) => {
            assert_eq!(message, "in divide op, B can't be zero");
        }
        other => panic!("Expected ServerError, got {:?}", other),
    }
}

#[tokio::test]
async fn test_push_notification_delivered_out_of_band() {
    let addr = start_server().await;
    let (notifications, mut messages, _errors) = Notifications::channels(8);
    let client = Client::dial(addr, notifications, ClientConfig::default())
        .await
        .expect("Should connect to server");

    let subscribed: bool = timeout(TEST_TIMEOUT, client.request("Calc.Subscribe", json!([])))
        .await
        .expect("Test timed out")
        .expect("Subscribe should succeed");
    assert!(subscribed);

    let push = timeout(TEST_TIMEOUT, messages.recv())
        .await
        .expect("Test timed out")
        .expect("Channel closed");
    assert_eq!(push.id, 0);
    assert_eq!(push.method, "push.event");
    let params: Option<Vec<String>> = push.params_as().expect("Params should decode");
    assert_eq!(params, Some(vec!["subscribed".to_string()]));
}

#[tokio::test]
async fn test_connect_to_closed_port_fails_fast() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = timeout(
        Duration::from_secs(2),
        Client::dial(addr, Notifications::none(), ClientConfig::default()),
    )
    .await;

    match result {
        Ok(Ok(_)) => panic!("Should not connect to a closed port"),
        Ok(Err(e)) => assert!(matches!(e, ClientError::Connect(_))),
        Err(_) => panic!("Should not timeout - connection should fail fast"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_dial_unix_socket() {
    use tokio::net::UnixListener;

    let socket_path = std::env::temp_dir().join(format!(
        "linerpc-test-{}-{}.sock",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    let listener = UnixListener::bind(&socket_path).expect("Create socket");

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                for frame in respond(&line) {
                    let _ = write_half.write_all(format!("{}\n", frame).as_bytes()).await;
                }
            }
        }
    });

    let client = Client::dial_unix(&socket_path, Notifications::none(), ClientConfig::default())
        .await
        .expect("Should connect over unix socket");
    let reply = timeout(
        TEST_TIMEOUT,
        client.call(compute_request(2.0, 3.0, "*"), Reply::<CalcReply>::new()),
    )
    .await
    .expect("Test timed out")
    .expect("Call should succeed");
    assert_eq!(reply.result.into_inner().map(|r| r.data), Some(6.0));

    let _ = std::fs::remove_file(&socket_path);
}
