//! Scripted Kubernetes API server behind a real `kube::Client`, for tests.

use http::{Method, Request, Response, StatusCode};
use kube::client::Body;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tower_test::mock;

/// One expected request and its canned reply. A `Null` reply echoes the
/// request body back.
pub struct Exchange {
    method: Method,
    path: String,
    status: StatusCode,
    reply: Value,
}

impl Exchange {
    pub fn new(method: Method, path: impl Into<String>, status: u16, reply: Value) -> Self {
        Self {
            method,
            path: path.into(),
            status: StatusCode::from_u16(status).unwrap(),
            reply,
        }
    }
}

/// A request as the server received it.
#[derive(Debug)]
pub struct Received {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub body: Value,
}

/// `Status` body of a failed API call.
pub fn status(code: u16, reason: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("request failed: {reason}"),
        "reason": reason,
        "code": code
    })
}

/// Client whose requests are answered from `script`, in order. The handle
/// resolves to everything received once the script is exhausted.
pub fn client(script: Vec<Exchange>) -> (kube::Client, JoinHandle<Vec<Received>>) {
    let (service, mut handle) = mock::pair::<Request<Body>, Response<Body>>();
    let server = tokio::spawn(async move {
        let mut received = Vec::with_capacity(script.len());
        for exchange in script {
            let (request, send) = handle
                .next_request()
                .await
                .expect("client went away before the script ended");
            let (parts, body) = request.into_parts();
            assert_eq!(parts.method, exchange.method, "unexpected request to {}", parts.uri);
            assert_eq!(parts.uri.path(), exchange.path);

            let bytes = body.collect_bytes().await.unwrap();
            let body: Value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            let reply = if exchange.reply.is_null() {
                body.clone()
            } else {
                exchange.reply
            };
            send.send_response(
                Response::builder()
                    .status(exchange.status)
                    .body(Body::from(serde_json::to_vec(&reply).unwrap()))
                    .unwrap(),
            );

            received.push(Received {
                method: parts.method,
                path: parts.uri.path().to_string(),
                query: parts.uri.query().map(str::to_string),
                body,
            });
        }
        received
    });
    (kube::Client::new(service, "default"), server)
}
