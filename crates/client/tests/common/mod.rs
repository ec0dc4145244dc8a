//! In-process data server for integration tests
//!
//! Paths understood by the mock:
//!
//! | path          | info/                 | slice/                          |
//! |---------------|-----------------------|---------------------------------|
//! | `missing`     | 404                   | 404                             |
//! | `broken`      | one-line body         | endless                         |
//! | `FINITE:<n>`  | `[n, 64, 64]`         | `n` frames, then closing marker |
//! | `NOBOUNDARY`  | `[64, 64]`            | `image/jpeg` with no multipart  |
//! | anything else | `[512, 512]` int32    | endless multipart stream        |

#![allow(dead_code)]

use axum::body::{Body, Bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const BOUNDARY: &str = "frame";

#[derive(Clone)]
struct MockState {
    stream_requests: Arc<AtomicUsize>,
    ws_messages: Arc<Mutex<Vec<String>>>,
    events: broadcast::Sender<String>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: MockState,
}

impl MockServer {
    pub async fn start() -> Self {
        let (events, _) = broadcast::channel(64);
        let state = MockState {
            stream_requests: Arc::new(AtomicUsize::new(0)),
            ws_messages: Arc::new(Mutex::new(Vec::new())),
            events,
        };

        let app = Router::new()
            .route("/info/", get(info))
            .route("/slice/", get(slice))
            .route("/event/", get(event))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of requests made to the streaming endpoint
    pub fn stream_requests(&self) -> usize {
        self.state.stream_requests.load(Ordering::SeqCst)
    }

    /// Text messages received on the event socket
    pub fn ws_messages(&self) -> Vec<String> {
        self.state.ws_messages.lock().clone()
    }

    /// Push a text message to every open event socket
    pub fn publish(&self, text: impl Into<String>) {
        let _ = self.state.events.send(text.into());
    }

    /// Wait until the event socket has received `text`
    pub async fn wait_for_message(&self, text: &str) -> bool {
        for _ in 0..500 {
            if self.ws_messages().iter().any(|m| m == text) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

pub fn part(payload: &str) -> Bytes {
    Bytes::from(format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n{}\r\n",
        BOUNDARY,
        payload.len(),
        payload
    ))
}

fn finite_count(path: &str) -> Option<usize> {
    path.strip_prefix("FINITE:").and_then(|n| n.parse().ok())
}

async fn info(Query(query): Query<HashMap<String, String>>) -> Response {
    let path = query.get("path").map(String::as_str).unwrap_or_default();
    match path {
        "missing" => (StatusCode::NOT_FOUND, "No such file: missing").into_response(),
        "broken" => "image\n".into_response(),
        "NOBOUNDARY" => "image\n[64, 64]\n1\n1\n".into_response(),
        _ => match finite_count(path) {
            Some(n) => format!("stack\n[{}, 64, 64]\n2\n2\n[-1, 64, 64]\n", n).into_response(),
            None => "image\n[512, 512]\n3\n4\n".into_response(),
        },
    }
}

async fn slice(
    State(state): State<MockState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.stream_requests.fetch_add(1, Ordering::SeqCst);
    let path = query.get("path").cloned().unwrap_or_default();

    if path == "missing" {
        return (StatusCode::NOT_FOUND, "No such file: missing").into_response();
    }
    if path == "NOBOUNDARY" {
        return ([(header::CONTENT_TYPE, "image/jpeg")], "not a stream").into_response();
    }

    let body = match finite_count(&path) {
        Some(n) => {
            let parts: Vec<Result<Bytes, std::io::Error>> = (0..n)
                .map(|i| Ok(part(&format!("frame-{}", i))))
                .chain(std::iter::once(Ok(Bytes::from(format!("--{}--\r\n", BOUNDARY)))))
                .collect();
            Body::from_stream(futures::stream::iter(parts))
        }
        None => Body::from_stream(futures::stream::unfold(0u64, |n| async move {
            Some((
                Ok::<_, std::io::Error>(part(&format!("frame-{}", n))),
                n + 1,
            ))
        })),
    };

    (
        [(
            header::CONTENT_TYPE,
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        )],
        body,
    )
        .into_response()
}

async fn event(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    let mut events = state.events.subscribe();
    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => state.ws_messages.lock().push(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}
