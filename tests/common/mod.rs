//! Shared helpers for relay tests: an OpenAI-compatible upstream on wiremock.

#![allow(dead_code)]

use qchat::config::{ProfileConfig, RelayConfig};
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub fn delta(text: &str) -> String {
    json!({"choices":[{"index":0,"delta":{"content":text}}]}).to_string()
}

/// Frame each payload as a `data:` event.
pub fn sse_body(payloads: &[String]) -> String {
    payloads.iter().map(|p| format!("data: {}\n\n", p)).collect()
}

pub fn streaming_reply(chunks: &[&str]) -> String {
    let mut payloads: Vec<String> = chunks.iter().map(|c| delta(c)).collect();
    payloads.push("[DONE]".to_string());
    sse_body(&payloads)
}

pub fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

pub async fn mount_reply(server: &MockServer, body: String) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body))
        .mount(server)
        .await;
}

pub async fn mount_slow_reply(server: &MockServer, body: String, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(body).set_delay(delay))
        .mount(server)
        .await;
}

pub fn config_for(server: &MockServer, thesys: Option<&str>, groq: Option<&str>) -> RelayConfig {
    RelayConfig {
        primary: thesys.map(|key| ProfileConfig::thesys(key).with_base_url(server.uri())),
        fallback: groq.map(|key| ProfileConfig::groq(key).with_base_url(server.uri())),
        ..RelayConfig::default()
    }
}

/// An upstream on a raw socket that answers one request with stream headers,
/// optionally one payload, and then holds the connection open. Reports when
/// the response went out and when the relay closed the connection.
pub struct HeldUpstream {
    pub base_url: String,
    pub answered: oneshot::Receiver<()>,
    pub closed: oneshot::Receiver<Instant>,
}

pub async fn held_upstream(first_payload: Option<String>) -> HeldUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let (answered_tx, answered) = oneshot::channel();
    let (closed_tx, closed) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = Vec::new();
        let mut buf = [0u8; 4096];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            request.extend_from_slice(&buf[..n]);
        }

        let mut response = String::from(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
        );
        if let Some(payload) = first_payload {
            response.push_str(&format!("data: {}\n\n", payload));
        }
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        let _ = answered_tx.send(());

        // Drain whatever is left of the request until the relay hangs up.
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        let _ = closed_tx.send(Instant::now());
    });

    HeldUpstream {
        base_url,
        answered,
        closed,
    }
}
