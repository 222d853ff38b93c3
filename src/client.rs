//! Client side of a turn: post the history to the relay and decode its
//! normalized event stream.

use crate::llm::{ChatMessage, ChatRequest};
use crate::sse::{self, ContentPayload, LineDecoder, DONE_SENTINEL};
use futures::{Stream, StreamExt};
use reqwest::Client;
use std::fmt::Display;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One step of a streamed reply. A stream yields any number of `Chunk`s
/// followed by at most one terminal `Done` or `Error`, and nothing after it.
#[derive(Debug)]
pub enum StreamEvent {
    Chunk(String),
    Done,
    Error(StreamError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Relay returned status {0}")]
    Status(u16),
    #[error("Stream read failed: {0}")]
    Read(String),
    #[error("Stream closed before completion")]
    PrematureClose,
}

/// Decoder for the relay's `data: {"content": ...}` / `data: [DONE]` lines.
/// Lines of any other shape are noise and skipped.
#[derive(Debug, Default)]
pub struct RelayDecoder {
    lines: LineDecoder,
    done: bool,
}

impl RelayDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    pub fn finish(mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.lines).finish();
        rest.and_then(|line| self.decode_line(&line))
            .into_iter()
            .collect()
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        if self.done {
            return None;
        }
        let payload = sse::data_payload(line)?;
        if payload == DONE_SENTINEL {
            self.done = true;
            return Some(StreamEvent::Done);
        }
        match serde_json::from_str::<ContentPayload>(payload) {
            Ok(ContentPayload { content }) if !content.is_empty() => {
                Some(StreamEvent::Chunk(content))
            }
            Ok(_) => None,
            Err(err) => {
                debug!(error = %err, "Ignoring unrecognized relay line");
                None
            }
        }
    }
}

/// Decode a relay response body into [`StreamEvent`]s.
///
/// Cancellation is checked at every read boundary and before every yield;
/// once observed the stream simply ends, without a terminal event. A body
/// that ends before the sentinel yields `Error(PrematureClose)`.
pub fn decode_relay_stream<S, B, E>(
    body: S,
    cancel: CancellationToken,
) -> impl Stream<Item = StreamEvent> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut body = Box::pin(body);
        let mut decoder = RelayDecoder::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                read = body.next() => Some(read),
            };
            let Some(read) = read else {
                debug!("Stream cancelled");
                return;
            };

            match read {
                Some(Ok(bytes)) => {
                    for event in decoder.push(bytes.as_ref()) {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let terminal = event.is_terminal();
                        yield event;
                        if terminal {
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    yield StreamEvent::Error(StreamError::Read(err.to_string()));
                    return;
                }
                None => break,
            }
        }

        for event in decoder.finish() {
            if cancel.is_cancelled() {
                return;
            }
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                return;
            }
        }
        yield StreamEvent::Error(StreamError::PrematureClose);
    }
}

/// HTTP client for the relay's chat endpoint.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: Client,
    endpoint: String,
}

impl RelayClient {
    pub fn new(relay_url: &str) -> Self {
        Self::with_client(Client::new(), relay_url)
    }

    pub fn with_client(http: Client, relay_url: &str) -> Self {
        Self {
            http,
            endpoint: format!("{}/api/chat", relay_url.trim_end_matches('/')),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open one streaming turn. Dropping the returned stream, or cancelling
    /// `cancel`, closes the connection to the relay.
    pub fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        system_prompt: Option<String>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = StreamEvent> + Send + 'static {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();

        async_stream::stream! {
            let request = ChatRequest { messages, system_prompt };
            let send = http.post(&endpoint).json(&request).send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                response = send => Some(response),
            };
            let Some(response) = response else {
                debug!("Turn cancelled before the relay answered");
                return;
            };

            let response = match response {
                Ok(response) => response,
                Err(err) => {
                    yield StreamEvent::Error(StreamError::Transport(err));
                    return;
                }
            };
            if !response.status().is_success() {
                yield StreamEvent::Error(StreamError::Status(response.status().as_u16()));
                return;
            }

            let events = decode_relay_stream(response.bytes_stream(), cancel);
            futures::pin_mut!(events);
            while let Some(event) = events.next().await {
                yield event;
            }
        }
    }
}
