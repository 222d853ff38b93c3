//! Provider stream -> normalized relay events.

use crate::llm::{ChatMessage, ChatRequest, Provider};
use crate::sse::{self, LineDecoder, DONE_SENTINEL};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Content(String),
    Done,
}

impl RelayEvent {
    /// The `data:` payload this event is written as.
    pub fn payload(&self) -> String {
        match self {
            RelayEvent::Content(text) => sse::content_payload(text),
            RelayEvent::Done => DONE_SENTINEL.to_string(),
        }
    }
}

/// Prepend the system prompt, falling back to `default_prompt` when the
/// request has none (or an empty one).
pub fn upstream_messages(request: ChatRequest, default_prompt: &str) -> Vec<ChatMessage> {
    let prompt = request
        .system_prompt
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| default_prompt.to_string());

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    messages.push(ChatMessage::system(prompt));
    messages.extend(request.messages);
    messages
}

/// Incremental decoder for one upstream response body.
///
/// Once the sentinel has been seen, further lines produce nothing.
#[derive(Debug)]
pub struct UpstreamDecoder {
    provider: Provider,
    lines: LineDecoder,
    done: bool,
}

impl UpstreamDecoder {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            lines: LineDecoder::new(),
            done: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<RelayEvent> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.decode_line(line))
            .collect()
    }

    pub fn finish(mut self) -> Vec<RelayEvent> {
        let rest = std::mem::take(&mut self.lines).finish();
        rest.and_then(|line| self.decode_line(&line))
            .into_iter()
            .collect()
    }

    fn decode_line(&mut self, line: &str) -> Option<RelayEvent> {
        let payload = sse::data_payload(line)?;
        if self.done {
            return None;
        }
        if payload == DONE_SENTINEL {
            self.done = true;
            return Some(RelayEvent::Done);
        }
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(value) => self
                .provider
                .extract_delta(&value)
                .map(|text| RelayEvent::Content(text.to_string())),
            Err(err) => {
                debug!(error = %err, "Skipping malformed upstream line");
                None
            }
        }
    }
}

/// Logs when the downstream side drops the relay stream before the upstream
/// body has been fully read. Dropping the stream drops the upstream response,
/// which closes that connection.
struct UpstreamGuard {
    profile: &'static str,
    finished: bool,
}

impl Drop for UpstreamGuard {
    fn drop(&mut self) {
        if !self.finished {
            info!(profile = self.profile, "Client went away, closing upstream request");
        }
    }
}

/// Re-stream an upstream body as normalized events.
///
/// Reads are processed strictly in order. A read error or an early close
/// ends the stream without a `Done`, which the client treats as a failure.
pub fn relay_events<S, B, E>(
    provider: Provider,
    upstream: S,
) -> impl Stream<Item = RelayEvent> + Send + 'static
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut guard = UpstreamGuard { profile: provider.kind(), finished: false };
        let mut upstream = Box::pin(upstream);
        let mut decoder = UpstreamDecoder::new(provider);
        let mut failed = false;

        while let Some(read) = upstream.next().await {
            match read {
                Ok(chunk) => {
                    for event in decoder.push(chunk.as_ref()) {
                        yield event;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Upstream stream failed");
                    failed = true;
                    break;
                }
            }
        }

        if !failed {
            let mut done = decoder.is_done();
            for event in decoder.finish() {
                done |= event == RelayEvent::Done;
                yield event;
            }
            if !done {
                warn!("Upstream closed before the end-of-stream marker");
            }
        }
        guard.finished = true;
    }
}
