mod common;

use common::{
    config_for, delta, held_upstream, mount_reply, mount_slow_reply, sse_body, streaming_reply,
    HeldUpstream,
};
use qchat::client::RelayClient;
use qchat::config::{ProfileConfig, RelayConfig};
use qchat::db::Database;
use qchat::llm::Role;
use qchat::session::{ChatSession, TurnOutcome};
use qchat::store::{ConversationStore, StoreEvent, FALLBACK_REPLY};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::time::timeout;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_relay(config: RelayConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(qchat::serve(listener, config));
    format!("http://{}", addr)
}

const CLOSE_DEADLINE: Duration = Duration::from_secs(5);

async fn session_with(config: RelayConfig) -> ChatSession {
    let relay_url = start_relay(config).await;
    let store = ConversationStore::load(Database::open_in_memory().unwrap()).unwrap();
    ChatSession::new(Arc::new(store), RelayClient::new(&relay_url))
}

async fn session_for(upstream: &MockServer) -> ChatSession {
    session_with(config_for(upstream, None, Some("groq-key"))).await
}

async fn session_against(upstream: &HeldUpstream) -> ChatSession {
    session_with(RelayConfig {
        primary: Some(ProfileConfig::thesys("thesys-key").with_base_url(upstream.base_url.as_str())),
        ..RelayConfig::default()
    })
    .await
}

fn reply_of(session: &ChatSession, conversation_id: &str) -> (Role, String) {
    let conversation = session.store().get(conversation_id).unwrap();
    let last = conversation.messages.last().unwrap();
    (last.role, last.content.clone())
}

#[tokio::test]
async fn full_turn_streams_into_the_store() {
    let upstream = MockServer::start().await;
    mount_reply(&upstream, streaming_reply(&["Hel", "lo, ", "world"])).await;
    let session = session_for(&upstream).await;
    let mut updates = session.store().subscribe();

    let handle = session.send("What DSCR programs are there?").unwrap();
    let id = handle.conversation_id().to_string();
    assert_eq!(handle.join().await, TurnOutcome::Done);

    assert_eq!(reply_of(&session, &id), (Role::Assistant, "Hello, world".to_string()));
    let conversation = session.store().get(&id).unwrap();
    assert_eq!(conversation.title, "What DSCR programs are there?");
    assert_eq!(conversation.messages.len(), 2);

    let mut contents = Vec::new();
    while let Ok(event) = updates.try_recv() {
        if let StoreEvent::ContentUpdated { content, .. } = event {
            contents.push(content);
        }
    }
    assert!(!contents.is_empty());
    assert!(contents.windows(2).all(|w| w[1].starts_with(w[0].as_str())));
    assert_eq!(contents.last().unwrap(), "Hello, world");
}

#[tokio::test]
async fn second_turn_sends_the_whole_history() {
    let upstream = MockServer::start().await;
    mount_reply(&upstream, streaming_reply(&["answer"])).await;
    let session = session_for(&upstream).await;

    assert_eq!(session.send("first").unwrap().join().await, TurnOutcome::Done);
    assert_eq!(session.send("second").unwrap().join().await, TurnOutcome::Done);

    let requests = upstream.received_requests().await.unwrap();
    let last: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let roles: Vec<&str> = last["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    assert_eq!(last["messages"][2]["content"], "answer");
}

#[tokio::test]
async fn early_upstream_close_keeps_partial_reply() {
    let upstream = MockServer::start().await;
    mount_reply(&upstream, sse_body(&[delta("Partial "), delta("answer")])).await;
    let session = session_for(&upstream).await;

    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    assert_eq!(handle.join().await, TurnOutcome::Failed);
    assert_eq!(reply_of(&session, &id).1, "Partial answer");
}

#[tokio::test]
async fn upstream_rejection_shows_fallback_reply() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&upstream)
        .await;
    let session = session_for(&upstream).await;

    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    assert_eq!(handle.join().await, TurnOutcome::Failed);
    assert_eq!(reply_of(&session, &id).1, FALLBACK_REPLY);
}

#[tokio::test]
async fn unreachable_relay_shows_fallback_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let store = ConversationStore::load(Database::open_in_memory().unwrap()).unwrap();
    let session = ChatSession::new(Arc::new(store), RelayClient::new(&format!("http://{}", addr)));
    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    assert_eq!(handle.join().await, TurnOutcome::Failed);
    assert_eq!(reply_of(&session, &id).1, FALLBACK_REPLY);
}

#[tokio::test]
async fn cancelling_before_any_chunk_leaves_an_empty_reply() {
    let upstream = MockServer::start().await;
    mount_slow_reply(&upstream, streaming_reply(&["too late"]), Duration::from_secs(2)).await;
    let session = session_for(&upstream).await;

    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    handle.cancel();
    handle.cancel();
    assert_eq!(handle.join().await, TurnOutcome::Cancelled);
    assert_eq!(reply_of(&session, &id), (Role::Assistant, String::new()));
}

#[tokio::test]
async fn cancel_after_first_chunk_closes_the_upstream_request() {
    let upstream = held_upstream(Some(delta("first"))).await;
    let session = session_against(&upstream).await;
    let mut updates = session.store().subscribe();

    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    timeout(CLOSE_DEADLINE, async {
        loop {
            if let Ok(StoreEvent::ContentUpdated { .. }) = updates.recv().await {
                break;
            }
        }
    })
    .await
    .expect("first chunk never arrived");

    let cancelled_at = Instant::now();
    handle.cancel();
    assert_eq!(handle.join().await, TurnOutcome::Cancelled);
    assert_eq!(reply_of(&session, &id).1, "first");

    let closed_at = timeout(CLOSE_DEADLINE, upstream.closed)
        .await
        .expect("upstream connection still open after cancel")
        .unwrap();
    assert!(closed_at.duration_since(cancelled_at) < CLOSE_DEADLINE);
}

#[tokio::test]
async fn cancel_while_upstream_is_silent_closes_the_upstream_request() {
    let upstream = held_upstream(None).await;
    let session = session_against(&upstream).await;

    let handle = session.send("hi").unwrap();
    let id = handle.conversation_id().to_string();
    timeout(CLOSE_DEADLINE, upstream.answered)
        .await
        .expect("relay never reached the upstream")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cancelled_at = Instant::now();
    handle.cancel();
    assert_eq!(handle.join().await, TurnOutcome::Cancelled);
    assert_eq!(reply_of(&session, &id), (Role::Assistant, String::new()));

    let closed_at = timeout(CLOSE_DEADLINE, upstream.closed)
        .await
        .expect("upstream connection still open after cancel")
        .unwrap();
    assert!(closed_at.duration_since(cancelled_at) < CLOSE_DEADLINE);
}

#[tokio::test]
async fn concurrent_turns_fill_their_own_conversations() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("alpha"))
        .respond_with(common::sse_response(streaming_reply(&["reply ", "alpha"])))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("beta"))
        .respond_with(common::sse_response(streaming_reply(&["reply ", "beta"])))
        .mount(&upstream)
        .await;
    let session = session_for(&upstream).await;

    let first = session.send("alpha").unwrap();
    session.store().new_conversation().unwrap();
    let second = session.send("beta").unwrap();
    let (first_id, second_id) = (
        first.conversation_id().to_string(),
        second.conversation_id().to_string(),
    );
    assert_ne!(first_id, second_id);

    let (a, b) = tokio::join!(first.join(), second.join());
    assert_eq!((a, b), (TurnOutcome::Done, TurnOutcome::Done));
    assert_eq!(reply_of(&session, &first_id).1, "reply alpha");
    assert_eq!(reply_of(&session, &second_id).1, "reply beta");
    assert_eq!(session.store().active_id(), Some(second_id));
}
