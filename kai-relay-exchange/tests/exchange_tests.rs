use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kai_relay_core::session::{FileSessionStore, InMemorySessionStore};
use kai_relay_core::{Role, SessionStore, Turn};
use kai_relay_exchange::{
    ChatRequest, ErrorKind, ExchangeController, ExchangeEvent, Normalizer, RawMessage,
};
use kai_relay_providers::{
    FragmentStream, GenerationParams, ProviderResult, StreamEvent, UpstreamError, UpstreamProvider,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_stream::wrappers::ReceiverStream;

/// Deterministic upstream: replies with the concatenation of its fragments
struct Scripted {
    fragments: Vec<String>,
    tail: StreamEvent,
    failure: Option<UpstreamError>,
    calls: Mutex<Vec<Vec<Turn>>>,
}

impl Scripted {
    fn new(fragments: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            tail: StreamEvent::Completed,
            failure: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn faulting(fragments: &[&str], reason: &str) -> Arc<Self> {
        Arc::new(Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            tail: StreamEvent::Faulted(reason.to_string()),
            failure: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn failing(err: UpstreamError) -> Arc<Self> {
        Arc::new(Self {
            fragments: Vec::new(),
            tail: StreamEvent::Completed,
            failure: Some(err),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn record(&self, turns: Vec<Turn>) -> ProviderResult<()> {
        self.calls.lock().unwrap().push(turns);
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn calls(&self) -> Vec<Vec<Turn>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamProvider for Scripted {
    async fn complete(&self, turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<String> {
        self.record(turns)?;
        Ok(self.fragments.concat())
    }

    async fn stream(&self, turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<FragmentStream> {
        self.record(turns)?;
        let mut events: Vec<StreamEvent> = self
            .fragments
            .iter()
            .cloned()
            .map(StreamEvent::Fragment)
            .collect();
        events.push(self.tail.clone());
        Ok(Box::pin(stream::iter(events)))
    }

    fn default_model(&self) -> String {
        "stub-model".to_string()
    }
}

fn normalizer() -> Normalizer {
    Normalizer::new("stub-model", 0.7, 256)
}

fn controller(store: Arc<dyn SessionStore>, provider: Arc<dyn UpstreamProvider>) -> ExchangeController {
    ExchangeController::new(store, provider, normalizer())
}

fn contents(turns: &[Turn]) -> Vec<(Role, String)> {
    turns.iter().map(|t| (t.role, t.content.clone())).collect()
}

#[tokio::test]
async fn test_first_exchange_stores_user_and_reply() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::new(&["Hi! ", "How can I help?"]);
    let controller = controller(store.clone(), provider.clone());

    let reply = controller
        .exchange(ChatRequest::user("Hello Kai").with_session("s1"))
        .await
        .unwrap();

    assert_eq!(reply.reply, "Hi! How can I help?");
    assert_eq!(reply.session_id, "s1");
    assert_eq!(reply.model, "stub-model");
    assert_eq!(
        contents(&store.get("s1").unwrap()),
        vec![
            (Role::User, "Hello Kai".to_string()),
            (Role::Assistant, "Hi! How can I help?".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_second_exchange_sends_prior_turns_in_order() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::new(&["ok"]);
    let controller = controller(store.clone(), provider.clone());

    controller
        .exchange(ChatRequest::user("first").with_session("s1"))
        .await
        .unwrap();
    controller
        .exchange(ChatRequest::user("second").with_session("s1"))
        .await
        .unwrap();

    let calls = provider.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        contents(&calls[1]),
        vec![
            (Role::User, "first".to_string()),
            (Role::Assistant, "ok".to_string()),
            (Role::User, "second".to_string()),
        ]
    );
    assert_eq!(store.get("s1").unwrap().len(), 4);
}

#[tokio::test]
async fn test_rejected_upstream_leaves_only_user_turn() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::failing(UpstreamError::Rejected {
        status: 404,
        detail: "model not found".to_string(),
    });
    let controller = controller(store.clone(), provider.clone());

    let err = controller
        .exchange(ChatRequest::user("hello").with_session("s1"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::UpstreamRejected);
    assert!(!err.is_retryable());
    assert_eq!(provider.calls().len(), 1);
    assert_eq!(
        contents(&store.get("s1").unwrap()),
        vec![(Role::User, "hello".to_string())]
    );
}

#[tokio::test]
async fn test_stream_fault_after_fragments_stores_no_reply() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::faulting(&["Hel", "lo!"], "connection reset");
    let controller = controller(store.clone(), provider);

    let events: Vec<ExchangeEvent> = controller
        .exchange_stream(ChatRequest::user("hi").with_session("s1").streaming())
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0], ExchangeEvent::Fragment("Hel".to_string()));
    assert_eq!(events[1], ExchangeEvent::Fragment("lo!".to_string()));
    match &events[2] {
        ExchangeEvent::Error(err) => {
            assert_eq!(err.kind(), ErrorKind::StreamInterrupted);
            assert!(err.is_retryable());
        }
        other => panic!("expected error event, got {:?}", other),
    }
    assert_eq!(
        contents(&store.get("s1").unwrap()),
        vec![(Role::User, "hi".to_string())]
    );
}

#[tokio::test]
async fn test_streamed_fragments_concatenate_to_buffered_reply() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::new(&["The ", "quick ", "brown ", "fox"]);
    let controller = controller(store.clone(), provider);

    let buffered = controller
        .exchange(ChatRequest::user("tell me").with_session("buffered"))
        .await
        .unwrap();

    let events: Vec<ExchangeEvent> = controller
        .exchange_stream(ChatRequest::user("tell me").with_session("streamed").streaming())
        .await
        .unwrap()
        .collect()
        .await;

    let mut streamed = String::new();
    let mut done = None;
    for event in events {
        match event {
            ExchangeEvent::Fragment(text) => streamed.push_str(&text),
            ExchangeEvent::Done { reply } => done = Some(reply),
            ExchangeEvent::Error(err) => panic!("unexpected error: {}", err),
        }
    }

    assert_eq!(streamed, buffered.reply);
    assert_eq!(done.as_deref(), Some(buffered.reply.as_str()));
    assert_eq!(
        store.get("streamed").unwrap().last().map(|t| t.content.clone()),
        Some(buffered.reply)
    );
}

#[tokio::test]
async fn test_validation_failures_leave_store_untouched() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::new(&["never"]);
    let controller = controller(store.clone(), provider.clone());

    let err = controller
        .exchange(ChatRequest::user("   ").with_session("s1"))
        .await
        .unwrap_err();
    assert!(err.is_client_fault());

    let unknown_role = ChatRequest {
        messages: vec![RawMessage::new("wizard", "abracadabra")],
        session_id: Some("s1".to_string()),
        ..ChatRequest::default()
    };
    let err = controller.exchange(unknown_role.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = controller
        .exchange_stream(ChatRequest {
            stream: true,
            ..unknown_role
        })
        .await
        .err()
        .unwrap();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(store.session_keys().is_empty());
    assert!(provider.calls().is_empty());
}

#[tokio::test]
async fn test_system_turns_sent_but_not_stored() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::new(&["sure"]);
    let controller = controller(store.clone(), provider.clone());

    let request = ChatRequest {
        messages: vec![
            RawMessage::new("system", "answer in one word"),
            RawMessage::new("user", "ready?"),
        ],
        session_id: Some("s1".to_string()),
        ..ChatRequest::default()
    };
    controller.exchange(request).await.unwrap();

    let sent = provider.calls().remove(0);
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[0].content, "answer in one word");
    assert!(store
        .get("s1")
        .unwrap()
        .iter()
        .all(|turn| turn.role != Role::System));
}

#[tokio::test]
async fn test_missing_session_id_uses_default_session() {
    let store = Arc::new(InMemorySessionStore::new());
    let controller = controller(store.clone(), Scripted::new(&["ok"]));

    let reply = controller.exchange(ChatRequest::user("hi")).await.unwrap();
    assert_eq!(reply.session_id, "default");

    let reply = controller
        .exchange(ChatRequest::user("again").with_session("  "))
        .await
        .unwrap();
    assert_eq!(reply.session_id, "default");
    assert_eq!(store.get("default").unwrap().len(), 4);
}

#[tokio::test]
async fn test_stream_open_failure_is_returned_directly() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Scripted::failing(UpstreamError::Timeout("no response in 60s".to_string()));
    let controller = controller(store.clone(), provider);

    let err = controller
        .exchange_stream(ChatRequest::user("hi").with_session("s1").streaming())
        .await
        .err()
        .unwrap();

    assert_eq!(err.kind(), ErrorKind::UpstreamTimeout);
    assert_eq!(store.get("s1").unwrap().len(), 1);
}

/// Upstream whose stream is fed by the test
struct Channelled {
    rx: Mutex<Option<mpsc::Receiver<StreamEvent>>>,
}

#[async_trait]
impl UpstreamProvider for Channelled {
    async fn complete(&self, _turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<String> {
        Err(UpstreamError::InvalidResponse("buffered replies not scripted".to_string()))
    }

    async fn stream(&self, _turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<FragmentStream> {
        let rx = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| UpstreamError::Unavailable("stream already taken".to_string()))?;
        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    fn default_model(&self) -> String {
        "stub-model".to_string()
    }
}

#[tokio::test]
async fn test_client_disconnect_stores_no_partial_reply() {
    let store = Arc::new(InMemorySessionStore::new());
    let (upstream_tx, upstream_rx) = mpsc::channel(8);
    let provider = Arc::new(Channelled {
        rx: Mutex::new(Some(upstream_rx)),
    });
    let controller = controller(store.clone(), provider);

    let mut events = controller
        .exchange_stream(ChatRequest::user("hi").with_session("s1").streaming())
        .await
        .unwrap();

    upstream_tx
        .send(StreamEvent::Fragment("Hel".to_string()))
        .await
        .unwrap();
    assert_eq!(
        events.next().await,
        Some(ExchangeEvent::Fragment("Hel".to_string()))
    );

    drop(events);
    let _ = upstream_tx.send(StreamEvent::Completed).await;

    // The relay drops the upstream stream once it notices the disconnect.
    tokio::time::timeout(Duration::from_secs(2), upstream_tx.closed())
        .await
        .unwrap();

    assert_eq!(
        contents(&store.get("s1").unwrap()),
        vec![(Role::User, "hi".to_string())]
    );
}

/// Upstream that blocks each call until the test releases it
struct Gated {
    gate: Semaphore,
    entered: Notify,
    calls: Mutex<Vec<Vec<Turn>>>,
}

#[async_trait]
impl UpstreamProvider for Gated {
    async fn complete(&self, turns: Vec<Turn>, _params: &GenerationParams) -> ProviderResult<String> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(turns);
            calls.len()
        };
        self.entered.notify_one();
        self.gate
            .acquire()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?
            .forget();
        Ok(format!("reply {}", n))
    }

    fn default_model(&self) -> String {
        "stub-model".to_string()
    }
}

#[tokio::test]
async fn test_same_session_exchanges_are_serialized() {
    let store = Arc::new(InMemorySessionStore::new());
    let provider = Arc::new(Gated {
        gate: Semaphore::new(0),
        entered: Notify::new(),
        calls: Mutex::new(Vec::new()),
    });
    let controller = Arc::new(controller(store.clone(), provider.clone()));

    let first = tokio::spawn({
        let controller = controller.clone();
        async move { controller.exchange(ChatRequest::user("one").with_session("s1")).await }
    });
    provider.entered.notified().await;

    let second = tokio::spawn({
        let controller = controller.clone();
        async move { controller.exchange(ChatRequest::user("two").with_session("s1")).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(provider.calls.lock().unwrap().len(), 1);
    assert_eq!(store.get("s1").unwrap().len(), 1);

    provider.gate.add_permits(2);
    assert_eq!(first.await.unwrap().unwrap().reply, "reply 1");
    assert_eq!(second.await.unwrap().unwrap().reply, "reply 2");

    let calls = provider.calls.lock().unwrap().clone();
    assert_eq!(
        contents(&calls[1]),
        vec![
            (Role::User, "one".to_string()),
            (Role::Assistant, "reply 1".to_string()),
            (Role::User, "two".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_file_backed_history_survives_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();

    {
        let store = Arc::new(FileSessionStore::new(temp_dir.path(), 0));
        let controller = controller(store, Scripted::new(&["persisted"]));
        controller
            .exchange(ChatRequest::user("remember me").with_session("user:42"))
            .await
            .unwrap();
    }

    let reopened = FileSessionStore::new(temp_dir.path(), 0);
    assert_eq!(
        contents(&reopened.get("user:42").unwrap()),
        vec![
            (Role::User, "remember me".to_string()),
            (Role::Assistant, "persisted".to_string()),
        ]
    );
}
