use std::{
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use rstest::rstest;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use super::{CreateRequest, FactoryMessage, ProxyingFactory};
use crate::{
    background_tasks::{BackgroundTasks, TaskSender},
    error::NetError,
    events::EventKind,
    invocation::ListenerHandle,
    registry::ListenerRegistry,
    request::{ClientEvent, ProxiedRequest, RequestId},
    transport::{
        ConnectRequest, HeaderClientEvent, HeaderClientVerdict, RequestPriority, Transport,
        TransportConnection, TransportError, TransportEvent, TransportHandle, TransportId,
    },
    MatchPatternSet, ProxyConfig,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum HandleAction {
    FollowRedirect {
        removed_headers: Vec<HeaderName>,
        modified_headers: HeaderMap,
        new_url: Option<Uri>,
    },
    SetPriority(RequestPriority),
    Abort,
}

struct FakeHandle {
    actions: Arc<Mutex<Vec<HandleAction>>>,
}

impl TransportHandle for FakeHandle {
    fn follow_redirect(
        &self,
        removed_headers: Vec<HeaderName>,
        modified_headers: HeaderMap,
        new_url: Option<Uri>,
    ) {
        self.actions.lock().unwrap().push(HandleAction::FollowRedirect {
            removed_headers,
            modified_headers,
            new_url,
        });
    }

    fn set_priority(&self, priority: RequestPriority) {
        self.actions.lock().unwrap().push(HandleAction::SetPriority(priority));
    }

    fn abort(&self) {
        self.actions.lock().unwrap().push(HandleAction::Abort);
    }
}

/// One scripted exchange: the test plays the transport's side through
/// `events` and observes control calls through `actions`.
struct FakeConnection {
    request: ConnectRequest,
    transport_id: TransportId,
    events: mpsc::Sender<TransportEvent>,
    actions: Arc<Mutex<Vec<HandleAction>>>,
}

impl FakeConnection {
    async fn send(&self, event: TransportEvent) {
        self.events
            .send(event)
            .await
            .expect("request task dropped the transport stream");
    }

    fn actions(&self) -> Vec<HandleAction> {
        self.actions.lock().unwrap().clone()
    }
}

#[derive(Clone)]
struct FakeTransport {
    next_id: Arc<AtomicU64>,
    refuse_connects: Arc<AtomicBool>,
    connects: mpsc::UnboundedSender<FakeConnection>,
}

fn fake_transport() -> (FakeTransport, mpsc::UnboundedReceiver<FakeConnection>) {
    let (connects, connects_rx) = mpsc::unbounded_channel();
    let transport = FakeTransport {
        next_id: Arc::new(AtomicU64::new(0)),
        refuse_connects: Arc::new(AtomicBool::new(false)),
        connects,
    };
    (transport, connects_rx)
}

impl Transport for FakeTransport {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportConnection, TransportError> {
        if self.refuse_connects.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectFailed("refused by test".into()));
        }

        let transport_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events_tx, events_rx) = mpsc::channel(16);
        let actions = Arc::new(Mutex::new(Vec::new()));

        let _ = self.connects.send(FakeConnection {
            request,
            transport_id,
            events: events_tx,
            actions: actions.clone(),
        });

        Ok(TransportConnection {
            transport_id,
            events: events_rx,
            handle: Box::new(FakeHandle { actions }),
        })
    }
}

struct TestProxy {
    registry: ListenerRegistry,
    factory: TaskSender<ProxyingFactory<FakeTransport>>,
    connects: mpsc::UnboundedReceiver<FakeConnection>,
    refuse_connects: Arc<AtomicBool>,
    // Keeps the factory's message bus open for the duration of the test.
    _background_tasks: BackgroundTasks<(), Infallible, Infallible>,
}

fn spawn_proxy(config: ProxyConfig) -> TestProxy {
    let registry = ListenerRegistry::new();
    let (transport, connects) = fake_transport();
    let refuse_connects = transport.refuse_connects.clone();

    let mut background_tasks: BackgroundTasks<(), Infallible, Infallible> = Default::default();
    let factory = background_tasks.register(
        ProxyingFactory::new(transport, registry.clone(), config),
        (),
        16,
    );

    TestProxy {
        registry,
        factory,
        connects,
        refuse_connects,
        _background_tasks: background_tasks,
    }
}

impl TestProxy {
    async fn create_request(
        &self,
        request: ProxiedRequest,
    ) -> (RequestId, mpsc::Receiver<ClientEvent>) {
        let (client_tx, client_rx) = mpsc::channel(16);
        let (id_tx, id_rx) = oneshot::channel();

        self.factory
            .send(FactoryMessage::CreateRequest(CreateRequest {
                request,
                client: client_tx,
                id_reply: id_tx,
            }))
            .await;

        let request_id = tokio::time::timeout(TIMEOUT, id_rx)
            .await
            .expect("timed out waiting for the request id")
            .expect("factory dropped the id reply");
        (request_id, client_rx)
    }

    async fn next_connect(&mut self) -> FakeConnection {
        tokio::time::timeout(TIMEOUT, self.connects.recv())
            .await
            .expect("timed out waiting for a transport connect")
            .expect("transport gone")
    }
}

fn get_request(url: &str) -> ProxiedRequest {
    ProxiedRequest::new(url.parse().unwrap(), Method::GET)
}

fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
    pairs
        .iter()
        .map(|(name, value)| {
            (
                name.parse::<HeaderName>().unwrap(),
                value.parse::<HeaderValue>().unwrap(),
            )
        })
        .collect()
}

/// A listener that records every details record it receives and always
/// replies with the same response.
fn recording_listener(response: Value) -> (ListenerHandle, Arc<Mutex<Vec<Value>>>) {
    let record = Arc::new(Mutex::new(Vec::new()));
    let invocations = record.clone();
    let handle = ListenerHandle::spawn(move |details| {
        invocations.lock().unwrap().push(details);
        let response = response.clone();
        async move { response }
    });
    (handle, record)
}

async fn wait_for<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn recv_client(client: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(TIMEOUT, client.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("client channel closed")
}

async fn expect_response_started(
    client: &mut mpsc::Receiver<ClientEvent>,
) -> (StatusCode, Option<String>, HeaderMap) {
    match recv_client(client).await {
        ClientEvent::ResponseStarted {
            status,
            status_line,
            headers,
        } => (status, status_line, headers),
        other => panic!("expected a response start, got {other:?}"),
    }
}

async fn expect_body(client: &mut mpsc::Receiver<ClientEvent>) -> bytes::Bytes {
    match recv_client(client).await {
        ClientEvent::BodyData(bytes) => bytes,
        other => panic!("expected body data, got {other:?}"),
    }
}

async fn expect_completed(client: &mut mpsc::Receiver<ClientEvent>) {
    match recv_client(client).await {
        ClientEvent::Completed => {}
        other => panic!("expected completion, got {other:?}"),
    }
}

async fn expect_failed(client: &mut mpsc::Receiver<ClientEvent>) -> NetError {
    match recv_client(client).await {
        ClientEvent::Failed(error) => error,
        other => panic!("expected a failure, got {other:?}"),
    }
}

/// Delivers a header interception event through the factory, retrying until
/// the transport id mapping is in place.
async fn route_header_client<F>(
    factory: &TaskSender<ProxyingFactory<FakeTransport>>,
    transport_id: TransportId,
    mut event: F,
) -> HeaderClientVerdict
where
    F: FnMut(oneshot::Sender<HeaderClientVerdict>) -> HeaderClientEvent,
{
    let started = tokio::time::Instant::now();
    loop {
        let (reply_tx, reply_rx) = oneshot::channel();
        factory
            .send(FactoryMessage::HeaderClient(transport_id, event(reply_tx)))
            .await;

        match reply_rx.await {
            Ok(verdict) => return verdict,
            Err(..) => {
                assert!(
                    started.elapsed() < TIMEOUT,
                    "header interception event was never answered",
                );
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

#[tokio::test]
async fn passthrough_without_listeners() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;

    let conn = proxy.next_connect().await;
    assert_eq!(conn.request.url, Uri::from_static("https://x/y"));
    assert_eq!(conn.request.method, Method::GET);
    assert!(!conn.request.expose_header_client);

    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: header_map(&[("content-type", "text/html")]),
    })
    .await;
    conn.send(TransportEvent::BodyData("hello".into())).await;
    conn.send(TransportEvent::Completed(Ok(()))).await;

    let (status, status_line, headers) = expect_response_started(&mut client).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(status_line, None);
    assert_eq!(headers["content-type"], "text/html");
    assert_eq!(expect_body(&mut client).await, "hello");
    expect_completed(&mut client).await;
}

#[tokio::test]
async fn url_rewrite_happens_before_any_connect() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (listener, record) = recording_listener(json!({"redirectURL": "https://x/z"}));
    proxy.registry.on_before_request(None, Some(listener));

    let (_, _client) = proxy.create_request(get_request("https://x/y")).await;

    let conn = proxy.next_connect().await;
    assert_eq!(conn.request.url, Uri::from_static("https://x/z"));
    assert_eq!(record.lock().unwrap().len(), 1, "the stage is not re-entered");
    assert!(proxy.connects.try_recv().is_err(), "exactly one connect");
}

#[rstest]
#[case::before_request(EventKind::BeforeRequest)]
#[case::before_send_headers(EventKind::BeforeSendHeaders)]
#[tokio::test]
async fn blocking_listener_cancels_request(#[case] stage: EventKind) {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let listener = ListenerHandle::spawn(|_| async { json!({"cancel": true}) });
    proxy.registry.set_listener(stage, Default::default(), Some(listener));
    let (errors, error_record) = recording_listener(json!({}));
    proxy.registry.on_error_occurred(None, Some(errors));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;

    assert_eq!(expect_failed(&mut client).await, NetError::BlockedByClient);
    assert!(
        proxy.connects.try_recv().is_err(),
        "no transport connection may be opened for a cancelled request",
    );

    wait_for(|| !error_record.lock().unwrap().is_empty()).await;
    let details = error_record.lock().unwrap()[0].clone();
    assert_eq!(details["event"], "errorOccurred");
    assert_eq!(details["error"], "request blocked by a listener");
}

#[tokio::test]
async fn response_header_override_reaches_caller() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (listener, _) =
        recording_listener(json!({"responseHeaders": {"content-type": ["text/plain"]}}));
    proxy.registry.on_headers_received(None, Some(listener));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;

    let conn = proxy.next_connect().await;
    assert!(conn.request.expose_header_client);
    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: header_map(&[("content-type", "text/html"), ("x-upstream", "1")]),
    })
    .await;

    let (status, status_line, headers) = expect_response_started(&mut client).await;
    assert_eq!(status, StatusCode::OK, "status survives a header override");
    assert_eq!(status_line, None, "status line untouched unless overridden");
    assert_eq!(headers.len(), 1, "only the override set is visible");
    assert_eq!(headers["content-type"], "text/plain");
}

#[tokio::test]
async fn pattern_filter_scopes_listener() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (listener, record) = recording_listener(json!({}));
    proxy.registry.on_before_request(
        Some(MatchPatternSet::parse(["https://example.com/*"]).unwrap()),
        Some(listener),
    );

    let (_, _other_client) = proxy.create_request(get_request("https://other.com/a")).await;
    proxy.next_connect().await;
    assert!(record.lock().unwrap().is_empty(), "filtered-out URL must not fire");

    let (_, _client) = proxy.create_request(get_request("https://example.com/a")).await;
    proxy.next_connect().await;
    assert_eq!(record.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn only_latest_registration_fires() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (first, first_record) = recording_listener(json!({}));
    let (second, second_record) = recording_listener(json!({}));
    proxy.registry.on_before_request(None, Some(first));
    proxy.registry.on_before_request(None, Some(second));

    let (_, _client) = proxy.create_request(get_request("https://x/y")).await;
    proxy.next_connect().await;

    assert!(first_record.lock().unwrap().is_empty());
    assert_eq!(second_record.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn gone_listener_fails_open_end_to_end() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (listener, inbox) = ListenerHandle::channel(4);
    drop(inbox);
    proxy.registry.on_before_request(None, Some(listener));

    let (_, _client) = proxy.create_request(get_request("https://x/y")).await;

    // The request proceeds instead of hanging on the dead listener.
    proxy.next_connect().await;
}

#[tokio::test]
async fn slow_listener_defers_the_next_stage() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (before_request, mut before_request_rx) = ListenerHandle::channel(4);
    proxy.registry.on_before_request(None, Some(before_request));
    let (before_send_headers, headers_record) = recording_listener(json!({}));
    proxy
        .registry
        .on_before_send_headers(None, Some(before_send_headers));

    let (_, _client) = proxy.create_request(get_request("https://x/y")).await;

    let invocation = tokio::time::timeout(TIMEOUT, before_request_rx.recv())
        .await
        .expect("timed out waiting for the listener invocation")
        .expect("listener inbox closed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        headers_record.lock().unwrap().is_empty(),
        "second blocking stage dispatched before the first one resolved",
    );

    invocation.reply.unwrap().send(json!({})).unwrap();
    proxy.next_connect().await;
    assert_eq!(headers_record.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transport_redirect_restarts_the_pipeline() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (before_request, request_record) = recording_listener(json!({}));
    proxy.registry.on_before_request(None, Some(before_request));
    let (before_redirect, redirect_record) = recording_listener(json!({}));
    proxy.registry.on_before_redirect(None, Some(before_redirect));
    let (send_headers, send_headers_record) = recording_listener(json!({}));
    proxy.registry.on_send_headers(None, Some(send_headers));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;

    conn.send(TransportEvent::Redirect {
        target: Uri::from_static("https://x/z"),
        status: StatusCode::MOVED_PERMANENTLY,
        headers: header_map(&[("location", "https://x/z")]),
    })
    .await;

    wait_for(|| request_record.lock().unwrap().len() == 2).await;
    wait_for(|| redirect_record.lock().unwrap().len() == 1).await;
    assert_eq!(
        redirect_record.lock().unwrap()[0]["redirectURL"],
        "https://x/z",
    );
    assert_eq!(
        request_record.lock().unwrap()[1]["url"],
        "https://x/z",
        "pipeline restarted with the redirect target",
    );

    wait_for(|| {
        conn.actions()
            .iter()
            .any(|action| matches!(action, HandleAction::FollowRedirect { new_url: None, .. }))
    })
    .await;
    assert!(proxy.connects.try_recv().is_err(), "the exchange is resumed, not reopened");

    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
    })
    .await;
    conn.send(TransportEvent::Completed(Ok(()))).await;
    expect_response_started(&mut client).await;
    expect_completed(&mut client).await;

    wait_for(|| send_headers_record.lock().unwrap().len() == 2).await;
}

#[tokio::test]
async fn caller_requested_redirects_skip_the_restart() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (before_request, request_record) = recording_listener(json!({}));
    proxy.registry.on_before_request(None, Some(before_request));
    let (before_redirect, redirect_record) = recording_listener(json!({}));
    proxy.registry.on_before_redirect(None, Some(before_redirect));

    let mut request = get_request("https://x/y");
    request.follow_redirects = true;
    let (_, mut client) = proxy.create_request(request).await;
    let conn = proxy.next_connect().await;

    conn.send(TransportEvent::Redirect {
        target: Uri::from_static("https://x/z"),
        status: StatusCode::FOUND,
        headers: HeaderMap::new(),
    })
    .await;

    wait_for(|| {
        conn.actions().iter().any(|action| {
            matches!(
                action,
                HandleAction::FollowRedirect {
                    new_url: None,
                    removed_headers,
                    modified_headers,
                } if removed_headers.is_empty() && modified_headers.is_empty()
            )
        })
    })
    .await;
    wait_for(|| redirect_record.lock().unwrap().len() == 1).await;
    assert_eq!(
        request_record.lock().unwrap().len(),
        1,
        "listener pipeline is not restarted",
    );

    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: HeaderMap::new(),
    })
    .await;
    conn.send(TransportEvent::Completed(Ok(()))).await;
    expect_response_started(&mut client).await;
    expect_completed(&mut client).await;
}

#[tokio::test]
async fn listener_authored_redirect_is_honored() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let calls = Arc::new(AtomicU64::new(0));
    let call_counter = calls.clone();
    let listener = ListenerHandle::spawn(move |_| {
        let call = call_counter.fetch_add(1, Ordering::Relaxed);
        async move {
            if call == 0 {
                json!({"redirectURL": "https://x/z"})
            } else {
                json!({})
            }
        }
    });
    proxy.registry.on_headers_received(None, Some(listener));
    let (before_redirect, redirect_record) = recording_listener(json!({}));
    proxy.registry.on_before_redirect(None, Some(before_redirect));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;

    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: header_map(&[("content-type", "text/html")]),
    })
    .await;

    wait_for(|| {
        conn.actions().iter().any(|action| {
            matches!(
                action,
                HandleAction::FollowRedirect { new_url: Some(url), .. }
                    if *url == Uri::from_static("https://x/z")
            )
        })
    })
    .await;
    wait_for(|| redirect_record.lock().unwrap().len() == 1).await;

    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: header_map(&[("content-type", "text/html")]),
    })
    .await;
    conn.send(TransportEvent::Completed(Ok(()))).await;
    expect_response_started(&mut client).await;
    expect_completed(&mut client).await;
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn transport_error_reaches_caller_and_listeners() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (errors, error_record) = recording_listener(json!({}));
    proxy.registry.on_error_occurred(None, Some(errors));
    let (completed, completed_record) = recording_listener(json!({}));
    proxy.registry.on_completed(None, Some(completed));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;
    conn.send(TransportEvent::Completed(Err(TransportError::Network(
        "connection reset".into(),
    ))))
    .await;

    assert_eq!(
        expect_failed(&mut client).await,
        NetError::Transport(TransportError::Network("connection reset".into())),
    );
    wait_for(|| !error_record.lock().unwrap().is_empty()).await;
    assert!(
        error_record.lock().unwrap()[0]["error"]
            .as_str()
            .unwrap()
            .contains("connection reset"),
    );
    assert!(completed_record.lock().unwrap().is_empty());
}

#[tokio::test]
async fn connect_failure_reaches_caller() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    proxy.refuse_connects.store(true, Ordering::Relaxed);

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;

    match expect_failed(&mut client).await {
        NetError::Transport(TransportError::ConnectFailed(..)) => {}
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[tokio::test]
async fn caller_disconnect_aborts_without_events() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (errors, error_record) = recording_listener(json!({}));
    proxy.registry.on_error_occurred(None, Some(errors));

    let (_, client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;
    drop(client);

    wait_for(|| {
        conn.actions()
            .iter()
            .any(|action| matches!(action, HandleAction::Abort))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        error_record.lock().unwrap().is_empty(),
        "no events fire after the caller disconnects",
    );

    // The factory keeps serving other requests.
    let (_, _client) = proxy.create_request(get_request("https://x/other")).await;
    proxy.next_connect().await;
}

#[tokio::test]
async fn late_header_interception_event_is_dropped() {
    let mut proxy = spawn_proxy(ProxyConfig::default());

    let (reply_tx, reply_rx) = oneshot::channel();
    proxy
        .factory
        .send(FactoryMessage::HeaderClient(
            4096,
            HeaderClientEvent::BeforeSendHeaders {
                headers: HeaderMap::new(),
                reply: reply_tx,
            },
        ))
        .await;
    assert!(reply_rx.await.is_err(), "unknown transport id must be dropped");

    // Never fatal: the factory still accepts new requests.
    let (_, _client) = proxy.create_request(get_request("https://x/y")).await;
    proxy.next_connect().await;
}

#[tokio::test]
async fn header_interception_negotiates_both_directions() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (before_send_headers, _) =
        recording_listener(json!({"requestHeaders": {"x-injected": ["1"]}}));
    proxy
        .registry
        .on_before_send_headers(None, Some(before_send_headers));
    let (headers_received, received_record) =
        recording_listener(json!({"responseHeaders": {"content-type": ["text/plain"]}}));
    proxy
        .registry
        .on_headers_received(None, Some(headers_received));

    let (_, mut client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;
    assert!(conn.request.expose_header_client);
    assert_eq!(
        conn.request.headers["x-injected"], "1",
        "request header mutation negotiated before the exchange opened",
    );

    let verdict = route_header_client(&proxy.factory, conn.transport_id, |reply| {
        HeaderClientEvent::BeforeSendHeaders {
            headers: conn.request.headers.clone(),
            reply,
        }
    })
    .await;
    match verdict {
        HeaderClientVerdict::Proceed(overrides) => {
            assert_eq!(overrides.headers.unwrap()["x-injected"], "1");
        }
        HeaderClientVerdict::Cancel => panic!("unexpected cancel"),
    }

    let verdict = route_header_client(&proxy.factory, conn.transport_id, |reply| {
        HeaderClientEvent::HeadersReceived {
            status: StatusCode::OK,
            status_line: Some("HTTP/1.1 200 OK".into()),
            headers: header_map(&[("content-type", "text/html")]),
            reply,
        }
    })
    .await;
    match verdict {
        HeaderClientVerdict::Proceed(overrides) => {
            assert_eq!(overrides.headers.unwrap()["content-type"], "text/plain");
            assert_eq!(overrides.status_line.as_deref(), Some("HTTP/1.1 200 OK"));
        }
        HeaderClientVerdict::Cancel => panic!("unexpected cancel"),
    }

    // The transport echoes the final headers it applied.
    conn.send(TransportEvent::Headers {
        status: StatusCode::OK,
        headers: header_map(&[("content-type", "text/plain")]),
    })
    .await;
    conn.send(TransportEvent::Completed(Ok(()))).await;

    let (_, status_line, headers) = expect_response_started(&mut client).await;
    assert_eq!(status_line.as_deref(), Some("HTTP/1.1 200 OK"));
    assert_eq!(headers["content-type"], "text/plain");
    expect_completed(&mut client).await;

    assert_eq!(
        received_record.lock().unwrap().len(),
        1,
        "the stage ran through header interception exactly once",
    );
}

#[tokio::test]
async fn priority_changes_reach_the_transport() {
    let mut proxy = spawn_proxy(ProxyConfig::default());
    let (request_id, _client) = proxy.create_request(get_request("https://x/y")).await;
    let conn = proxy.next_connect().await;

    proxy
        .factory
        .send(FactoryMessage::SetPriority(request_id, RequestPriority::High))
        .await;

    wait_for(|| {
        conn.actions()
            .iter()
            .any(|action| matches!(action, HandleAction::SetPriority(RequestPriority::High)))
    })
    .await;
}
