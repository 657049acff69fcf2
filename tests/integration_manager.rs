use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, COOKIE};
use reqflow::{
    ApiRequest, Attachment, DownloadDestination, DownloadObserver, DownloadResponse, Endpoint,
    EndpointDescriptor, Environment, ErrorCode, FormEncoding, ProgressEvent, RequestManager,
    RequestOutcome, RetryScope, Transport, TransportError, TransportErrorKind, TransportRequest,
    TransportResponse, UploadObserver,
};
use serde::Deserialize;

type Scripted = Result<TransportResponse, TransportError>;

#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<VecDeque<Scripted>>,
    progress: Vec<f64>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
}

impl ScriptedTransport {
    fn new(responses: impl IntoIterator<Item = Scripted>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Self::default()
        }
    }

    fn with_progress(mut self, progress: &[f64]) -> Self {
        self.progress = progress.to_vec();
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> TransportRequest {
        self.requests
            .lock()
            .expect("requests lock")
            .last()
            .cloned()
            .expect("at least one request")
    }

    async fn next(&self, request: TransportRequest) -> Scripted {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().expect("requests lock").push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .expect("scripted response available")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.next(request).await
    }

    async fn upload(
        &self,
        request: TransportRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<TransportResponse, TransportError> {
        let response = self.next(request).await?;
        for fraction in &self.progress {
            progress(*fraction);
        }
        Ok(response)
    }

    async fn download(
        &self,
        request: TransportRequest,
        destination: &DownloadDestination,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<DownloadResponse, TransportError> {
        let response = self.next(request).await?;
        if !response.status.is_success() {
            return Ok(DownloadResponse::rejected(response.status, response.body));
        }
        destination.prepare().await?;
        tokio::fs::write(destination.path(), &response.body).await?;
        for fraction in &self.progress {
            progress(*fraction);
        }
        Ok(DownloadResponse::saved(response.status, destination.path()))
    }
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<ProgressEvent>>,
    failures: Mutex<Vec<(String, String)>>,
}

impl RecordingObserver {
    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn failures(&self) -> Vec<(String, String)> {
        self.failures.lock().expect("failures lock").clone()
    }
}

impl UploadObserver for RecordingObserver {
    fn on_upload_progress(&self, event: &ProgressEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }

    fn on_upload_failed(&self, identifier: &str, message: &str) {
        self.failures
            .lock()
            .expect("failures lock")
            .push((identifier.to_owned(), message.to_owned()));
    }
}

impl DownloadObserver for RecordingObserver {
    fn on_download_progress(&self, event: &ProgressEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }

    fn on_download_failed(&self, file_name: &str, message: &str) {
        self.failures
            .lock()
            .expect("failures lock")
            .push((file_name.to_owned(), message.to_owned()));
    }
}

#[derive(Debug, Deserialize, PartialEq)]
struct Item {
    id: u64,
}

fn ok_json(body: &'static str) -> Scripted {
    Ok(TransportResponse::new(StatusCode::OK, Bytes::from_static(body.as_bytes())))
}

fn status(code: u16, body: &'static str) -> Scripted {
    let status = StatusCode::from_u16(code).expect("valid status code");
    Ok(TransportResponse::new(status, Bytes::from_static(body.as_bytes())))
}

fn aborted() -> Scripted {
    Err(TransportError::new(
        TransportErrorKind::ConnectionAborted,
        "Software caused connection abort",
    ))
}

fn items_endpoint() -> EndpointDescriptor {
    EndpointDescriptor::get("https://api.example.com/v1").path_suffix("/items")
}

fn manager_with(transport: &Arc<ScriptedTransport>) -> RequestManager {
    RequestManager::builder(transport.clone()).build()
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_retried_until_success() {
    let transport = Arc::new(ScriptedTransport::new([
        status(503, ""),
        status(503, ""),
        status(503, ""),
        ok_json(r#"{"id":7}"#),
    ]));
    let manager = RequestManager::builder(transport.clone())
        .retry_scope(RetryScope::Shared)
        .build();

    let started = tokio::time::Instant::now();
    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    assert_eq!(outcome.value(), Some(&Item { id: 7 }));
    assert_eq!(transport.calls(), 4);
    assert_eq!(manager.consecutive_retries(), 0);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn server_errors_stop_after_three_retries() {
    let transport = Arc::new(ScriptedTransport::new([
        status(500, ""),
        status(500, ""),
        status(500, ""),
        status(500, r#"{"message":"still down"}"#),
    ]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    let error = outcome.error().expect("call should fail");
    assert_eq!(error.message, "still down");
    assert_eq!(error.code(), Some(ErrorCode::HttpStatus));
    assert_eq!(transport.calls(), 4);
    assert_eq!(
        outcome.response().map(|response| response.status()),
        Some(StatusCode::INTERNAL_SERVER_ERROR)
    );
}

#[tokio::test(start_paused = true)]
async fn client_errors_surface_server_message_without_retry() {
    let transport = Arc::new(ScriptedTransport::new([status(
        404,
        r#"{"message":"not found"}"#,
    )]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    match outcome {
        RequestOutcome::Failure { error, response } => {
            assert_eq!(error.title, "Error");
            assert_eq!(error.message, "not found");
            assert_eq!(
                response.map(|response| response.status()),
                Some(StatusCode::NOT_FOUND)
            );
        }
        RequestOutcome::Success { .. } => panic!("404 should fail"),
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_key_takes_precedence_over_message() {
    let transport = Arc::new(ScriptedTransport::new([status(
        401,
        r#"{"key":"session_expired","message":"Your session expired"}"#,
    )]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    assert_eq!(
        outcome.error().map(|error| error.message.as_str()),
        Some("session_expired")
    );
}

#[tokio::test(start_paused = true)]
async fn undecodable_success_body_uses_generic_message() {
    let transport = Arc::new(ScriptedTransport::new([ok_json("<html>")]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    let error = outcome.error().expect("decode should fail");
    assert_eq!(error.message, "Please try again later.");
    assert_eq!(error.code(), Some(ErrorCode::Deserialize));
}

#[tokio::test(start_paused = true)]
async fn connection_aborts_are_retried_past_the_server_error_cap() {
    let mut script: Vec<Scripted> = (0..5).map(|_| aborted()).collect();
    script.push(ok_json(r#"{"id":1}"#));
    let transport = Arc::new(ScriptedTransport::new(script));
    let manager = manager_with(&transport);

    let started = tokio::time::Instant::now();
    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 6);
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn other_transport_errors_fail_immediately() {
    let transport = Arc::new(ScriptedTransport::new([Err(TransportError::new(
        TransportErrorKind::Connect,
        "connection refused",
    ))]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    let error = outcome.error().expect("connect failure should surface");
    assert_eq!(error.message, "Please try again later.");
    assert_eq!(error.code(), Some(ErrorCode::Transport));
    assert!(outcome.response().is_none());
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_shared_count_disables_server_error_retry() {
    let transport = Arc::new(ScriptedTransport::new([status(503, "")]));
    let manager = RequestManager::builder(transport.clone())
        .retry_scope(RetryScope::Shared)
        .build();
    manager.set_number_of_retries(3);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    assert!(!outcome.is_success());
    assert_eq!(transport.calls(), 1);
    assert_eq!(manager.consecutive_retries(), 0);
}

#[tokio::test(start_paused = true)]
async fn per_call_scope_ignores_shared_count() {
    let transport = Arc::new(ScriptedTransport::new([
        status(503, ""),
        ok_json(r#"{"id":2}"#),
    ]));
    let manager = manager_with(&transport);
    manager.set_number_of_retries(3);

    let outcome = manager
        .call::<Item, _>(&items_endpoint(), ApiRequest::new())
        .await;

    assert!(outcome.is_success());
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_base_url_fails_before_sending() {
    let transport = Arc::new(ScriptedTransport::new([]));
    let manager = manager_with(&transport);

    let outcome = manager
        .call::<Item, _>(&EndpointDescriptor::get("not a url"), ApiRequest::new())
        .await;

    assert_eq!(
        outcome.error().and_then(|error| error.code()),
        Some(ErrorCode::InvalidUrl)
    );
    assert_eq!(transport.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_composes_url_headers_cookies_and_body() {
    let transport = Arc::new(ScriptedTransport::new([ok_json(r#"{"id":3}"#)]));
    let manager = RequestManager::builder(transport.clone())
        .default_header("x-client", "reqflow-tests")
        .build();
    let endpoint = EndpointDescriptor::post("https://api.example.com/v1")
        .path_suffix("/items")
        .header("x-endpoint", "items")
        .encoding(FormEncoding);
    let request = ApiRequest::new()
        .path("/42")
        .query_param("lang", "en")
        .param("name", "lamp")
        .param("count", 2)
        .header("x-request", "one")
        .cookie("session", "abc")
        .cookie("theme", "dark");

    let outcome = manager.call::<Item, _>(&endpoint, request).await;
    assert!(outcome.is_success());

    let sent = transport.last_request();
    assert_eq!(sent.method, http::Method::POST);
    assert_eq!(sent.url.as_str(), "https://api.example.com/v1/items/42?lang=en");
    assert_eq!(sent.headers["x-client"], "reqflow-tests");
    assert_eq!(sent.headers["x-endpoint"], "items");
    assert_eq!(sent.headers["x-request"], "one");
    assert_eq!(sent.headers[COOKIE], "session=abc; theme=dark");
    assert_eq!(
        sent.headers[CONTENT_TYPE],
        "application/x-www-form-urlencoded"
    );
    assert_eq!(sent.body, Bytes::from_static(b"name=lamp&count=2"));
}

enum Api {
    Profile,
}

impl Endpoint for Api {
    fn descriptor(&self, environment: Environment) -> EndpointDescriptor {
        let base = match environment {
            Environment::Development => "http://localhost:8080",
            Environment::Staging => "https://staging.example.com",
            Environment::Production => "https://api.example.com",
        };
        match self {
            Self::Profile => EndpointDescriptor::get(base).path_suffix("/profile"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn endpoints_resolve_against_manager_environment() {
    let transport = Arc::new(ScriptedTransport::new([ok_json(r#"{"id":4}"#)]));
    let manager = RequestManager::builder(transport.clone())
        .environment(Environment::Staging)
        .build();

    let outcome = manager.call::<Item, _>(&Api::Profile, ApiRequest::new()).await;

    assert!(outcome.is_success());
    assert_eq!(
        transport.last_request().url.as_str(),
        "https://staging.example.com/profile"
    );
    assert_eq!(manager.environment(), Environment::Staging);
}

#[tokio::test(start_paused = true)]
async fn upload_sends_one_part_per_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let files: Vec<Attachment> = ["a.png", "b.png", "c.png"]
        .iter()
        .map(|name| {
            let path = dir.path().join(name);
            std::fs::write(&path, name.as_bytes()).expect("write fixture");
            Attachment::File(path)
        })
        .collect();

    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(
        ScriptedTransport::new([ok_json(r#"{"id":5}"#)]).with_progress(&[0.25, 1.0]),
    );
    let manager = RequestManager::builder(transport.clone())
        .upload_observer(observer.clone())
        .build();
    let endpoint = EndpointDescriptor::post("https://api.example.com/v1").path_suffix("/photos");
    let request = ApiRequest::new()
        .param("album", "summer")
        .param("photos", files)
        .query_param("token", "secret");

    let outcome = manager.upload::<Item, _>(&endpoint, request).await;
    assert_eq!(outcome.value(), Some(&Item { id: 5 }));

    let sent = transport.last_request();
    let content_type = sent.headers[CONTENT_TYPE]
        .to_str()
        .expect("ascii content type");
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8(sent.body.to_vec()).expect("utf-8 body");
    assert_eq!(body.matches("name=\"photos\"; filename=").count(), 3);
    assert!(body.contains("name=\"album\"\r\n\r\nsummer\r\n"));
    assert!(body.contains("Content-Type: image/png"));

    let identifiers: Vec<_> = observer
        .events()
        .into_iter()
        .map(|event| (event.fraction, event.identifier))
        .collect();
    assert_eq!(
        identifiers,
        vec![
            (0.25, "https://api.example.com/v1/photos".to_owned()),
            (1.0, "https://api.example.com/v1/photos".to_owned()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn upload_with_unreadable_file_never_reaches_transport() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let readable = dir.path().join("a.txt");
    std::fs::write(&readable, b"a").expect("write fixture");
    let files = vec![
        Attachment::File(readable.clone()),
        Attachment::File(dir.path().join("missing.txt")),
        Attachment::File(readable),
    ];

    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(ScriptedTransport::new([]));
    let manager = RequestManager::builder(transport.clone())
        .upload_observer(observer.clone())
        .build();
    let endpoint = EndpointDescriptor::post("https://api.example.com/v1").path_suffix("/docs");

    let outcome = manager
        .upload::<Item, _>(&endpoint, ApiRequest::new().param("docs", files))
        .await;

    let error = outcome.error().expect("upload should fail");
    assert_eq!(error.code(), Some(ErrorCode::ReadFile));
    assert!(error.message.starts_with("failed to read upload file"));
    assert_eq!(transport.calls(), 0);

    let failures = observer.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "https://api.example.com/v1/docs");
    assert_eq!(failures[0].1, error.message);
}

#[tokio::test(start_paused = true)]
async fn download_reports_progress_then_path() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let target = dir.path().join("nested").join("report.pdf");
    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(
        ScriptedTransport::new([ok_json("%PDF-1.7")]).with_progress(&[0.5, 1.0]),
    );
    let manager = RequestManager::builder(transport.clone())
        .download_observer(observer.clone())
        .build();
    let endpoint = EndpointDescriptor::get("https://cdn.example.com").path_suffix("/files/report.pdf");
    let destination = DownloadDestination::new(&target).create_intermediate_directories(true);

    let outcome = manager
        .download(&endpoint, ApiRequest::new(), destination)
        .await;

    let expected = target.to_string_lossy().into_owned();
    assert_eq!(outcome.value(), Some(&expected));
    assert_eq!(
        observer.events(),
        vec![
            ProgressEvent::new(0.5, "report.pdf"),
            ProgressEvent::new(1.0, "report.pdf"),
        ]
    );
    assert_eq!(
        std::fs::read(&target).expect("downloaded file"),
        b"%PDF-1.7".to_vec()
    );
}

#[tokio::test(start_paused = true)]
async fn download_failure_notifies_observer_with_file_name() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(ScriptedTransport::new([status(
        404,
        r#"{"message":"missing"}"#,
    )]));
    let manager = RequestManager::builder(transport.clone())
        .download_observer(observer.clone())
        .build();
    let endpoint = EndpointDescriptor::get("https://cdn.example.com").path_suffix("/files/report.pdf");

    let outcome = manager
        .download(
            &endpoint,
            ApiRequest::new(),
            DownloadDestination::new(dir.path().join("report.pdf")),
        )
        .await;

    assert_eq!(
        outcome.error().map(|error| error.message.as_str()),
        Some("missing")
    );
    assert_eq!(
        observer.failures(),
        vec![("report.pdf".to_owned(), "missing".to_owned())]
    );
    assert!(!dir.path().join("report.pdf").exists());
}

#[tokio::test(start_paused = true)]
async fn download_refuses_to_overwrite_existing_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let target = dir.path().join("report.pdf");
    std::fs::write(&target, b"old").expect("write existing file");
    let transport = Arc::new(ScriptedTransport::new([ok_json("new")]));
    let manager = manager_with(&transport);
    let endpoint = EndpointDescriptor::get("https://cdn.example.com").path_suffix("/report.pdf");

    let outcome = manager
        .download(&endpoint, ApiRequest::new(), DownloadDestination::new(&target))
        .await;

    let error = outcome.error().expect("existing file should block download");
    assert!(error.message.contains("already exists"));
    assert_eq!(std::fs::read(&target).expect("existing file"), b"old".to_vec());
}

#[tokio::test(start_paused = true)]
async fn cancelled_call_never_runs_handler() {
    let transport = Arc::new(
        ScriptedTransport::new([ok_json(r#"{"id":6}"#)]).with_delay(Duration::from_secs(30)),
    );
    let manager = manager_with(&transport);
    let handled = Arc::new(AtomicBool::new(false));
    let flag = handled.clone();

    let handle = manager.spawn_call::<Item, _, _>(&items_endpoint(), ApiRequest::new(), move |_| {
        flag.store(true, Ordering::SeqCst);
    });
    handle.cancel();

    assert!(handle.is_cancelled());
    assert!(!handle.wait().await);
    assert!(!handled.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn spawned_call_delivers_outcome_to_handler() {
    let transport = Arc::new(ScriptedTransport::new([ok_json(r#"{"id":8}"#)]));
    let manager = manager_with(&transport);
    let (sender, receiver) = tokio::sync::oneshot::channel();

    let handle = manager.spawn_call::<Item, _, _>(&items_endpoint(), ApiRequest::new(), move |outcome| {
        let _ = sender.send(outcome.into_result());
    });

    assert!(handle.wait().await);
    let delivered = receiver.await.expect("handler should send");
    assert_eq!(delivered, Ok(Item { id: 8 }));
}

#[tokio::test(start_paused = true)]
async fn spawned_download_hands_path_to_handler() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let target = dir.path().join("notes.txt");
    let transport = Arc::new(ScriptedTransport::new([ok_json("hello")]));
    let manager = manager_with(&transport);
    let endpoint = EndpointDescriptor::get("https://cdn.example.com").path_suffix("/notes.txt");
    let (sender, receiver) = tokio::sync::oneshot::channel();

    let handle = manager.spawn_download(
        &endpoint,
        ApiRequest::new(),
        DownloadDestination::new(&target),
        move |outcome| {
            let _ = sender.send(outcome.into_result());
        },
    );

    assert!(handle.wait().await);
    let expected = target.to_string_lossy().into_owned();
    assert_eq!(receiver.await.expect("handler should send"), Ok(expected));
}

#[tokio::test(start_paused = true)]
async fn download_with_html_error_page_uses_generic_message() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let observer = Arc::new(RecordingObserver::default());
    let transport = Arc::new(ScriptedTransport::new([status(
        404,
        "<html><body>Not Found</body></html>",
    )]));
    let manager = RequestManager::builder(transport.clone())
        .download_observer(observer.clone())
        .build();
    let endpoint = EndpointDescriptor::get("https://cdn.example.com").path_suffix("/files/r.pdf");

    let outcome = manager
        .download(
            &endpoint,
            ApiRequest::new(),
            DownloadDestination::new(dir.path().join("r.pdf")),
        )
        .await;

    let error = outcome.error().expect("404 download should fail");
    assert_eq!(error.message, "Please try again later.");
    assert_eq!(error.code(), Some(ErrorCode::HttpStatus));
    assert_eq!(
        observer.failures(),
        vec![("r.pdf".to_owned(), "Please try again later.".to_owned())]
    );
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_shared_calls_share_one_retry_budget() {
    let transport = Arc::new(ScriptedTransport::new((0..12).map(|_| status(503, ""))));
    let manager = RequestManager::builder(transport.clone())
        .retry_scope(RetryScope::Shared)
        .build();
    let endpoint = items_endpoint();

    let (first, second, third) = tokio::join!(
        manager.call::<Item, _>(&endpoint, ApiRequest::new()),
        manager.call::<Item, _>(&endpoint, ApiRequest::new()),
        manager.call::<Item, _>(&endpoint, ApiRequest::new()),
    );

    for outcome in [first, second, third] {
        assert_eq!(
            outcome.error().map(|error| error.message.as_str()),
            Some("Please try again later.")
        );
    }
    assert_eq!(transport.calls(), 12);
    assert_eq!(manager.consecutive_retries(), 0);
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "handler failed")]
async fn handler_panic_resurfaces_from_wait() {
    let transport = Arc::new(ScriptedTransport::new([ok_json(r#"{"id":9}"#)]));
    let manager = manager_with(&transport);

    let handle = manager.spawn_call::<Item, _, _>(&items_endpoint(), ApiRequest::new(), |_| {
        panic!("handler failed");
    });

    handle.wait().await;
}
