use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::body::encode_simple;
use crate::compose::build_url;
use crate::endpoint::{Endpoint, EndpointDescriptor, Environment};
use crate::error::{Error, NormalizedError, TransportError};
use crate::multipart::{
    DEFAULT_IMAGE_QUALITY, DefaultMimeResolver, ImageCompressor, MimeResolver, MultipartEncoder,
    PassthroughCompressor,
};
use crate::observe::{DownloadObserver, ProgressEvent, UploadObserver};
use crate::request::ApiRequest;
use crate::response::{RequestOutcome, ResponseMeta};
use crate::retry::{Retrier, RetryDecision, RetryPolicy, RetryScope};
use crate::transport::{DownloadDestination, DownloadResponse, Transport, TransportResponse};
use crate::util::{last_path_segment, parse_header_name, parse_header_value, redact_url_for_logs};

const DEFAULT_CLIENT_NAME: &str = "reqflow";

pub struct RequestManagerBuilder {
    transport: Arc<dyn Transport>,
    client_name: String,
    environment: Environment,
    retry_policy: RetryPolicy,
    retry_scope: RetryScope,
    mime_resolver: Arc<dyn MimeResolver>,
    image_compressor: Arc<dyn ImageCompressor>,
    image_quality: f32,
    upload_observer: Option<Arc<dyn UploadObserver>>,
    download_observer: Option<Arc<dyn DownloadObserver>>,
    default_headers: Vec<(String, String)>,
}

impl RequestManagerBuilder {
    fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            environment: Environment::default(),
            retry_policy: RetryPolicy::standard(),
            retry_scope: RetryScope::default(),
            mime_resolver: Arc::new(DefaultMimeResolver),
            image_compressor: Arc::new(PassthroughCompressor),
            image_quality: DEFAULT_IMAGE_QUALITY,
            upload_observer: None,
            download_observer: None,
            default_headers: Vec::new(),
        }
    }

    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn retry_scope(mut self, retry_scope: RetryScope) -> Self {
        self.retry_scope = retry_scope;
        self
    }

    pub fn mime_resolver(mut self, mime_resolver: Arc<dyn MimeResolver>) -> Self {
        self.mime_resolver = mime_resolver;
        self
    }

    pub fn image_compressor(mut self, image_compressor: Arc<dyn ImageCompressor>) -> Self {
        self.image_compressor = image_compressor;
        self
    }

    pub fn image_quality(mut self, image_quality: f32) -> Self {
        self.image_quality = image_quality;
        self
    }

    pub fn upload_observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.upload_observer = Some(observer);
        self
    }

    pub fn download_observer(mut self, observer: Arc<dyn DownloadObserver>) -> Self {
        self.download_observer = Some(observer);
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> RequestManager {
        let shared_retrier = Arc::new(Retrier::new(self.retry_policy.clone()));
        RequestManager {
            inner: Arc::new(ManagerInner {
                transport: self.transport,
                client_name: self.client_name,
                environment: self.environment,
                retry_policy: self.retry_policy,
                retry_scope: self.retry_scope,
                shared_retrier,
                encoder: MultipartEncoder::new(
                    self.mime_resolver,
                    self.image_compressor,
                    self.image_quality,
                ),
                upload_observer: self.upload_observer,
                download_observer: self.download_observer,
                default_headers: self.default_headers,
            }),
        }
    }
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    client_name: String,
    environment: Environment,
    retry_policy: RetryPolicy,
    retry_scope: RetryScope,
    shared_retrier: Arc<Retrier>,
    encoder: MultipartEncoder,
    upload_observer: Option<Arc<dyn UploadObserver>>,
    download_observer: Option<Arc<dyn DownloadObserver>>,
    default_headers: Vec<(String, String)>,
}

#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<ManagerInner>,
}

#[derive(Debug)]
pub struct CallHandle {
    token: CancellationToken,
    task: JoinHandle<bool>,
}

impl CallHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Waits for the task; `true` when the completion handler ran. A panic in
    /// the handler is resumed on the caller.
    pub async fn wait(self) -> bool {
        match self.task.await {
            Ok(ran) => ran,
            Err(error) if error.is_panic() => std::panic::resume_unwind(error.into_panic()),
            Err(_) => false,
        }
    }
}

struct CallFailure {
    error: Error,
    response: Option<ResponseMeta>,
}

impl From<Error> for CallFailure {
    fn from(error: Error) -> Self {
        Self {
            error,
            response: None,
        }
    }
}

struct PreparedRequest {
    method: Method,
    url: Url,
    redacted_url: String,
    headers: HeaderMap,
}

impl PreparedRequest {
    fn transport_request(&self, body: Bytes) -> crate::transport::TransportRequest {
        crate::transport::TransportRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body,
        }
    }

    fn response_meta(&self, status: StatusCode, headers: &HeaderMap) -> ResponseMeta {
        ResponseMeta::new(status, headers.clone(), self.url.clone())
    }
}

trait AttemptResponse {
    fn status(&self) -> StatusCode;
    fn headers(&self) -> &HeaderMap;
    fn error_body(&self) -> Bytes;
}

impl AttemptResponse for TransportResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn error_body(&self) -> Bytes {
        self.body.clone()
    }
}

impl AttemptResponse for DownloadResponse {
    fn status(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn error_body(&self) -> Bytes {
        self.body.clone()
    }
}

enum AttemptFlow<R> {
    Finished(Result<R, CallFailure>),
    RetryAfter(Duration),
}

impl RequestManager {
    pub fn builder(transport: Arc<dyn Transport>) -> RequestManagerBuilder {
        RequestManagerBuilder::new(transport)
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    pub fn retry_scope(&self) -> RetryScope {
        self.inner.retry_scope
    }

    pub fn consecutive_retries(&self) -> usize {
        self.inner.shared_retrier.consecutive_retries()
    }

    /// Overrides the shared retry count, e.g. to reset back-off or to force
    /// the server-error cap as exhausted. Only calls issued under
    /// [`RetryScope::Shared`] observe it.
    pub fn set_number_of_retries(&self, count: usize) {
        self.inner.shared_retrier.set_consecutive_retries(count);
    }

    pub async fn call<T, E>(&self, endpoint: &E, request: ApiRequest) -> RequestOutcome<T>
    where
        T: DeserializeOwned,
        E: Endpoint + ?Sized,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        self.call_descriptor(&descriptor, &request).await
    }

    pub async fn upload<T, E>(&self, endpoint: &E, request: ApiRequest) -> RequestOutcome<T>
    where
        T: DeserializeOwned,
        E: Endpoint + ?Sized,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        self.upload_descriptor(&descriptor, &request).await
    }

    pub async fn download<E>(
        &self,
        endpoint: &E,
        request: ApiRequest,
        destination: DownloadDestination,
    ) -> RequestOutcome<String>
    where
        E: Endpoint + ?Sized,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        self.download_descriptor(&descriptor, &request, &destination)
            .await
    }

    pub fn spawn_call<T, E, F>(&self, endpoint: &E, request: ApiRequest, handler: F) -> CallHandle
    where
        T: DeserializeOwned + Send + 'static,
        E: Endpoint + ?Sized,
        F: FnOnce(RequestOutcome<T>) + Send + 'static,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        let manager = self.clone();
        spawn_cancellable(
            async move { manager.call_descriptor(&descriptor, &request).await },
            handler,
        )
    }

    pub fn spawn_upload<T, E, F>(
        &self,
        endpoint: &E,
        request: ApiRequest,
        handler: F,
    ) -> CallHandle
    where
        T: DeserializeOwned + Send + 'static,
        E: Endpoint + ?Sized,
        F: FnOnce(RequestOutcome<T>) + Send + 'static,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        let manager = self.clone();
        spawn_cancellable(
            async move { manager.upload_descriptor(&descriptor, &request).await },
            handler,
        )
    }

    pub fn spawn_download<E, F>(
        &self,
        endpoint: &E,
        request: ApiRequest,
        destination: DownloadDestination,
        handler: F,
    ) -> CallHandle
    where
        E: Endpoint + ?Sized,
        F: FnOnce(RequestOutcome<String>) + Send + 'static,
    {
        let descriptor = endpoint.descriptor(self.inner.environment);
        let manager = self.clone();
        spawn_cancellable(
            async move {
                manager
                    .download_descriptor(&descriptor, &request, &destination)
                    .await
            },
            handler,
        )
    }

    fn retrier_for_call(&self) -> Arc<Retrier> {
        match self.inner.retry_scope {
            RetryScope::Shared => self.inner.shared_retrier.clone(),
            RetryScope::PerCall => Arc::new(Retrier::new(self.inner.retry_policy.clone())),
        }
    }

    async fn call_descriptor<T>(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
    ) -> RequestOutcome<T>
    where
        T: DeserializeOwned,
    {
        let retrier = self.retrier_for_call();
        match self.execute_call(descriptor, request, &retrier).await {
            Ok((value, response)) => {
                retrier.reset();
                RequestOutcome::Success { value, response }
            }
            Err(failure) => {
                warn!(
                    code = failure.error.code().as_str(),
                    error = %failure.error,
                    "call failed"
                );
                RequestOutcome::Failure {
                    error: NormalizedError::from_error(&failure.error),
                    response: failure.response,
                }
            }
        }
    }

    async fn execute_call<T>(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
        retrier: &Retrier,
    ) -> Result<(T, ResponseMeta), CallFailure>
    where
        T: DeserializeOwned,
    {
        let encoded = encode_simple(request.parameters(), descriptor.parameter_encoding())?;
        let prepared = self.prepare(descriptor, request, encoded.content_type)?;
        let transport_request = prepared.transport_request(encoded.bytes);
        let transport = self.inner.transport.as_ref();
        let response = self
            .dispatch(retrier, &prepared, || {
                transport.request(transport_request.clone())
            })
            .await?;
        decode_json(&prepared, response)
    }

    async fn upload_descriptor<T>(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
    ) -> RequestOutcome<T>
    where
        T: DeserializeOwned,
    {
        let retrier = self.retrier_for_call();
        let identifier = upload_identifier(descriptor, request);
        match self
            .execute_upload(descriptor, request, &retrier, &identifier)
            .await
        {
            Ok((value, response)) => {
                retrier.reset();
                RequestOutcome::Success { value, response }
            }
            Err(failure) => {
                warn!(
                    code = failure.error.code().as_str(),
                    error = %failure.error,
                    "upload failed"
                );
                let error = NormalizedError::from_error(&failure.error);
                if let Some(observer) = &self.inner.upload_observer {
                    observer.on_upload_failed(&identifier, &error.message);
                }
                RequestOutcome::Failure {
                    error,
                    response: failure.response,
                }
            }
        }
    }

    async fn execute_upload<T>(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
        retrier: &Retrier,
        identifier: &str,
    ) -> Result<(T, ResponseMeta), CallFailure>
    where
        T: DeserializeOwned,
    {
        let mut prepared = self.prepare(descriptor, request, None)?;
        let body = self.inner.encoder.encode(request.parameters()).await?;
        let content_type = body.content_type();
        prepared.headers.insert(
            CONTENT_TYPE,
            parse_header_value(CONTENT_TYPE.as_str(), &content_type)?,
        );
        let transport_request = prepared.transport_request(body.to_bytes());

        let observer = self.inner.upload_observer.clone();
        let progress = move |fraction: f64| {
            if let Some(observer) = &observer {
                observer.on_upload_progress(&ProgressEvent::new(fraction, identifier));
            }
        };
        let transport = self.inner.transport.as_ref();
        let progress = &progress;
        let transport_request = &transport_request;
        let response = self
            .dispatch(retrier, &prepared, move || {
                transport.upload(transport_request.clone(), progress)
            })
            .await?;
        decode_json(&prepared, response)
    }

    async fn download_descriptor(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
        destination: &DownloadDestination,
    ) -> RequestOutcome<String> {
        let retrier = self.retrier_for_call();
        let mut file_name = String::new();
        match self
            .execute_download(descriptor, request, destination, &retrier, &mut file_name)
            .await
        {
            Ok((path, response)) => {
                retrier.reset();
                RequestOutcome::Success {
                    value: path,
                    response,
                }
            }
            Err(failure) => {
                warn!(
                    code = failure.error.code().as_str(),
                    error = %failure.error,
                    "download failed"
                );
                let error = match &failure.error {
                    Error::HttpStatus { .. } | Error::Deserialize { .. } => {
                        NormalizedError::from_error(&failure.error)
                    }
                    other => NormalizedError::describing(other),
                };
                if let Some(observer) = &self.inner.download_observer {
                    observer.on_download_failed(&file_name, &error.message);
                }
                RequestOutcome::Failure {
                    error,
                    response: failure.response,
                }
            }
        }
    }

    async fn execute_download(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
        destination: &DownloadDestination,
        retrier: &Retrier,
        file_name: &mut String,
    ) -> Result<(String, ResponseMeta), CallFailure> {
        let encoded = encode_simple(request.parameters(), descriptor.parameter_encoding())?;
        let prepared = self.prepare(descriptor, request, encoded.content_type)?;
        *file_name = last_path_segment(&prepared.url);
        let transport_request = prepared.transport_request(encoded.bytes);

        let observer = self.inner.download_observer.clone();
        let event_name = file_name.clone();
        let progress = move |fraction: f64| {
            if let Some(observer) = &observer {
                observer.on_download_progress(&ProgressEvent::new(fraction, event_name.as_str()));
            }
        };
        let transport = self.inner.transport.as_ref();
        let progress = &progress;
        let transport_request = &transport_request;
        let response = self
            .dispatch(retrier, &prepared, move || {
                transport.download(transport_request.clone(), destination, progress)
            })
            .await?;

        let meta = prepared.response_meta(response.status, &response.headers);
        match response.path {
            Some(path) => Ok((path.to_string_lossy().into_owned(), meta)),
            None => Err(CallFailure {
                error: Error::Transport {
                    method: prepared.method.clone(),
                    url: prepared.redacted_url.clone(),
                    source: TransportError::new(
                        crate::error::TransportErrorKind::Other,
                        "transport reported success without a downloaded file",
                    ),
                },
                response: Some(meta),
            }),
        }
    }

    fn prepare(
        &self,
        descriptor: &EndpointDescriptor,
        request: &ApiRequest,
        content_type: Option<HeaderValue>,
    ) -> Result<PreparedRequest, Error> {
        let base = format!(
            "{}{}",
            descriptor.base_url(),
            descriptor.path().unwrap_or_default()
        );
        let url = build_url(
            &base,
            request.path_parameters(),
            Some(request.query_parameters()),
        )?;

        let mut headers = HeaderMap::new();
        let configured = self
            .inner
            .default_headers
            .iter()
            .chain(descriptor.headers())
            .chain(request.extra_headers());
        for (name, value) in configured {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.insert(header_name, header_value);
        }
        if let Some(cookies) = request.cookie_header() {
            headers.insert(COOKIE, parse_header_value(COOKIE.as_str(), &cookies)?);
        }
        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, content_type);
        }

        Ok(PreparedRequest {
            method: descriptor.method().clone(),
            redacted_url: redact_url_for_logs(url.as_str()),
            url,
            headers,
        })
    }

    async fn dispatch<R, F, Fut>(
        &self,
        retrier: &Retrier,
        prepared: &PreparedRequest,
        mut send: F,
    ) -> Result<R, CallFailure>
    where
        R: AttemptResponse,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<R, TransportError>>,
    {
        let mut attempt = 0_usize;
        loop {
            attempt += 1;
            let span = info_span!(
                "reqflow.request",
                client = %self.inner.client_name,
                method = %prepared.method,
                url = %prepared.redacted_url,
                attempt = attempt
            );
            let flow = run_attempt(retrier, prepared, attempt, send())
                .instrument(span)
                .await;
            match flow {
                AttemptFlow::Finished(result) => return result,
                AttemptFlow::RetryAfter(delay) => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}

async fn run_attempt<R, Fut>(
    retrier: &Retrier,
    prepared: &PreparedRequest,
    attempt: usize,
    send: Fut,
) -> AttemptFlow<R>
where
    R: AttemptResponse,
    Fut: Future<Output = Result<R, TransportError>>,
{
    let started = Instant::now();
    debug!("sending request");
    match send.await {
        Ok(response) => {
            let status = response.status();
            debug!(
                status = status.as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "request completed"
            );
            if status.is_success() {
                return AttemptFlow::Finished(Ok(response));
            }

            let error = Error::HttpStatus {
                status: status.as_u16(),
                method: prepared.method.clone(),
                url: prepared.redacted_url.clone(),
                body: response.error_body(),
            };
            let verdict = retrier.decide(&RetryDecision {
                attempt,
                method: prepared.method.clone(),
                url: prepared.redacted_url.clone(),
                status: Some(status),
                transport_error: None,
            });
            if verdict.retry {
                warn!(
                    status = status.as_u16(),
                    delay_ms = verdict.delay.as_millis() as u64,
                    error = %error,
                    "retrying request after server error"
                );
                return AttemptFlow::RetryAfter(verdict.delay);
            }
            AttemptFlow::Finished(Err(CallFailure {
                error,
                response: Some(prepared.response_meta(status, response.headers())),
            }))
        }
        Err(source) => {
            let verdict = retrier.decide(&RetryDecision {
                attempt,
                method: prepared.method.clone(),
                url: prepared.redacted_url.clone(),
                status: None,
                transport_error: Some(source.clone()),
            });
            let error = Error::Transport {
                method: prepared.method.clone(),
                url: prepared.redacted_url.clone(),
                source,
            };
            if verdict.retry {
                warn!(
                    delay_ms = verdict.delay.as_millis() as u64,
                    error = %error,
                    "retrying request after transport error"
                );
                return AttemptFlow::RetryAfter(verdict.delay);
            }
            AttemptFlow::Finished(Err(CallFailure {
                error,
                response: None,
            }))
        }
    }
}

fn decode_json<T>(
    prepared: &PreparedRequest,
    response: TransportResponse,
) -> Result<(T, ResponseMeta), CallFailure>
where
    T: DeserializeOwned,
{
    let meta = prepared.response_meta(response.status, &response.headers);
    match serde_json::from_slice(&response.body) {
        Ok(value) => Ok((value, meta)),
        Err(source) => Err(CallFailure {
            error: Error::Deserialize {
                source,
                body: response.body,
            },
            response: Some(meta),
        }),
    }
}

fn upload_identifier(descriptor: &EndpointDescriptor, request: &ApiRequest) -> String {
    let joined = format!(
        "{}{}{}",
        descriptor.base_url(),
        descriptor.path().unwrap_or_default(),
        request.path_parameters().unwrap_or_default()
    );
    redact_url_for_logs(&joined)
}

fn spawn_cancellable<O, Fut, F>(operation: Fut, handler: F) -> CallHandle
where
    O: Send + 'static,
    Fut: Future<Output = O> + Send + 'static,
    F: FnOnce(O) + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    let task = tokio::spawn(async move {
        tokio::select! {
            biased;
            () = cancelled.cancelled() => {
                debug!("operation cancelled; completion suppressed");
                false
            }
            outcome = operation => {
                handler(outcome);
                true
            }
        }
    });
    CallHandle { token, task }
}
