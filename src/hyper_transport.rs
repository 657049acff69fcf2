use std::convert::Infallible;
use std::error::Error as StdError;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use http::header::{CONTENT_LENGTH, HeaderValue};
use http::{HeaderMap, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{TransportError, TransportErrorKind};
use crate::transport::{
    DownloadDestination, DownloadResponse, Transport, TransportRequest, TransportResponse,
};

type BoxError = Box<dyn StdError + Send + Sync>;
type ReqBody = BoxBody<Bytes, BoxError>;
type HyperClient = Client<HttpsConnector<HttpConnector>, ReqBody>;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 8;
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

pub struct HyperTransportBuilder {
    request_timeout: Duration,
    pool_idle_timeout: Duration,
    pool_max_idle_per_host: usize,
    max_response_body_bytes: usize,
}

impl HyperTransportBuilder {
    fn new() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pool_idle_timeout: DEFAULT_POOL_IDLE_TIMEOUT,
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
        }
    }

    /// Bounds connecting plus response headers, and each body read after that.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn pool_idle_timeout(mut self, pool_idle_timeout: Duration) -> Self {
        self.pool_idle_timeout = pool_idle_timeout;
        self
    }

    pub fn pool_max_idle_per_host(mut self, pool_max_idle_per_host: usize) -> Self {
        self.pool_max_idle_per_host = pool_max_idle_per_host;
        self
    }

    /// Applies to buffered responses; downloads stream to disk unbounded.
    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn try_build(self) -> Result<HyperTransport, TransportError> {
        let https = HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
            .map_err(|source| {
                TransportError::new(
                    TransportErrorKind::Tls,
                    format!("failed to initialize tls: {source}"),
                )
            })?
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(self.pool_idle_timeout)
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build(https);
        Ok(HyperTransport {
            client,
            request_timeout: self.request_timeout,
            max_response_body_bytes: self.max_response_body_bytes,
        })
    }
}

/// [`Transport`] backed by the hyper-util pooled client with rustls.
#[derive(Clone)]
pub struct HyperTransport {
    client: HyperClient,
    request_timeout: Duration,
    max_response_body_bytes: usize,
}

impl HyperTransport {
    pub fn builder() -> HyperTransportBuilder {
        HyperTransportBuilder::new()
    }

    async fn send(
        &self,
        request: &TransportRequest,
        headers: &HeaderMap,
        body: ReqBody,
    ) -> Result<Response<Incoming>, TransportError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let http_request = builder
            .body(body)
            .map_err(|source| TransportError::new(TransportErrorKind::Other, source.to_string()))?;

        match timeout(self.request_timeout, self.client.request(http_request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(source)) => Err(TransportError::new(
                classify_transport_error(&source),
                error_chain_text(&source),
            )),
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn next_frame(
        &self,
        body: &mut Incoming,
    ) -> Result<Option<Frame<Bytes>>, TransportError> {
        match timeout(self.request_timeout, body.frame()).await {
            Ok(Some(Ok(frame))) => Ok(Some(frame)),
            Ok(Some(Err(source))) => Err(TransportError::new(
                io_error_kind(&source).unwrap_or(TransportErrorKind::Read),
                error_chain_text(&source),
            )),
            Ok(None) => Ok(None),
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn read_all_body_limited(&self, mut body: Incoming) -> Result<Bytes, TransportError> {
        let mut collected = Vec::new();
        while let Some(frame) = self.next_frame(&mut body).await? {
            if let Some(data) = frame.data_ref() {
                if collected.len().saturating_add(data.len()) > self.max_response_body_bytes {
                    return Err(TransportError::new(
                        TransportErrorKind::Read,
                        format!(
                            "response body exceeds {} bytes",
                            self.max_response_body_bytes
                        ),
                    ));
                }
                collected.extend_from_slice(data);
            }
        }
        Ok(Bytes::from(collected))
    }

    async fn write_body_to(
        &self,
        body: &mut Incoming,
        path: &Path,
        expected_len: Option<u64>,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), TransportError> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut received = 0_u64;
        while let Some(frame) = self.next_frame(body).await? {
            let Ok(data) = frame.into_data() else {
                continue;
            };
            file.write_all(&data).await?;
            received = received.saturating_add(data.len() as u64);
            if let Some(expected_len) = expected_len {
                progress((received as f64 / expected_len as f64).min(1.0));
            }
        }
        file.flush().await?;
        if expected_len.is_none() {
            progress(1.0);
        }
        Ok(())
    }

    fn timeout_error(&self) -> TransportError {
        TransportError::new(
            TransportErrorKind::Timeout,
            format!(
                "request timed out after {}ms",
                self.request_timeout.as_millis()
            ),
        )
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn request(
        &self,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let body = buffered_req_body(request.body.clone());
        let response = self.send(&request, &request.headers, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = self.read_all_body_limited(response.into_body()).await?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    async fn upload(
        &self,
        request: TransportRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<TransportResponse, TransportError> {
        let total = request.body.len();
        let mut headers = request.headers.clone();
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total));

        let (sent_tx, mut sent_rx) = mpsc::unbounded_channel::<usize>();
        let chunks = split_chunks(&request.body, UPLOAD_CHUNK_BYTES);
        let frames = stream::iter(chunks.into_iter().map(move |chunk| {
            let _ = sent_tx.send(chunk.len());
            Ok::<_, BoxError>(Frame::data(chunk))
        }));
        let body = BodyExt::boxed(StreamBody::new(frames));

        let send = self.send(&request, &headers, body);
        tokio::pin!(send);
        let mut sent = 0_usize;
        let response = loop {
            tokio::select! {
                Some(chunk_len) = sent_rx.recv() => {
                    sent = sent.saturating_add(chunk_len);
                    if total > 0 {
                        progress(sent as f64 / total as f64);
                    }
                }
                result = &mut send => break result?,
            }
        };
        while let Ok(chunk_len) = sent_rx.try_recv() {
            sent = sent.saturating_add(chunk_len);
            progress(sent as f64 / total.max(1) as f64);
        }
        if total == 0 {
            progress(1.0);
        }
        debug!(bytes = sent, "upload body sent");

        let status = response.status();
        let headers = response.headers().clone();
        let body = self.read_all_body_limited(response.into_body()).await?;
        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }

    async fn download(
        &self,
        request: TransportRequest,
        destination: &DownloadDestination,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<DownloadResponse, TransportError> {
        destination.prepare().await?;
        let body = buffered_req_body(request.body.clone());
        let response = self.send(&request, &request.headers, body).await?;
        let status = response.status();
        let headers = response.headers().clone();
        if !status.is_success() {
            let body = self.read_all_body_limited(response.into_body()).await?;
            return Ok(DownloadResponse {
                status,
                headers,
                path: None,
                body,
            });
        }

        let expected_len = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .filter(|len| *len > 0);
        let mut body = response.into_body();
        let path = destination.path();
        if let Err(error) = self
            .write_body_to(&mut body, path, expected_len, progress)
            .await
        {
            let _ = tokio::fs::remove_file(path).await;
            return Err(error);
        }

        Ok(DownloadResponse {
            status,
            headers,
            path: Some(path.to_path_buf()),
            body: Bytes::new(),
        })
    }
}

fn map_infallible_to_box_error(never: Infallible) -> BoxError {
    match never {}
}

fn buffered_req_body(body: Bytes) -> ReqBody {
    Full::new(body).map_err(map_infallible_to_box_error).boxed()
}

fn split_chunks(body: &Bytes, chunk_len: usize) -> Vec<Bytes> {
    let mut chunks = Vec::with_capacity(body.len() / chunk_len + 1);
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk_len).min(body.len());
        chunks.push(body.slice(offset..end));
        offset = end;
    }
    chunks
}

fn error_chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        text.push_str(": ");
        text.push_str(&source.to_string());
        current = source.source();
    }
    text
}

fn io_error_kind(error: &(dyn StdError + 'static)) -> Option<TransportErrorKind> {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(io_error) = error.downcast_ref::<std::io::Error>() {
            match io_error.kind() {
                std::io::ErrorKind::ConnectionAborted => {
                    return Some(TransportErrorKind::ConnectionAborted);
                }
                std::io::ErrorKind::TimedOut => return Some(TransportErrorKind::Timeout),
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof => return Some(TransportErrorKind::Read),
                _ => {}
            }
        }
        current = error.source();
    }
    None
}

fn classify_transport_error(error: &hyper_util::client::legacy::Error) -> TransportErrorKind {
    if let Some(kind) = io_error_kind(error) {
        return kind;
    }

    let text = error_chain_text(error).to_ascii_lowercase();
    if text.contains("connection abort") {
        return TransportErrorKind::ConnectionAborted;
    }
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::split_chunks;

    #[test]
    fn split_chunks_covers_every_byte_once() {
        let body = Bytes::from(vec![7_u8; 10]);
        let chunks = split_chunks(&body, 4);
        let lengths: Vec<usize> = chunks.iter().map(Bytes::len).collect();
        assert_eq!(lengths, vec![4, 4, 2]);
    }

    #[test]
    fn split_chunks_of_empty_body_is_empty() {
        assert!(split_chunks(&Bytes::new(), 4).is_empty());
    }
}
