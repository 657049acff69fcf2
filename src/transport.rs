//! Boundary between the request manager and the HTTP engine.
//!
//! The manager never touches sockets. It hands a fully composed
//! [`TransportRequest`] to a [`Transport`] and interprets what comes back.
//! Connection pooling, TLS and timeouts are the transport's concern.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use url::Url;

use crate::error::TransportError;

#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Clone, Debug)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// `path` is `None` for non-2xx responses; `body` then holds the error payload.
#[derive(Clone, Debug)]
pub struct DownloadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub path: Option<PathBuf>,
    pub body: Bytes,
}

impl DownloadResponse {
    pub fn saved(status: StatusCode, path: impl Into<PathBuf>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            path: Some(path.into()),
            body: Bytes::new(),
        }
    }

    pub fn rejected(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            path: None,
            body: body.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadDestination {
    path: PathBuf,
    create_intermediate_directories: bool,
    remove_previous_file: bool,
}

impl DownloadDestination {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_intermediate_directories: false,
            remove_previous_file: false,
        }
    }

    pub fn create_intermediate_directories(mut self, create: bool) -> Self {
        self.create_intermediate_directories = create;
        self
    }

    pub fn remove_previous_file(mut self, remove: bool) -> Self {
        self.remove_previous_file = remove;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn prepare(&self) -> Result<(), TransportError> {
        if self.create_intermediate_directories
            && let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        if tokio::fs::try_exists(&self.path).await? {
            if !self.remove_previous_file {
                return Err(TransportError::new(
                    crate::error::TransportErrorKind::Io,
                    format!("download destination {} already exists", self.path.display()),
                ));
            }
            tokio::fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

/// `upload` and `download` report completed fractions in `0.0..=1.0` through `progress`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, request: TransportRequest)
    -> Result<TransportResponse, TransportError>;

    async fn upload(
        &self,
        request: TransportRequest,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<TransportResponse, TransportError>;

    async fn download(
        &self,
        request: TransportRequest,
        destination: &DownloadDestination,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<DownloadResponse, TransportError>;
}
