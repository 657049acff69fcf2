//! `reqflow` orchestrates typed HTTP calls for application SDKs: JSON requests,
//! multipart uploads and file downloads, with a bounded retry policy and a
//! single user-facing error type.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use reqflow::prelude::{
//!     ApiRequest, EndpointDescriptor, HyperTransport, RequestManager, RequestOutcome,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Profile {
//!     name: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = HyperTransport::builder().try_build()?;
//!     let manager = RequestManager::builder(Arc::new(transport))
//!         .client_name("my-app")
//!         .build();
//!
//!     let endpoint = EndpointDescriptor::get("https://api.example.com").path_suffix("/v1/profile");
//!     let request = ApiRequest::new().query_param("expand", "teams");
//!     match manager.call::<Profile, _>(&endpoint, request).await {
//!         RequestOutcome::Success { value, .. } => println!("hello {}", value.name),
//!         RequestOutcome::Failure { error, .. } => eprintln!("{}: {}", error.title, error.message),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Retries
//!
//! - 5xx responses are retried up to three times, one second apart.
//! - Aborted connections are retried every second without the 5xx cap.
//! - Every other failure is returned immediately.
//! - Retry state is per call unless the manager uses [`RetryScope::Shared`].

mod body;
mod compose;
mod endpoint;
mod error;
#[cfg(feature = "hyper-transport")]
mod hyper_transport;
mod manager;
mod multipart;
mod observe;
mod params;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub use crate::body::{
    EncodedBody, FormEncoding, JsonEncoding, ParameterEncoding, RawStringEncoding, encode_simple,
};
pub use crate::compose::{build_url, query_value};
pub use crate::endpoint::{Endpoint, EndpointDescriptor, Environment};
pub use crate::error::{
    Error, ErrorCode, NormalizedError, ServerErrorPayload, TransportError, TransportErrorKind,
};
#[cfg(feature = "hyper-transport")]
pub use crate::hyper_transport::{HyperTransport, HyperTransportBuilder};
pub use crate::manager::{CallHandle, RequestManager, RequestManagerBuilder};
pub use crate::multipart::{
    DEFAULT_IMAGE_QUALITY, DefaultMimeResolver, ImageCompressor, MimeResolver, MultipartBody,
    MultipartEncoder, MultipartPart, PassthroughCompressor, encode_multipart,
};
pub use crate::observe::{DownloadObserver, ProgressEvent, UploadObserver};
pub use crate::params::{Attachment, ImageData, ParamValue, Parameters};
pub use crate::request::ApiRequest;
pub use crate::response::{RequestOutcome, ResponseMeta};
pub use crate::retry::{Retrier, RetryDecision, RetryPolicy, RetryScope, RetryState, RetryVerdict};
pub use crate::transport::{
    DownloadDestination, DownloadResponse, Transport, TransportRequest, TransportResponse,
};

pub type ReqflowResult<T> = std::result::Result<T, Error>;

pub mod prelude {
    #[cfg(feature = "hyper-transport")]
    pub use crate::HyperTransport;
    pub use crate::{
        ApiRequest, Attachment, DownloadDestination, DownloadObserver, Endpoint,
        EndpointDescriptor, Environment, ErrorCode, ImageData, NormalizedError, ParamValue,
        Parameters, ProgressEvent, ReqflowResult, RequestManager, RequestOutcome, RetryPolicy,
        RetryScope, Transport, UploadObserver,
    };
}
