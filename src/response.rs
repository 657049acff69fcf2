use http::{HeaderMap, StatusCode};
use url::Url;

use crate::error::NormalizedError;

/// Status line and headers of the final attempt of a call.
#[derive(Clone, Debug)]
pub struct ResponseMeta {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
}

impl ResponseMeta {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, url: Url) -> Self {
        Self {
            status,
            headers,
            url,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

/// Terminal result of one logical call, retries included.
#[derive(Clone, Debug)]
pub enum RequestOutcome<T> {
    Success {
        value: T,
        response: ResponseMeta,
    },
    Failure {
        error: NormalizedError,
        response: Option<ResponseMeta>,
    },
}

impl<T> RequestOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn response(&self) -> Option<&ResponseMeta> {
        match self {
            Self::Success { response, .. } => Some(response),
            Self::Failure { response, .. } => response.as_ref(),
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Success { value, .. } => Some(value),
            Self::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&NormalizedError> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { error, .. } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, NormalizedError> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failure { error, .. } => Err(error),
        }
    }
}
