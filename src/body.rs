use bytes::Bytes;
use http::HeaderValue;

use crate::error::Error;
use crate::params::Parameters;

/// Serialized request body plus the content type it should be sent with.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EncodedBody {
    pub content_type: Option<HeaderValue>,
    pub bytes: Bytes,
}

impl EncodedBody {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Strategy turning non-multipart parameters into a request body.
pub trait ParameterEncoding: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, parameters: &Parameters) -> Result<EncodedBody, Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonEncoding;

impl ParameterEncoding for JsonEncoding {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, parameters: &Parameters) -> Result<EncodedBody, Error> {
        if parameters.is_empty() {
            return Ok(EncodedBody::empty());
        }
        let body =
            serde_json::to_vec(parameters).map_err(|source| Error::SerializeJson { source })?;
        Ok(EncodedBody {
            content_type: Some(HeaderValue::from_static("application/json")),
            bytes: Bytes::from(body),
        })
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct FormEncoding;

impl ParameterEncoding for FormEncoding {
    fn name(&self) -> &'static str {
        "form"
    }

    fn encode(&self, parameters: &Parameters) -> Result<EncodedBody, Error> {
        if parameters.is_empty() {
            return Ok(EncodedBody::empty());
        }
        let encoded = serde_urlencoded::to_string(parameters)
            .map_err(|source| Error::SerializeForm { source })?;
        Ok(EncodedBody {
            content_type: Some(HeaderValue::from_static(
                "application/x-www-form-urlencoded",
            )),
            bytes: Bytes::from(encoded),
        })
    }
}

/// Sends a fixed string as the body, ignoring the call parameters.
#[derive(Clone, Debug, Default)]
pub struct RawStringEncoding(pub String);

impl ParameterEncoding for RawStringEncoding {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn encode(&self, _parameters: &Parameters) -> Result<EncodedBody, Error> {
        Ok(EncodedBody {
            content_type: None,
            bytes: Bytes::from(self.0.clone()),
        })
    }
}

pub fn encode_simple(
    parameters: &Parameters,
    encoding: &dyn ParameterEncoding,
) -> Result<EncodedBody, Error> {
    encoding.encode(parameters)
}
