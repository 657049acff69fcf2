use std::fmt;
use std::sync::Arc;

use http::Method;

use crate::body::{JsonEncoding, ParameterEncoding};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

/// Resolved target of one logical API call.
#[derive(Clone)]
pub struct EndpointDescriptor {
    base_url: String,
    path_suffix: Option<String>,
    method: Method,
    headers: Vec<(String, String)>,
    encoding: Arc<dyn ParameterEncoding>,
}

impl EndpointDescriptor {
    pub fn new(method: Method, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            path_suffix: None,
            method,
            headers: Vec::new(),
            encoding: Arc::new(JsonEncoding),
        }
    }

    pub fn get(base_url: impl Into<String>) -> Self {
        Self::new(Method::GET, base_url)
    }

    pub fn post(base_url: impl Into<String>) -> Self {
        Self::new(Method::POST, base_url)
    }

    pub fn path_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.path_suffix = Some(suffix.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn encoding(mut self, encoding: impl ParameterEncoding + 'static) -> Self {
        self.encoding = Arc::new(encoding);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn path(&self) -> Option<&str> {
        self.path_suffix.as_deref()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn parameter_encoding(&self) -> &dyn ParameterEncoding {
        self.encoding.as_ref()
    }
}

impl fmt::Debug for EndpointDescriptor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EndpointDescriptor")
            .field("base_url", &self.base_url)
            .field("path_suffix", &self.path_suffix)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("encoding", &self.encoding.name())
            .finish()
    }
}

/// Maps a logical API endpoint to its descriptor for an environment.
///
/// Applications usually implement this on an enum of their endpoints and pick
/// base URLs per environment.
pub trait Endpoint: Send + Sync {
    fn descriptor(&self, environment: Environment) -> EndpointDescriptor;
}

impl Endpoint for EndpointDescriptor {
    fn descriptor(&self, _environment: Environment) -> EndpointDescriptor {
        self.clone()
    }
}
