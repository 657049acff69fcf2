use crate::params::{ParamValue, Parameters};

/// Per-call inputs layered on top of an endpoint descriptor.
#[derive(Clone, Debug, Default)]
pub struct ApiRequest {
    params: Parameters,
    query: Parameters,
    path: Option<String>,
    headers: Vec<(String, String)>,
    cookies: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn params(mut self, params: Parameters) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn query(mut self, query: Parameters) -> Self {
        self.query = query;
        self
    }

    pub fn query_param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.query.insert(key, value);
        self
    }

    /// Appended verbatim after the endpoint's own path suffix.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), value.into()));
        self
    }

    pub fn parameters(&self) -> &Parameters {
        &self.params
    }

    pub fn query_parameters(&self) -> &Parameters {
        &self.query
    }

    pub fn path_parameters(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn extra_headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub(crate) fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let pairs = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>();
        Some(pairs.join("; "))
    }
}
