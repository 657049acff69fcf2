use url::Url;

use crate::error::Error;
use crate::params::Parameters;

/// Builds the request URL for an endpoint.
///
/// The path suffix is appended verbatim to `base`, so callers supply their own
/// leading `/`. Query parameters are appended after any query already present
/// on the base, in parameter order.
pub fn build_url(
    base: &str,
    path_suffix: Option<&str>,
    query: Option<&Parameters>,
) -> Result<Url, Error> {
    let url_text = match path_suffix {
        Some(suffix) => format!("{base}{suffix}"),
        None => base.to_owned(),
    };
    let mut url = Url::parse(&url_text).map_err(|source| Error::InvalidUrl {
        url: url_text.clone(),
        source,
    })?;

    if let Some(query) = query.filter(|query| !query.is_empty()) {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query.iter() {
            pairs.append_pair(name, &value.to_string());
        }
    }

    Ok(url)
}

/// Returns the first value of the `name` query parameter.
pub fn query_value(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
