use url::Url;

use crate::error::SyncError;

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// The realtime endpoint on the same host as the REST server.
pub fn socket_url(base_url: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(&normalize_url(base_url))
        .map_err(|e| SyncError::Config(format!("invalid server url {:?}: {}", base_url, e)))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::Config(format!("cannot derive socket url from {:?}", base_url)))?;
    Ok(url)
}
