use url::Url;

use crate::error::{ChatError, Result};

pub fn normalize_url(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

pub fn parse_base_url(input: &str) -> Result<Url> {
    Ok(Url::parse(&normalize_url(input))?)
}

fn root_path(base: &Url) -> &str {
    let trimmed = base.path().trim_end_matches('/');
    trimmed.strip_suffix("/api").unwrap_or(trimmed)
}

/// `{base}/api/`, tolerating a base that already ends in `/api`.
pub fn api_base(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    let path = format!("{}/api/", root_path(base));
    url.set_path(&path);
    Ok(url)
}

pub fn websocket_url(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(ChatError::Config(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("cannot switch {} to {scheme}", base)))?;
    let path = format!("{}/socket/websocket", root_path(base));
    url.set_path(&path);
    Ok(url)
}

pub fn polling_url(base: &Url) -> Result<Url> {
    let mut url = base.clone();
    let path = format!("{}/socket/polling", root_path(base));
    url.set_path(&path);
    url.set_query(None);
    Ok(url)
}
