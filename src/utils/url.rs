//! URL helpers shared by the model client, the session bootstrap and the
//! validator.

/// Strip trailing slashes so endpoint joins never produce `//`.
///
/// ```
/// use pagepilot::utils::url::normalize_base_url;
///
/// assert_eq!(
///     normalize_base_url("https://generativelanguage.googleapis.com/v1beta///"),
///     "https://generativelanguage.googleapis.com/v1beta"
/// );
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Join a base URL and an endpoint path with exactly one slash.
///
/// ```
/// use pagepilot::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://example.com/v1beta/", "/models/gemini:streamGenerateContent"),
///     "https://example.com/v1beta/models/gemini:streamGenerateContent"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{}/{}", normalized_base, endpoint)
}

/// Parse an absolute `http`/`https` URL with a host.
///
/// The error is a short phrase suitable for a validation message.
pub fn parse_absolute_http_url(raw: &str) -> Result<reqwest::Url, String> {
    let url = reqwest::Url::parse(raw).map_err(|err| format!("is not an absolute URL ({err})"))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(format!("uses unsupported scheme {other}")),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err("has no host".to_string());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_api_url_joins_without_double_slashes() {
        assert_eq!(
            construct_api_url("https://api.example.com/v1beta", "models/x:generate"),
            "https://api.example.com/v1beta/models/x:generate"
        );
        assert_eq!(
            construct_api_url("https://api.example.com/v1beta//", "//models/x:generate"),
            "https://api.example.com/v1beta/models/x:generate"
        );
    }

    #[test]
    fn parse_absolute_http_url_accepts_http_and_https() {
        assert!(parse_absolute_http_url("https://mcp.example.com/s/abc").is_ok());
        assert!(parse_absolute_http_url("http://localhost:8080/mcp").is_ok());
    }

    #[test]
    fn parse_absolute_http_url_rejects_relative_and_foreign_schemes() {
        assert!(parse_absolute_http_url("/relative/path")
            .unwrap_err()
            .starts_with("is not an absolute URL"));
        assert_eq!(
            parse_absolute_http_url("ftp://files.example.com/x").unwrap_err(),
            "uses unsupported scheme ftp"
        );
        assert!(parse_absolute_http_url("not a url").is_err());
    }
}
