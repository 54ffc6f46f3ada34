//! Extracts the URL and headers from a "Copy as cURL" command.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use url::Url;

use crate::error::CurlError;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0";

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"curl\s+(?:'([^']*)'|"([^"]*)"|(\S+))"#).unwrap());

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:-H|--header)\s+(?:'([^']*)'|"([^"]*)")"#).unwrap()
});

#[derive(Debug, Clone)]
pub struct CurlInput {
    pub url: String,
    pub headers: HeaderMap,
}

pub fn parse_curl_command(raw: &str) -> Result<CurlInput, CurlError> {
    let captures = URL_RE.captures(raw).ok_or(CurlError::MissingUrl)?;
    let url = (1..=3)
        .filter_map(|i| captures.get(i))
        .map(|m| m.as_str())
        .find(|s| !s.is_empty())
        .ok_or(CurlError::MissingUrl)?;
    Url::parse(url).map_err(|source| CurlError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;

    let mut headers = HeaderMap::new();
    for captures in HEADER_RE.captures_iter(raw) {
        let Some(line) = captures.get(1).or_else(|| captures.get(2)) else {
            continue;
        };
        let Some((name, value)) = line.as_str().split_once(':') else {
            continue;
        };
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| CurlError::InvalidHeader(line.as_str().to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| CurlError::InvalidHeader(line.as_str().to_string()))?;
        headers.insert(name, value);
    }

    if !headers.contains_key(USER_AGENT) {
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }

    Ok(CurlInput {
        url: url.to_string(),
        headers,
    })
}

/// Join pasted lines into one command, dropping trailing `\` continuations.
///
/// Input ends at the first blank line.
pub fn join_command_lines<'a, I>(lines: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parts = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        parts.push(line.strip_suffix('\\').unwrap_or(line).trim());
    }
    parts.join(" ")
}
