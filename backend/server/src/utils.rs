use std::fmt;

use axum::{
    body::Bytes,
    http::{HeaderMap, header::CONTENT_TYPE},
};
use serde::Deserialize;

use crate::error::AppError::{self, Validation};

pub const MAX_SLUG_LEN: usize = 512;
pub const MAX_REQUEST_ID_LEN: usize = 128;

const INVALID_SLUG: &str = "slug must start with '/' and not be empty";

/// Site path of a content page. The theme's catalog is unknown here, so any
/// well formed path is accepted.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PageSlug(String);

impl PageSlug {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        if raw.is_empty() || !raw.starts_with('/') {
            return Err(Validation(INVALID_SLUG));
        }

        if raw.len() > MAX_SLUG_LEN {
            return Err(Validation("slug is too long"));
        }

        if raw.chars().any(char::is_control) {
            return Err(Validation("slug contains control characters"));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize, Default)]
pub struct Params {
    pub slug: Option<String>,
    pub limit: Option<String>,
    pub request_id: Option<String>,
}

pub fn query_params(query: Option<&str>) -> Result<Params, AppError> {
    match query {
        Some(query) => serde_urlencoded::from_str(query).map_err(|_| Validation("malformed query")),
        None => Ok(Params::default()),
    }
}

pub fn required_slug(slug: Option<&str>) -> Result<PageSlug, AppError> {
    match slug {
        Some(slug) => PageSlug::parse(slug),
        None => Err(Validation(INVALID_SLUG)),
    }
}

pub fn popular_limit(raw: Option<&str>, default: usize) -> Result<usize, AppError> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(default);
    };

    match raw.parse::<usize>() {
        Ok(limit) if limit > 0 => Ok(limit),
        _ => Err(Validation("limit must be a positive integer")),
    }
}

pub struct ToggleRequest {
    pub slug: PageSlug,
    pub request_id: Option<String>,
}

/// Reads the toggle target from a form or JSON body, falling back to the query string.
pub fn toggle_request(
    headers: &HeaderMap,
    query: Option<&str>,
    body: &Bytes,
) -> Result<ToggleRequest, AppError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    let from_body: Params = if body.is_empty() {
        Params::default()
    } else if content_type == "application/json" {
        serde_json::from_slice(body).map_err(|_| Validation("malformed JSON body"))?
    } else if content_type == "application/x-www-form-urlencoded" {
        serde_urlencoded::from_bytes(body).map_err(|_| Validation("malformed form body"))?
    } else {
        Params::default()
    };

    let from_query = query_params(query)?;

    let slug = from_body
        .slug
        .filter(|slug| !slug.is_empty())
        .or(from_query.slug);
    let request_id = from_body
        .request_id
        .or(from_query.request_id)
        .filter(|id| !id.is_empty());

    if request_id
        .as_ref()
        .is_some_and(|id| id.len() > MAX_REQUEST_ID_LEN)
    {
        return Err(Validation("request_id is too long"));
    }

    Ok(ToggleRequest {
        slug: required_slug(slug.as_deref())?,
        request_id,
    })
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(content_type: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        headers
    }

    #[test]
    fn test_slug_rules() {
        assert!(PageSlug::parse("/posts/hello/").is_ok());
        assert!(PageSlug::parse("/").is_ok());
        assert!(PageSlug::parse("").is_err());
        assert!(PageSlug::parse("posts/hello").is_err());
        assert!(PageSlug::parse("/a\nb").is_err());
        assert!(PageSlug::parse(&format!("/{}", "a".repeat(MAX_SLUG_LEN))).is_err());
    }

    #[test]
    fn test_limit() {
        assert_eq!(popular_limit(None, 10).unwrap(), 10);
        assert_eq!(popular_limit(Some(""), 10).unwrap(), 10);
        assert_eq!(popular_limit(Some("3"), 10).unwrap(), 3);
        assert!(popular_limit(Some("0"), 10).is_err());
        assert!(popular_limit(Some("-1"), 10).is_err());
        assert!(popular_limit(Some("ten"), 10).is_err());
    }

    #[test]
    fn test_query_params() {
        let params = query_params(Some("slug=%2Fposts%2Fa%2F&limit=5")).unwrap();

        assert_eq!(params.slug.as_deref(), Some("/posts/a/"));
        assert_eq!(params.limit.as_deref(), Some("5"));
        assert!(query_params(None).unwrap().slug.is_none());
    }

    #[test]
    fn test_form_body() {
        let body = Bytes::from_static(b"slug=%2Fposts%2Fa%2F&request_id=r1");
        let request = toggle_request(
            &headers("application/x-www-form-urlencoded; charset=UTF-8"),
            None,
            &body,
        )
        .unwrap();

        assert_eq!(request.slug.as_str(), "/posts/a/");
        assert_eq!(request.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_json_body() {
        let body = Bytes::from_static(br#"{"slug": "/posts/b/"}"#);
        let request = toggle_request(&headers("application/json"), None, &body).unwrap();

        assert_eq!(request.slug.as_str(), "/posts/b/");
        assert!(request.request_id.is_none());

        let broken = Bytes::from_static(b"{not json");
        assert!(toggle_request(&headers("application/json"), None, &broken).is_err());
    }

    #[test]
    fn test_query_fallback() {
        let request = toggle_request(&HeaderMap::new(), Some("slug=/posts/c/"), &Bytes::new()).unwrap();

        assert_eq!(request.slug.as_str(), "/posts/c/");
    }

    #[test]
    fn test_missing_slug() {
        let result = toggle_request(&headers("application/json"), None, &Bytes::from_static(b"{}"));

        assert!(matches!(result, Err(Validation(_))));
    }
}
