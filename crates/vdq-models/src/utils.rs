//! URL and object-name sanitising shared by the API and the worker.

use thiserror::Error;
use url::Url;

/// Query parameters that only carry tracking data.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "msclkid",
    "dclid",
    "mc_eid",
];

/// Longest download name (before the `vidf_` prefix).
const MAX_OBJECT_NAME_LEN: usize = 50;

/// Errors that can occur while sanitising a source URL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlError {
    #[error("No URL provided")]
    Empty,

    #[error("Invalid URL: {0}")]
    Invalid(String),
}

/// Result type for URL sanitising.
pub type UrlResult<T> = Result<T, UrlError>;

/// Normalise a submitted source URL into a job key.
///
/// - Defaults the scheme to `https://`
/// - Drops a leading `amp.` host label
/// - Removes tracking query parameters and the fragment
pub fn sanitize_url(raw: &str) -> UrlResult<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(UrlError::Empty);
    }

    let lower = raw.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| UrlError::Invalid(e.to_string()))?;

    let stripped_host = url
        .host_str()
        .and_then(|host| host.strip_prefix("amp."))
        .map(str::to_string);
    if let Some(host) = stripped_host {
        url.set_host(Some(&host))
            .map_err(|e| UrlError::Invalid(e.to_string()))?;
    }

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !TRACKING_PARAMS.contains(&name.as_ref()))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept.iter());
        }
    }

    url.set_fragment(None);
    Ok(url.to_string())
}

/// Make a storage-safe, length-limited file name.
///
/// Anything outside `[A-Za-z0-9._-]` becomes `_`; names longer than 50
/// characters are cut while keeping the extension. The result is prefixed
/// with `vidf_`.
pub fn sanitize_object_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.len() > MAX_OBJECT_NAME_LEN {
        let (stem, ext) = match sanitized.rfind('.') {
            Some(idx) if idx > 0 => sanitized.split_at(idx),
            _ => (sanitized.as_str(), ""),
        };
        let keep = MAX_OBJECT_NAME_LEN.saturating_sub(ext.len());
        sanitized = format!("{}{}", &stem[..keep.min(stem.len())], ext);
    }

    format!("vidf_{}", sanitized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_url_defaults_scheme_and_drops_tracking() {
        assert_eq!(
            sanitize_url("x.com/a?utm_source=z&id=1#frag").unwrap(),
            "https://x.com/a?id=1"
        );
    }

    #[test]
    fn test_sanitize_url_drops_amp_host() {
        assert_eq!(
            sanitize_url("https://amp.example.com/story").unwrap(),
            "https://example.com/story"
        );
    }

    #[test]
    fn test_sanitize_url_removes_empty_query() {
        assert_eq!(
            sanitize_url("http://example.com/v?fbclid=abc&gclid=def").unwrap(),
            "http://example.com/v"
        );
    }

    #[test]
    fn test_sanitize_url_keeps_regular_params() {
        assert_eq!(
            sanitize_url("https://www.youtube.com/watch?v=dQw4w9WgXcQ").unwrap(),
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ"
        );
    }

    #[test]
    fn test_sanitize_url_rejects_empty_and_garbage() {
        assert_eq!(sanitize_url("   "), Err(UrlError::Empty));
        assert!(matches!(sanitize_url("https://exa mple.com"), Err(UrlError::Invalid(_))));
    }

    #[test]
    fn test_sanitize_object_name_replaces_unsafe_chars() {
        assert_eq!(sanitize_object_name("a b/c?.mp4"), "vidf_a_b_c_.mp4");
    }

    #[test]
    fn test_sanitize_object_name_truncates_keeping_extension() {
        let long = format!("{}.mp4", "x".repeat(80));
        let name = sanitize_object_name(&long);

        assert_eq!(name.len(), "vidf_".len() + 50);
        assert!(name.ends_with("x.mp4"));
    }
}
