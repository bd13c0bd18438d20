//! Fast URL slicing and boundary classification
//!
//! These functions avoid allocations and work directly on string slices.
//! Classification is a strict, case-sensitive prefix test: no scheme or
//! trailing-slash normalization is applied.

use crate::types::Boundary;

/// Error type for URL handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UrlError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

// =============================================================================
// Boundary Prefixes
// =============================================================================

/// The set of replay prefixes that define the archival boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BoundaryPrefixes {
    prefixes: Vec<String>,
}

impl BoundaryPrefixes {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    /// Return the configured prefix `url` starts with, if any.
    #[inline]
    pub fn matching_prefix(&self, url: &str) -> Option<&str> {
        self.iter().find(|prefix| url.starts_with(*prefix))
    }
}

/// Classify a URL against the replay boundary.
///
/// `InBoundary` iff `url` is non-empty and starts with one of the prefixes
/// (exact byte comparison).
#[inline]
pub fn classify(url: &str, prefixes: &BoundaryPrefixes) -> Boundary {
    if url.is_empty() {
        return Boundary::OutOfBoundary;
    }
    match prefixes.matching_prefix(url) {
        Some(_) => Boundary::InBoundary,
        None => Boundary::OutOfBoundary,
    }
}

// =============================================================================
// Scheme Extraction
// =============================================================================

/// Get the position after "://".
#[inline]
pub fn get_scheme_end(url: &str) -> Option<usize> {
    let bytes = url.as_bytes();

    // Find ':'
    let colon_pos = bytes.iter().position(|&b| b == b':')?;
    if colon_pos == 0 || !is_valid_scheme(&bytes[..colon_pos]) {
        return None;
    }

    // Check for "://"
    if bytes.len() > colon_pos + 2
        && bytes[colon_pos + 1] == b'/'
        && bytes[colon_pos + 2] == b'/'
    {
        return Some(colon_pos + 3);
    }

    None
}

fn is_valid_scheme(scheme: &[u8]) -> bool {
    scheme[0].is_ascii_alphabetic()
        && scheme
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
}

/// Check whether a URL starts with `http://` or `https://` (case-insensitive).
#[inline]
pub fn has_http_scheme(url: &str) -> bool {
    let bytes = url.as_bytes();
    (bytes.len() >= 8 && bytes[..8].eq_ignore_ascii_case(b"https://"))
        || (bytes.len() >= 7 && bytes[..7].eq_ignore_ascii_case(b"http://"))
}

// =============================================================================
// Host Extraction
// =============================================================================

/// Get the start and end positions of the hostname in a URL.
#[inline]
pub fn get_host_position(url: &str) -> Option<(usize, usize)> {
    let scheme_end = get_scheme_end(url)?;
    let bytes = url.as_bytes();

    // Authority ends at the first of '/', '?', '#'
    let mut authority_end = bytes.len();
    for i in scheme_end..bytes.len() {
        let b = bytes[i];
        if b == b'/' || b == b'?' || b == b'#' {
            authority_end = i;
            break;
        }
    }

    // Skip userinfo
    let mut host_start = scheme_end;
    for i in (scheme_end..authority_end).rev() {
        if bytes[i] == b'@' {
            host_start = i + 1;
            break;
        }
    }

    // Bracketed IPv6 literal keeps its colons
    if bytes.get(host_start) == Some(&b'[') {
        let close = bytes[host_start..authority_end].iter().position(|&b| b == b']')?;
        return Some((host_start, host_start + close + 1));
    }

    let mut host_end = authority_end;
    for i in host_start..authority_end {
        if bytes[i] == b':' {
            host_end = i;
            break;
        }
    }

    Some((host_start, host_end))
}

/// Fast host extraction without allocations.
/// Returns a slice into the original URL.
#[inline]
pub fn extract_host(url: &str) -> Option<&str> {
    let (host_start, host_end) = get_host_position(url)?;
    Some(&url[host_start..host_end])
}

/// Extract and validate the hostname, lowercased.
///
/// Fails when the URL has no `scheme://` authority, the host is empty, or the
/// host contains characters that cannot appear in a hostname.
pub fn parse_hostname(url: &str) -> Result<String, UrlError> {
    let host = extract_host(url).ok_or_else(|| UrlError::InvalidUrl(url.to_string()))?;
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() || !is_valid_host(host) {
        return Err(UrlError::InvalidUrl(url.to_string()));
    }
    Ok(host.to_ascii_lowercase())
}

fn is_valid_host(host: &str) -> bool {
    let bytes = host.as_bytes();
    if bytes[0] == b'[' {
        return bytes.len() > 2
            && bytes[bytes.len() - 1] == b']'
            && bytes[1..bytes.len() - 1]
                .iter()
                .all(|&b| b.is_ascii_hexdigit() || b == b':' || b == b'.');
    }
    if host.split('.').any(str::is_empty) {
        return false;
    }
    bytes
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b >= 0x80)
}

// =============================================================================
// Path Extraction
// =============================================================================

fn path_start(url: &str) -> Option<usize> {
    let (_, host_end) = get_host_position(url)?;
    let bytes = url.as_bytes();
    for (i, &b) in bytes[host_end..].iter().enumerate() {
        if b == b'/' || b == b'?' || b == b'#' {
            return Some(host_end + i);
        }
    }
    None
}

/// Extract the path portion of a URL.
#[inline]
pub fn extract_path(url: &str) -> &str {
    let start = match path_start(url) {
        Some(pos) if url.as_bytes()[pos] == b'/' => pos,
        _ => return "/",
    };

    let bytes = url.as_bytes();
    let mut path_end = bytes.len();
    for (i, &b) in bytes[start..].iter().enumerate() {
        if b == b'?' || b == b'#' {
            path_end = start + i;
            break;
        }
    }

    &url[start..path_end]
}

/// Extract the query string including its leading `?`, or `""`.
/// An empty query (`?` followed by nothing) yields `""`.
#[inline]
pub fn extract_query(url: &str) -> &str {
    let start = match path_start(url) {
        Some(pos) => pos,
        None => return "",
    };
    let rest = &url[start..];
    let rest = match rest.find('#') {
        Some(hash_pos) => &rest[..hash_pos],
        None => rest,
    };
    match rest.find('?') {
        Some(q_pos) if q_pos + 1 < rest.len() => &rest[q_pos..],
        _ => "",
    }
}
