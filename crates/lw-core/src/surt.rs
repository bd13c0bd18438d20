//! SURT canonicalization for rule lookup
//!
//! A SURT (Sort-friendly URL Reordering Transform) key reverses the host
//! labels so that rules for a domain and all of its subdomains sort together.
//! Hosts that do not already start with `www.` get a trailing `www` label so
//! both spellings of a site share one key space.
//!
//! Two suffix conventions are in use by the rule service:
//!
//! - [`to_surt_exact`]: `(com,example,cdn,www)/a.js?v=1` identifies one resource.
//! - [`to_surt_prefix`]: `com,example,cdn,www)/%` is a wildcard over a host.
//!
//! Replay URLs are unwrapped first, so the key always describes the archived
//! original rather than the replay server. Failures are reported as
//! [`UrlError::InvalidUrl`]; the raw input is never returned as a key.

use crate::replay::ReplayUrl;
use crate::url::{extract_path, extract_query, parse_hostname, BoundaryPrefixes, UrlError};

/// The URL the key should describe: the wrapped original for replay URLs,
/// otherwise `url` itself.
#[inline]
pub fn surt_subject<'a>(url: &'a str, prefixes: &'a BoundaryPrefixes) -> &'a str {
    match ReplayUrl::parse(url, prefixes) {
        Some(replay) => replay.original,
        None => url,
    }
}

/// Reverse the host labels, appending `www` unless the host starts with it.
fn reversed_host(host: &str) -> String {
    let mut out = String::with_capacity(host.len() + 4);
    for (i, label) in host.rsplit('.').enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(label);
    }
    if !host.starts_with("www.") {
        out.push_str(",www");
    }
    out
}

/// Exact-resource key: `(` + reversed host + `)` + path + query.
pub fn to_surt_exact(url: &str, prefixes: &BoundaryPrefixes) -> Result<String, UrlError> {
    let subject = surt_subject(url, prefixes);
    let host = parse_hostname(subject)?;
    let path = extract_path(subject);
    let query = extract_query(subject);

    let labels = reversed_host(&host);
    let mut key = String::with_capacity(labels.len() + 2 + path.len() + query.len());
    key.push('(');
    key.push_str(&labels);
    key.push(')');
    key.push_str(path);
    key.push_str(query);
    Ok(key)
}

/// Host-wildcard key: reversed host + `)/%`.
pub fn to_surt_prefix(url: &str, prefixes: &BoundaryPrefixes) -> Result<String, UrlError> {
    let subject = surt_subject(url, prefixes);
    let host = parse_hostname(subject)?;
    let mut key = reversed_host(&host);
    key.push_str(")/%");
    Ok(key)
}
