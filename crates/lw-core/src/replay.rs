//! Replay-wrapper URL parsing
//!
//! A replay URL wraps an original URL behind a boundary prefix and one or two
//! numeric path segments:
//!
//! ```text
//! https://wayback.archive-it.org/20/1/https://cdn.example.com/a.js
//! |------------ prefix -----------|c |t|------- original --------|
//! ```
//!
//! The last numeric segment is the capture timestamp, which may carry a replay
//! modifier suffix such as `id_` or `js_`. A leading extra segment is the
//! collection id.

use crate::url::{has_http_scheme, BoundaryPrefixes};

/// Borrowed view of a decomposed replay URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayUrl<'a> {
    pub prefix: &'a str,
    pub collection: Option<&'a str>,
    pub timestamp: &'a str,
    pub original: &'a str,
}

impl<'a> ReplayUrl<'a> {
    /// Decompose `url` if it is a replay URL under one of `prefixes`.
    pub fn parse(url: &'a str, prefixes: &'a BoundaryPrefixes) -> Option<Self> {
        let prefix = prefixes.matching_prefix(url)?;
        let rest = &url[prefix.len()..];

        let (first, rest) = split_segment(rest)?;
        if has_http_scheme(rest) {
            if !is_timestamp(first) {
                return None;
            }
            return Some(Self {
                prefix,
                collection: None,
                timestamp: first,
                original: rest,
            });
        }

        let (second, rest) = split_segment(rest)?;
        if has_http_scheme(rest) && is_digits(first) && is_timestamp(second) {
            return Some(Self {
                prefix,
                collection: Some(first),
                timestamp: second,
                original: rest,
            });
        }

        None
    }

    /// Rebuild a replay URL for `original`.
    pub fn compose(prefix: &str, collection: Option<&str>, timestamp: &str, original: &str) -> String {
        let mut out = String::with_capacity(
            prefix.len() + collection.map_or(0, |c| c.len() + 1) + timestamp.len() + 1 + original.len(),
        );
        out.push_str(prefix);
        if let Some(collection) = collection {
            out.push_str(collection);
            out.push('/');
        }
        out.push_str(timestamp);
        out.push('/');
        out.push_str(original);
        out
    }

    /// Same capture, different original resource.
    pub fn rewrite(&self, original: &str) -> String {
        Self::compose(self.prefix, self.collection, self.timestamp, original)
    }
}

fn split_segment(s: &str) -> Option<(&str, &str)> {
    let slash = s.find('/')?;
    if slash == 0 {
        return None;
    }
    Some((&s[..slash], &s[slash + 1..]))
}

#[inline]
fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// Digits, optionally followed by a two-letter replay modifier (`id_`, `js_`, ...).
fn is_timestamp(s: &str) -> bool {
    let digits_end = s.bytes().position(|b| !b.is_ascii_digit()).unwrap_or(s.len());
    if digits_end == 0 {
        return false;
    }
    let modifier = &s.as_bytes()[digits_end..];
    modifier.is_empty()
        || (modifier.len() == 3
            && modifier[0].is_ascii_lowercase()
            && modifier[1].is_ascii_lowercase()
            && modifier[2] == b'_')
}
