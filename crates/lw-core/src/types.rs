//! Core type definitions for LeakWatch
//!
//! These types are shared between the engine, the CLI and persisted state.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// =============================================================================
// Session Identity
// =============================================================================

/// Opaque identifier of a monitored session (one per browser tab).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub i32);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for SessionId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

// =============================================================================
// Boundary Classification
// =============================================================================

/// Result of classifying a URL against the replay boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    /// URL is served from one of the replay prefixes
    InBoundary,
    /// URL escaped the replay (a leak when fetched by a monitored page)
    OutOfBoundary,
}

impl Boundary {
    #[inline]
    pub fn is_leak(self) -> bool {
        self == Self::OutOfBoundary
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InBoundary => "in-boundary",
            Self::OutOfBoundary => "out-of-boundary",
        }
    }
}

// =============================================================================
// Resource Types (bit mask for request types)
// =============================================================================

bitflags::bitflags! {
    /// Browser resource type bit mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ResourceType: u32 {
        const OTHER = 1 << 0;
        const SCRIPT = 1 << 1;
        const IMAGE = 1 << 2;
        const STYLESHEET = 1 << 3;
        const OBJECT = 1 << 4;
        const SUBDOCUMENT = 1 << 5;  // iframe/frame
        const MAIN_FRAME = 1 << 6;   // main document
        const XMLHTTPREQUEST = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const FONT = 1 << 9;
        const MEDIA = 1 << 10;
        const PING = 1 << 11;
        const CSP_REPORT = 1 << 12;

        /// Document types (main_frame + sub_frame)
        const DOCUMENT = Self::MAIN_FRAME.bits() | Self::SUBDOCUMENT.bits();
    }
}

impl ResourceType {
    /// Parse from browser resource type string.
    pub fn from_str(s: &str) -> Self {
        match s {
            "main_frame" | "document" => Self::MAIN_FRAME,
            "sub_frame" => Self::SUBDOCUMENT,
            "stylesheet" => Self::STYLESHEET,
            "script" => Self::SCRIPT,
            "image" | "img" => Self::IMAGE,
            "font" => Self::FONT,
            "object" => Self::OBJECT,
            "xmlhttprequest" | "fetch" => Self::XMLHTTPREQUEST,
            "ping" => Self::PING,
            "csp_report" => Self::CSP_REPORT,
            "media" => Self::MEDIA,
            "websocket" => Self::WEBSOCKET,
            _ => Self::OTHER,
        }
    }

    /// Browser name of a single resource type.
    /// Combined masks report as `other`.
    pub fn as_str(self) -> &'static str {
        if self == Self::MAIN_FRAME {
            "main_frame"
        } else if self == Self::SUBDOCUMENT {
            "sub_frame"
        } else if self == Self::STYLESHEET {
            "stylesheet"
        } else if self == Self::SCRIPT {
            "script"
        } else if self == Self::IMAGE {
            "image"
        } else if self == Self::FONT {
            "font"
        } else if self == Self::OBJECT {
            "object"
        } else if self == Self::XMLHTTPREQUEST {
            "xmlhttprequest"
        } else if self == Self::PING {
            "ping"
        } else if self == Self::CSP_REPORT {
            "csp_report"
        } else if self == Self::MEDIA {
            "media"
        } else if self == Self::WEBSOCKET {
            "websocket"
        } else {
            "other"
        }
    }
}

impl Default for ResourceType {
    fn default() -> Self {
        Self::OTHER
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from_str(&s))
    }
}
