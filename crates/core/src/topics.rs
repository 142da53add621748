//! Subscription topics and stream identity
//!
//! A topic is the unified name for a category of market data. A stream is one
//! concrete subscription (topic plus optional subject) and its identity is a
//! deterministic lowercase key, so identical logical subscriptions collide by
//! construction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified subscription category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Full order book depth (snapshot + deltas)
    Depth,
    /// Reduced order book depth (top levels only)
    DepthLight,
    /// Account balance updates
    Balance,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Depth => "depth",
            Topic::DepthLight => "depth_light",
            Topic::Balance => "balance",
        }
    }

    /// Parse a unified topic name
    pub fn parse(s: &str) -> Option<Topic> {
        match s {
            "depth" => Some(Topic::Depth),
            "depth_light" => Some(Topic::DepthLight),
            "balance" => Some(Topic::Balance),
            _ => None,
        }
    }

    /// Whether subscriptions to this topic carry a per-symbol subject
    pub fn requires_subject(&self) -> bool {
        match self {
            Topic::Depth | Topic::DepthLight => true,
            Topic::Balance => false,
        }
    }

    /// Whether this topic produces order book data
    pub fn is_depth(&self) -> bool {
        matches!(self, Topic::Depth | Topic::DepthLight)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deterministic identity of a stream
///
/// Built from the venue wire topic and the optional subject, lowercased:
/// `"depthupdate:btcusdt"` or just `"balance"` for subject-less streams.
/// Two subscriptions to the same logical stream always produce the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(wire_topic: &str, subject: Option<&str>) -> Self {
        let key = match subject {
            Some(subject) => format!("{}:{}", wire_topic, subject),
            None => wire_topic.to_string(),
        };
        StreamKey(key.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
