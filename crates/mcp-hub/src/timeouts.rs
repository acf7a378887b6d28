//! Adaptive timeout classification.
//!
//! Servers are bucketed by what their name and launch command look like:
//! small utilities answer quickly, database and ML toolkits can take a long
//! time to import and warm up. The bucket decides both the handshake/call
//! timeout and how many times a process spawn is retried.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::{ServerDescriptor, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutCategory {
    Fast,
    Standard,
    Heavy,
}

impl TimeoutCategory {
    pub fn timeout(self) -> Duration {
        match self {
            TimeoutCategory::Fast => Duration::from_secs(15),
            TimeoutCategory::Standard => Duration::from_secs(60),
            TimeoutCategory::Heavy => Duration::from_secs(120),
        }
    }

    /// Upper bound on process spawn attempts, first attempt included.
    pub fn max_connect_attempts(self) -> u32 {
        match self {
            TimeoutCategory::Fast => 2,
            TimeoutCategory::Standard => 3,
            TimeoutCategory::Heavy => 4,
        }
    }

    pub fn classify(descriptor: &ServerDescriptor) -> Self {
        let mut haystack = descriptor.name.clone();
        match &descriptor.transport {
            TransportConfig::Process(process) => {
                haystack.push(' ');
                haystack.push_str(&process.command);
                for arg in &process.args {
                    haystack.push(' ');
                    haystack.push_str(arg);
                }
            }
            TransportConfig::EventStream(config) => {
                haystack.push(' ');
                haystack.push_str(&config.url);
            }
            TransportConfig::Streamable(config) => {
                haystack.push(' ');
                haystack.push_str(&config.url);
            }
        }
        Self::classify_text(&haystack)
    }

    pub fn classify_text(text: &str) -> Self {
        let matches = |pattern: Option<&Regex>| pattern.map_or(false, |p| p.is_match(text));
        if matches(heavy_pattern()) {
            TimeoutCategory::Heavy
        } else if matches(fast_pattern()) {
            TimeoutCategory::Fast
        } else {
            TimeoutCategory::Standard
        }
    }
}

impl std::fmt::Display for TimeoutCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutCategory::Fast => write!(f, "fast"),
            TimeoutCategory::Standard => write!(f, "standard"),
            TimeoutCategory::Heavy => write!(f, "heavy"),
        }
    }
}

// `_` and `-` count as separators so "server-postgres" and "mcp_db" match.
fn heavy_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(^|[^a-z0-9])(postgres(ql)?|mysql|sqlite|mongo(db)?|redis|database|db|sql|pandas|torch|pytorch|tensorflow|jupyter|notebook|ml|spark|bigquery|snowflake|whisper|ocr)([^a-z0-9]|$)",
        )
        .ok()
    })
    .as_ref()
}

fn fast_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(^|[^a-z0-9])(time|echo|fetch|memory|everything|calc|calculator|utils?|sequential-thinking)([^a-z0-9]|$)",
        )
        .ok()
    })
    .as_ref()
}

/// Timeout for a server: the explicit override if present, else its category's.
pub fn effective_timeout(descriptor: &ServerDescriptor, category: TimeoutCategory) -> Duration {
    descriptor
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| category.timeout())
}
