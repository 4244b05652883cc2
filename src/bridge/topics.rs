//! Topic naming.
//!
//! Element paths map 1:1 onto topic segments below the configured prefix:
//!
//! ```text
//! simple:  <prefix><path>              <prefix><path>_writetopic
//! json:    <prefix><path>_json         <prefix><path>_json_writetopic
//! ```
//!
//! An optional filter regex suppresses topics whose start matches it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const WRITE_SUFFIX: &str = "_writetopic";
pub const JSON_SUFFIX: &str = "_json";
pub const FORCE_UPDATE_PATH: &str = "/carconnectivityForceUpdate";
pub const FULL_JSON_PATH: &str = "/full_json";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TopicFormat {
    #[default]
    Simple,
    /// Values travel in a `{"val", "upd", "uni"}` envelope.
    Json,
}

impl fmt::Display for TopicFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TopicFormat::Simple => f.write_str("simple"),
            TopicFormat::Json => f.write_str("json"),
        }
    }
}

/// Topics produced for one element after filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementTopics {
    pub read: Option<String>,
    pub write: Option<String>,
}

/// Where an inbound topic points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundAddress {
    /// Outside the configured prefix.
    Foreign,
    /// A `_writetopic`; carries the element path.
    Write(String),
    /// A read topic; carries the element path.
    Read(String),
}

#[derive(Debug, Clone)]
pub struct TopicNamer {
    prefix: String,
    plugin_id: String,
    format: TopicFormat,
    filter: Option<Regex>,
}

impl TopicNamer {
    pub fn new(
        prefix: impl Into<String>,
        plugin_id: impl Into<String>,
        format: TopicFormat,
        filter: Option<Regex>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            plugin_id: plugin_id.into(),
            format,
            filter,
        }
    }

    pub fn format(&self) -> TopicFormat {
        self.format
    }

    pub fn base_topic(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    pub fn read_topic(&self, path: &str) -> String {
        match self.format {
            TopicFormat::Simple => self.base_topic(path),
            TopicFormat::Json => format!("{}{}{}", self.prefix, path, JSON_SUFFIX),
        }
    }

    pub fn write_topic(&self, path: &str) -> String {
        format!("{}{}", self.read_topic(path), WRITE_SUFFIX)
    }

    /// Mirrors a start-anchored regex match.
    pub fn is_filtered(&self, topic: &str) -> bool {
        self.filter
            .as_ref()
            .and_then(|re| re.find(topic))
            .is_some_and(|m| m.start() == 0)
    }

    /// Read and (for writable elements) write topic, minus anything filtered.
    pub fn topics_for(&self, path: &str, writable: bool) -> ElementTopics {
        if self.is_filtered(&self.base_topic(path)) {
            return ElementTopics::default();
        }
        let keep = |topic: String| (!self.is_filtered(&topic)).then_some(topic);
        ElementTopics {
            read: keep(self.read_topic(path)),
            write: if writable {
                keep(self.write_topic(path))
            } else {
                None
            },
        }
    }

    pub fn plugin_path(&self, rest: &str) -> String {
        format!("/plugins/{}/{}", self.plugin_id, rest)
    }

    pub fn plugin_topic(&self, rest: &str) -> String {
        self.base_topic(&self.plugin_path(rest))
    }

    pub fn topics_topic(&self) -> String {
        self.plugin_topic("topics")
    }

    pub fn writeable_topics_topic(&self) -> String {
        self.plugin_topic("writeable_topics")
    }

    pub fn error_code_topic(&self) -> String {
        self.plugin_topic("error/code")
    }

    pub fn error_message_topic(&self) -> String {
        self.plugin_topic("error/message")
    }

    pub fn status_path(&self) -> String {
        self.plugin_path("connection_state")
    }

    pub fn status_topic(&self) -> String {
        self.base_topic(&self.status_path())
    }

    pub fn force_update_topic(&self) -> String {
        self.base_topic(FORCE_UPDATE_PATH)
    }

    pub fn force_update_write_topic(&self) -> String {
        format!("{}{}", self.force_update_topic(), WRITE_SUFFIX)
    }

    pub fn full_json_topic(&self) -> String {
        self.base_topic(FULL_JSON_PATH)
    }

    pub fn resolve(&self, topic: &str) -> InboundAddress {
        let Some(address) = topic.strip_prefix(self.prefix.as_str()) else {
            return InboundAddress::Foreign;
        };
        let Some(rest) = address.strip_suffix(WRITE_SUFFIX) else {
            let path = match self.format {
                TopicFormat::Json => address.strip_suffix(JSON_SUFFIX).unwrap_or(address),
                TopicFormat::Simple => address,
            };
            return InboundAddress::Read(path.to_string());
        };
        match self.format {
            TopicFormat::Simple => InboundAddress::Write(rest.to_string()),
            TopicFormat::Json => match rest.strip_suffix(JSON_SUFFIX) {
                Some(path) => InboundAddress::Write(path.to_string()),
                // Plain write topics do not exist in JSON mode.
                None => InboundAddress::Read(address.to_string()),
            },
        }
    }
}
