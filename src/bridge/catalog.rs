//! Advertised topic sets.
//!
//! Two sorted sets (read topics, writable topics) with one dirty flag each.
//! The periodic flush publishes only the sets that changed.

use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Changed sets since the previous snapshot. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSnapshot {
    pub read_topics: Option<Vec<String>>,
    pub writable_topics: Option<Vec<String>>,
}

impl CatalogSnapshot {
    pub fn is_empty(&self) -> bool {
        self.read_topics.is_none() && self.writable_topics.is_none()
    }
}

/// Wire payload of a catalog topic.
pub fn join_topics(topics: &[String]) -> String {
    topics.join(",\n")
}

#[derive(Debug, Default)]
struct CatalogState {
    read: BTreeSet<String>,
    writable: BTreeSet<String>,
    read_dirty: bool,
    writable_dirty: bool,
}

#[derive(Debug)]
pub struct TopicCatalog {
    state: Mutex<CatalogState>,
    topics_topic: String,
    writeable_topics_topic: String,
}

impl TopicCatalog {
    /// `topics_topic` and `writeable_topics_topic` are the announcement topics.
    pub fn new(topics_topic: impl Into<String>, writeable_topics_topic: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
            topics_topic: topics_topic.into(),
            writeable_topics_topic: writeable_topics_topic.into(),
        }
    }

    pub fn topics_topic(&self) -> &str {
        &self.topics_topic
    }

    pub fn writeable_topics_topic(&self) -> &str {
        &self.writeable_topics_topic
    }

    /// Returns `true` if the topic was new to its set.
    pub fn add(&self, topic: &str, writable: bool) -> bool {
        let mut state = self.state.lock();
        if writable {
            if state.writable.insert(topic.to_string()) {
                state.writable_dirty = true;
                return true;
            }
        } else if state.read.insert(topic.to_string()) {
            state.read_dirty = true;
            return true;
        }
        false
    }

    pub fn contains(&self, topic: &str, writable: bool) -> bool {
        let state = self.state.lock();
        if writable {
            state.writable.contains(topic)
        } else {
            state.read.contains(topic)
        }
    }

    pub fn writable_topics(&self) -> Vec<String> {
        self.state.lock().writable.iter().cloned().collect()
    }

    /// Returns the changed sets and clears their dirty flags.
    ///
    /// `allow` decides per announcement topic whether it may describe itself;
    /// filtered announcement topics are left out of the read set.
    pub fn snapshot_if_changed(&self, allow: impl Fn(&str) -> bool) -> CatalogSnapshot {
        let mut state = self.state.lock();
        let mut snapshot = CatalogSnapshot::default();

        if state.writable_dirty {
            if allow(&self.writeable_topics_topic)
                && state.read.insert(self.writeable_topics_topic.clone())
            {
                state.read_dirty = true;
            }
            snapshot.writable_topics = Some(state.writable.iter().cloned().collect());
            state.writable_dirty = false;
        }
        if state.read_dirty {
            if allow(&self.topics_topic) {
                state.read.insert(self.topics_topic.clone());
            }
            snapshot.read_topics = Some(state.read.iter().cloned().collect());
            state.read_dirty = false;
        }
        snapshot
    }
}
