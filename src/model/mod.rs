//! # Vehicle Data Model Capability
//!
//! The bridge does not own the vehicle state tree. It consumes it through the
//! traits in this module: path lookup, recursive enumeration, typed get/set and
//! a change-notification subscription. Anything that implements [`Model`] can
//! be projected onto MQTT.
//!
//! ```text
//! Model ──► get_by_path / get_all_elements ──► Element (attribute | command)
//!   │
//!   └──► subscribe_to_changes ──► ModelObserver::on_model_event(ChangeEvent)
//! ```
//!
//! [`memory::MemoryModel`] is an in-process implementation used by the binary
//! and by the test-suite.

pub mod memory;

pub use memory::{ElementSeed, MemoryElement, MemoryModel, ValueKind};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Polymorphic element value as held by the model.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Enumeration member, carried as its underlying scalar code.
    Enum(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Image(ImageData),
}

impl Value {
    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Plain JSON projection used for whole-tree snapshots.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::None => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) | Value::Enum(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(ts.to_rfc3339()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Image(image) => serde_json::Value::String(image.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::None => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(s) | Value::Enum(s) => f.write_str(s),
            Value::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Value::Image(image) => write!(f, "{}", image),
        }
    }
}

/// Raw RGBA8 picture, e.g. a rendered vehicle image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    /// Row-major RGBA, 4 bytes per pixel.
    pub rgba: Vec<u8>,
}

impl ImageData {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Self {
        Self {
            width,
            height,
            rgba,
        }
    }

    /// Returns the RGBA tuple at (x, y), or `None` outside the buffer.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y as usize) * (self.width as usize) + x as usize) * 4;
        let px = self.rgba.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

impl fmt::Display for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<image {}x{}>", self.width, self.height)
    }
}

/// Unit code such as `celsius` or `km`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Unit(String);

impl Unit {
    pub fn new(code: impl Into<String>) -> Self {
        Unit(code.into())
    }

    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    Attribute,
    Command,
}

/// Argument handed to a command element.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Text(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

/// Change notifications emitted by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeEvent {
    Enabled,
    Disabled,
    ValueChanged,
    /// The element was refreshed but its value did not change.
    Updated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(pub u64);

/// Failure of a value or command setter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SetError {
    /// The supplied value could not be interpreted for this element.
    #[error("{0}")]
    Format(String),

    /// The value was understood but the element refused it.
    #[error("{0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Refresh failed: {0}")]
    Refresh(String),

    #[error("Invalid element definition for {path}: {reason}")]
    InvalidElement { path: String, reason: String },

    #[error("Unknown element: {0}")]
    UnknownElement(String),
}

/// A node of the observed tree.
pub trait Element: Send + Sync {
    /// Absolute path, starting with `/`.
    fn path(&self) -> &str;
    fn kind(&self) -> ElementKind;
    fn value(&self) -> Value;
    fn unit(&self) -> Option<Unit>;
    /// Units accepted by [`Element::set_value`]. Empty when the element has no unit kind.
    fn legal_units(&self) -> Vec<Unit>;
    fn enabled(&self) -> bool;
    fn is_writable(&self) -> bool;
    fn last_updated(&self) -> Option<DateTime<Utc>>;

    /// Smallest significant step of a float value, e.g. `0.1`.
    fn precision(&self) -> Option<f64> {
        None
    }

    /// Value and unit converted for `locale`.
    fn localized(&self, _locale: Option<&str>) -> (Value, Option<Unit>) {
        (self.value(), self.unit())
    }

    fn set_value(&self, value: Value, unit: Option<Unit>) -> Result<(), SetError>;

    fn invoke(&self, _arg: CommandArg) -> Result<(), SetError> {
        Err(SetError::Rejected(format!("{} is not a command", self.path())))
    }
}

pub trait ModelObserver: Send + Sync {
    fn on_model_event(&self, element: &Arc<dyn Element>, event: ChangeEvent);
}

/// The observable vehicle tree.
pub trait Model: Send + Sync {
    fn get_by_path(&self, path: &str) -> Option<Arc<dyn Element>>;

    /// Every element of the tree, recursively.
    fn get_all_elements(&self) -> Vec<Arc<dyn Element>>;

    fn refresh_all(&self) -> Result<(), ModelError>;

    fn subscribe_to_changes(
        &self,
        observer: Arc<dyn ModelObserver>,
        events: &[ChangeEvent],
    ) -> ObserverId;

    fn unsubscribe(&self, id: ObserverId);

    /// Mirrors bridge-owned status (e.g. the connection state) into the tree.
    fn set_status(&self, _path: &str, _value: Value) {}

    fn snapshot_json(&self) -> serde_json::Value {
        let mut tree = serde_json::Map::new();
        for element in self.get_all_elements() {
            if element.enabled() {
                tree.insert(element.path().to_string(), element.value().to_json());
            }
        }
        serde_json::Value::Object(tree)
    }
}
