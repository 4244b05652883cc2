//! In-memory observable tree.
//!
//! Elements live in a path-ordered map. Every mutation goes through the owning
//! element so that observers are notified exactly once per change, after all
//! element locks have been released.

use super::{
    ChangeEvent, CommandArg, Element, ElementKind, Model, ModelError, ModelObserver, ObserverId,
    SetError, Unit, Value,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Scalar type an element stores; drives parsing of textual writes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Text,
    Int,
    Float,
    Bool,
    Enum,
    Timestamp,
}

/// Declarative element definition, also readable from the `[[elements]]`
/// tables of the configuration file.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct ElementSeed {
    pub path: String,
    #[serde(default)]
    pub value_type: ValueKind,
    /// Legal members for enum elements, accepted arguments for commands.
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub command: bool,
    #[serde(default)]
    pub writable: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub units: Vec<String>,
    #[serde(default)]
    pub precision: Option<f64>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub initial: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ElementSeed {
    pub fn attribute(path: impl Into<String>, value_type: ValueKind) -> Self {
        Self {
            path: path.into(),
            value_type,
            enabled: true,
            ..Self::default()
        }
    }

    pub fn command(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            command: true,
            writable: true,
            enabled: true,
            ..Self::default()
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_members(mut self, members: &[&str]) -> Self {
        self.members = members.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn with_unit(mut self, unit: &str, legal: &[&str]) -> Self {
        self.unit = Some(unit.to_string());
        self.units = legal.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = Some(precision);
        self
    }

    pub fn with_initial(mut self, initial: impl Into<String>) -> Self {
        self.initial = Some(initial.into());
        self
    }
}

type ObserverEntry = (ObserverId, Arc<dyn ModelObserver>, Vec<ChangeEvent>);

#[derive(Default)]
struct Notifier {
    next_id: AtomicU64,
    observers: Mutex<Vec<ObserverEntry>>,
}

impl Notifier {
    fn notify(&self, element: &Arc<dyn Element>, event: ChangeEvent) {
        let targets: Vec<Arc<dyn ModelObserver>> = self
            .observers
            .lock()
            .iter()
            .filter(|(_, _, events)| events.contains(&event))
            .map(|(_, observer, _)| observer.clone())
            .collect();
        for observer in targets {
            observer.on_model_event(element, event);
        }
    }
}

#[derive(Debug)]
struct ElementState {
    value: Value,
    unit: Option<Unit>,
    enabled: bool,
    last_updated: Option<DateTime<Utc>>,
}

pub struct MemoryElement {
    path: String,
    kind: ElementKind,
    value_kind: ValueKind,
    members: Vec<String>,
    writable: bool,
    legal_units: Vec<Unit>,
    precision: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    state: Mutex<ElementState>,
    invocations: Mutex<Vec<CommandArg>>,
    notifier: Weak<Notifier>,
    this: Weak<MemoryElement>,
}

impl MemoryElement {
    fn from_seed(seed: ElementSeed, notifier: Weak<Notifier>) -> Result<Arc<Self>, ModelError> {
        let invalid = |reason: &str| ModelError::InvalidElement {
            path: seed.path.clone(),
            reason: reason.to_string(),
        };
        if !seed.path.starts_with('/') || seed.path.len() < 2 {
            return Err(invalid("path must be absolute"));
        }
        if seed.value_type == ValueKind::Enum && seed.members.is_empty() && !seed.command {
            return Err(invalid("enum elements need at least one member"));
        }

        let mut legal_units: Vec<Unit> = seed.units.iter().map(Unit::new).collect();
        let unit = seed.unit.as_deref().map(Unit::new);
        if let Some(unit) = &unit {
            if legal_units.is_empty() {
                legal_units.push(unit.clone());
            } else if !legal_units.contains(unit) {
                return Err(invalid("unit is not among the legal units"));
            }
        }

        let kind = if seed.command {
            ElementKind::Command
        } else {
            ElementKind::Attribute
        };

        let element = Arc::new_cyclic(|this| MemoryElement {
            path: seed.path.clone(),
            kind,
            value_kind: seed.value_type,
            members: seed.members.clone(),
            writable: seed.writable || seed.command,
            legal_units,
            precision: seed.precision,
            min: seed.min,
            max: seed.max,
            state: Mutex::new(ElementState {
                value: Value::None,
                unit,
                enabled: seed.enabled,
                last_updated: None,
            }),
            invocations: Mutex::new(Vec::new()),
            notifier,
            this: this.clone(),
        });

        if let Some(initial) = &seed.initial {
            let value = element
                .coerce(Value::Str(initial.clone()))
                .map_err(|e| invalid(&e.to_string()))?;
            let mut state = element.state.lock();
            state.value = value;
            state.last_updated = Some(Utc::now());
        }
        Ok(element)
    }

    /// Arguments this command has been invoked with, oldest first.
    pub fn invocations(&self) -> Vec<CommandArg> {
        self.invocations.lock().clone()
    }

    fn notify(&self, event: ChangeEvent) {
        if let (Some(notifier), Some(me)) = (self.notifier.upgrade(), self.this.upgrade()) {
            let element: Arc<dyn Element> = me;
            notifier.notify(&element, event);
        }
    }

    fn parse_text(&self, text: &str) -> Result<Value, SetError> {
        let trimmed = text.trim();
        match self.value_kind {
            ValueKind::Text => Ok(Value::Str(text.to_string())),
            ValueKind::Int => trimmed
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| SetError::Format(format!("'{}' is not an integer", text))),
            ValueKind::Float => trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .map(Value::Float)
                .ok_or_else(|| SetError::Format(format!("'{}' is not a number", text))),
            ValueKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "off" => Ok(Value::Bool(false)),
                _ => Err(SetError::Format(format!("'{}' is not a boolean", text))),
            },
            ValueKind::Enum => self.member(trimmed),
            ValueKind::Timestamp => DateTime::parse_from_rfc3339(trimmed)
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|e| SetError::Format(format!("'{}' is not a timestamp: {}", text, e))),
        }
    }

    fn member(&self, candidate: &str) -> Result<Value, SetError> {
        if self.members.iter().any(|m| m == candidate) {
            Ok(Value::Enum(candidate.to_string()))
        } else {
            Err(SetError::Format(format!(
                "'{}' is not one of [{}]",
                candidate,
                self.members.join(", ")
            )))
        }
    }

    fn coerce(&self, value: Value) -> Result<Value, SetError> {
        let coerced = match (self.value_kind, value) {
            (_, Value::None) => Value::None,
            (_, Value::Str(text)) => self.parse_text(&text)?,
            (ValueKind::Int, Value::Int(i)) => Value::Int(i),
            (ValueKind::Int, Value::Float(f)) if f.fract() == 0.0 => Value::Int(f as i64),
            (ValueKind::Float, Value::Int(i)) => Value::Float(i as f64),
            (ValueKind::Float, Value::Float(f)) => Value::Float(f),
            (ValueKind::Bool, Value::Bool(b)) => Value::Bool(b),
            (ValueKind::Enum, Value::Enum(member)) => self.member(&member)?,
            (ValueKind::Timestamp, Value::Timestamp(ts)) => Value::Timestamp(ts),
            (ValueKind::Text, other @ (Value::Int(_) | Value::Float(_) | Value::Bool(_))) => {
                Value::Str(other.to_string())
            }
            (kind, other) => {
                return Err(SetError::Format(format!(
                    "cannot assign {:?} to a {:?} element",
                    other, kind
                )))
            }
        };

        let numeric = match &coerced {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        };
        if let Some(n) = numeric {
            if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
                return Err(SetError::Rejected(format!(
                    "{} is outside the allowed range {}..={}",
                    n,
                    self.min.unwrap_or(f64::NEG_INFINITY),
                    self.max.unwrap_or(f64::INFINITY)
                )));
            }
        }
        Ok(coerced)
    }

    /// Stores a new value and reports which event it amounts to.
    fn store(&self, value: Value, unit: Option<Unit>) -> ChangeEvent {
        let mut state = self.state.lock();
        let changed = state.value != value || (unit.is_some() && state.unit != unit);
        state.value = value;
        if unit.is_some() {
            state.unit = unit;
        }
        state.last_updated = Some(Utc::now());
        if changed {
            ChangeEvent::ValueChanged
        } else {
            ChangeEvent::Updated
        }
    }

    /// Vehicle-side update; bypasses the writable check.
    fn update(&self, value: Value) -> Result<(), SetError> {
        let value = self.coerce(value)?;
        let event = self.store(value, None);
        self.notify(event);
        Ok(())
    }

    fn set_enabled(&self, enabled: bool) {
        let transitioned = {
            let mut state = self.state.lock();
            let transitioned = state.enabled != enabled;
            state.enabled = enabled;
            transitioned
        };
        if transitioned {
            self.notify(if enabled {
                ChangeEvent::Enabled
            } else {
                ChangeEvent::Disabled
            });
        }
    }
}

impl Element for MemoryElement {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> ElementKind {
        self.kind
    }

    fn value(&self) -> Value {
        self.state.lock().value.clone()
    }

    fn unit(&self) -> Option<Unit> {
        self.state.lock().unit.clone()
    }

    fn legal_units(&self) -> Vec<Unit> {
        self.legal_units.clone()
    }

    fn enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.lock().last_updated
    }

    fn precision(&self) -> Option<f64> {
        self.precision
    }

    fn set_value(&self, value: Value, unit: Option<Unit>) -> Result<(), SetError> {
        if self.kind == ElementKind::Command {
            return Err(SetError::Rejected(format!(
                "{} is a command, invoke it instead",
                self.path
            )));
        }
        if !self.writable {
            return Err(SetError::Rejected(format!("{} is read-only", self.path)));
        }
        if let Some(unit) = &unit {
            if !self.legal_units.contains(unit) {
                return Err(SetError::Format(format!(
                    "unit '{}' is not valid for {}",
                    unit, self.path
                )));
            }
        }
        let value = self.coerce(value)?;
        debug!("{} set to {:?}", self.path, value);
        let event = self.store(value, unit);
        self.notify(event);
        Ok(())
    }

    fn invoke(&self, arg: CommandArg) -> Result<(), SetError> {
        if self.kind != ElementKind::Command {
            return Err(SetError::Rejected(format!("{} is not a command", self.path)));
        }
        if !self.enabled() {
            return Err(SetError::Rejected(format!("{} is disabled", self.path)));
        }
        if let CommandArg::Text(text) = &arg {
            if !self.members.is_empty() && !self.members.iter().any(|m| m == text.trim()) {
                return Err(SetError::Format(format!(
                    "'{}' is not one of [{}]",
                    text,
                    self.members.join(", ")
                )));
            }
        }
        debug!("{} invoked with {:?}", self.path, arg);
        self.invocations.lock().push(arg);
        Ok(())
    }
}

/// Observable tree held entirely in memory.
#[derive(Default)]
pub struct MemoryModel {
    elements: RwLock<BTreeMap<String, Arc<MemoryElement>>>,
    notifier: Arc<Notifier>,
    refreshes: AtomicUsize,
}

impl MemoryModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: Vec<ElementSeed>) -> Result<Self, ModelError> {
        let model = Self::new();
        for seed in seeds {
            if model.elements.read().contains_key(&seed.path) {
                return Err(ModelError::InvalidElement {
                    path: seed.path,
                    reason: "duplicate path".to_string(),
                });
            }
            model.insert(seed)?;
        }
        Ok(model)
    }

    /// Adds (or replaces) an element. Fires `Enabled` when it starts enabled.
    pub fn insert(&self, seed: ElementSeed) -> Result<Arc<MemoryElement>, ModelError> {
        let element = MemoryElement::from_seed(seed, Arc::downgrade(&self.notifier))?;
        self.elements
            .write()
            .insert(element.path.clone(), element.clone());
        if element.enabled() {
            element.notify(ChangeEvent::Enabled);
        }
        Ok(element)
    }

    pub fn element(&self, path: &str) -> Option<Arc<MemoryElement>> {
        self.elements.read().get(path).cloned()
    }

    /// Vehicle-side update of an element's value.
    pub fn update(&self, path: &str, value: Value) -> Result<(), ModelError> {
        let element = self
            .element(path)
            .ok_or_else(|| ModelError::UnknownElement(path.to_string()))?;
        element
            .update(value)
            .map_err(|e| ModelError::InvalidElement {
                path: path.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn set_enabled(&self, path: &str, enabled: bool) -> Result<(), ModelError> {
        let element = self
            .element(path)
            .ok_or_else(|| ModelError::UnknownElement(path.to_string()))?;
        element.set_enabled(enabled);
        Ok(())
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn observer_count(&self) -> usize {
        self.notifier.observers.lock().len()
    }
}

impl Model for MemoryModel {
    fn get_by_path(&self, path: &str) -> Option<Arc<dyn Element>> {
        let element: Arc<dyn Element> = self.element(path)?;
        Some(element)
    }

    fn get_all_elements(&self) -> Vec<Arc<dyn Element>> {
        self.elements
            .read()
            .values()
            .map(|e| {
                let element: Arc<dyn Element> = e.clone();
                element
            })
            .collect()
    }

    fn refresh_all(&self) -> Result<(), ModelError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        debug!("Refreshing all {} elements", self.elements.read().len());
        Ok(())
    }

    fn subscribe_to_changes(
        &self,
        observer: Arc<dyn ModelObserver>,
        events: &[ChangeEvent],
    ) -> ObserverId {
        let id = ObserverId(self.notifier.next_id.fetch_add(1, Ordering::SeqCst));
        self.notifier
            .observers
            .lock()
            .push((id, observer, events.to_vec()));
        id
    }

    fn unsubscribe(&self, id: ObserverId) {
        self.notifier
            .observers
            .lock()
            .retain(|(existing, _, _)| *existing != id);
    }

    fn set_status(&self, path: &str, value: Value) {
        let element = match self.element(path) {
            Some(element) => element,
            None => match self.insert(ElementSeed::attribute(path, ValueKind::Text)) {
                Ok(element) => element,
                Err(e) => {
                    warn!("Cannot mirror status into {}: {}", path, e);
                    return;
                }
            },
        };
        let text = Value::Str(value.to_string());
        if let Err(e) = element.update(text) {
            warn!("Cannot mirror status into {}: {}", path, e);
        }
    }
}
