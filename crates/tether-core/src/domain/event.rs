//! Event - 一回の発生を表すレコード
//!
//! type・発生元（registry への弱参照）・任意の追加データを持ちます。
//! 追加データは `set` / `with` で足せますが、それ以外は構築後に変わりません。

use std::collections::HashMap;
use std::ops::Index;

use serde::Serialize;
use serde_json::Value;

use super::event_type::EventType;
use super::ids::EventId;
use crate::registry::EventSource;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    id: Option<EventId>,
    event_type: String,
    #[serde(skip)]
    source: Option<EventSource>,
    data: HashMap<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            source: None,
            data: HashMap::new(),
        }
    }

    /// Builder-style `set`.
    ///
    /// ```ignore
    /// let event = Event::new("resize").with("width", 10).with("height", 20);
    /// ```
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// The literal type string this event was triggered with.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn parsed_type(&self) -> EventType {
        EventType::parse(&self.event_type)
    }

    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    pub fn source(&self) -> Option<&EventSource> {
        self.source.as_ref()
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub(crate) fn fill_id(&mut self, id: EventId) {
        self.id.get_or_insert(id);
    }

    pub(crate) fn fill_source(&mut self, source: impl FnOnce() -> EventSource) {
        if self.source.is_none() {
            self.source = Some(source());
        }
    }
}

impl From<&str> for Event {
    fn from(event_type: &str) -> Self {
        Self::new(event_type)
    }
}

impl From<String> for Event {
    fn from(event_type: String) -> Self {
        Self::new(event_type)
    }
}

/// Missing keys read as `Value::Null`, the same way `serde_json::Value` indexes.
impl Index<&str> for Event {
    type Output = Value;

    fn index(&self, key: &str) -> &Value {
        self.data.get(key).unwrap_or(&NULL)
    }
}
