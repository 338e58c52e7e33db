//! RegistryBuilder - EventRegistry の構築
//!
//! # 使用例
//! ```ignore
//! let registry = EventRegistry::builder(&scheduler)
//!     .owner_id("button1")
//!     .event_types(&["shake"])
//!     .build();
//! ```
//!
//! build() で既定の語彙を seed し、`update` に delay polling を bind します。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{Binding, EventRegistry, RegistryShared, RegistryState};
use crate::domain::event_type::{DEFAULT_EVENT_TYPES, UPDATE};
use crate::domain::{BindOptions, EventType, Target};
use crate::ports::{Clock, SystemClock, UlidGenerator};
use crate::scheduler::Scheduler;

/// owner id を省略したときの連番
static NEXT_OWNER: AtomicU64 = AtomicU64::new(0);

pub struct RegistryBuilder {
    scheduler: Scheduler,
    owner_id: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    event_types: Vec<String>,
}

impl RegistryBuilder {
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            scheduler: scheduler.clone(),
            owner_id: None,
            clock: None,
            event_types: Vec::new(),
        }
    }

    /// Prefix of every task ID bound on this registry. Defaults to `registry<N>`.
    pub fn owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Event types to seed on top of the defaults.
    pub fn event_types(mut self, event_types: &[&str]) -> Self {
        self.event_types
            .extend(event_types.iter().map(|event_type| event_type.to_string()));
        self
    }

    pub fn build(self) -> EventRegistry {
        let owner_id = self.owner_id.unwrap_or_else(|| {
            format!("registry{}", NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
        });
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let seeded = DEFAULT_EVENT_TYPES
            .iter()
            .map(|event_type| event_type.to_string())
            .chain(self.event_types);
        let mut vocabulary = HashSet::new();
        let mut bindings = HashMap::new();
        for event_type in seeded {
            let parsed = EventType::parse(&event_type);
            vocabulary.insert(parsed.name().to_string());
            bindings
                .entry(event_type)
                .or_insert_with(|| Binding::new(parsed));
        }

        let registry = EventRegistry {
            shared: Arc::new(RegistryShared {
                owner_id: owner_id.into(),
                state: Mutex::new(RegistryState {
                    vocabulary,
                    bindings,
                    latest_event: None,
                }),
                scheduler: self.scheduler,
                ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
                clock,
            }),
        };

        // delay polling（clear_bind("*") でも消えない）
        let weak = Arc::downgrade(&registry.shared);
        registry.insert(
            UPDATE,
            EventType::parse(UPDATE),
            None,
            Target::single(move |_| {
                if let Some(shared) = weak.upgrade() {
                    EventRegistry { shared }.poll_delays();
                }
                Ok(())
            }),
            BindOptions::default().keep_at_clear(true),
        );
        registry
    }
}
