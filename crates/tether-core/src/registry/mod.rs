//! EventRegistry - event type ごとに Task を保持し、trigger で実行する
//!
//! # 構成
//! - `tasks`: event type 文字列（`delay[5]` のような literal のまま）→ bind 順の Task 列
//! - 語彙（vocabulary）: 既定の event type で初期化し、未知の type を bind すると追加される
//! - 構築時に `update` へ delay polling 用の Task を `keep_at_clear` で bind する
//!
//! # スレッド
//! registry は owner のスレッドから使う前提です。ただし deferred Task は
//! Scheduler の worker スレッドで実行され、delay Task の unbind もそこから来ます。
//! ロックは handler 実行中に保持しません（handler から bind/unbind してよい）。

mod builder;
mod delay;

pub use self::builder::RegistryBuilder;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use crate::domain::{BindOptions, Event, EventKind, EventType, Target, Task, TaskId};
use crate::error::EventError;
use crate::ports::{Clock, IdGenerator};
use crate::scheduler::Scheduler;

/// Process-wide copy of the most recently triggered event.
static LATEST_EVENT: Mutex<Option<Event>> = Mutex::new(None);

/// The event most recently triggered on any registry in this process.
///
/// Diagnostic only; dispatch never reads it.
pub fn latest_event() -> Option<Event> {
    LATEST_EVENT
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Tasks bound under one literal event type string.
struct Binding {
    event_type: EventType,
    tasks: Vec<Arc<Task>>,
    /// ID の連番。unbind しても戻さない（ID を再利用しないため）
    next_sequence: u64,
}

impl Binding {
    fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            tasks: Vec::new(),
            next_sequence: 0,
        }
    }
}

struct RegistryState {
    vocabulary: HashSet<String>,
    bindings: HashMap<String, Binding>,
    latest_event: Option<Event>,
}

pub(crate) struct RegistryShared {
    owner_id: Arc<str>,
    state: Mutex<RegistryState>,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

/// Back-reference from an [`Event`] (or a queued task) to the registry that owns it.
#[derive(Clone)]
pub struct EventSource {
    owner_id: Arc<str>,
    registry: Weak<RegistryShared>,
}

impl EventSource {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// `None` once the registry has been dropped.
    pub fn registry(&self) -> Option<EventRegistry> {
        self.registry
            .upgrade()
            .map(|shared| EventRegistry { shared })
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventSource").field(&self.owner_id).finish()
    }
}

/// Either a task ID (full `<owner>.<type>.<n>` or short `<type>.<n>`) or the task itself.
#[derive(Debug, Clone, Copy)]
pub enum TaskRef<'a> {
    Id(&'a str),
    Task(&'a Task),
}

impl<'a> From<&'a str> for TaskRef<'a> {
    fn from(id: &'a str) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a String> for TaskRef<'a> {
    fn from(id: &'a String) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a TaskId> for TaskRef<'a> {
    fn from(id: &'a TaskId) -> Self {
        Self::Id(id.as_str())
    }
}

impl<'a> From<&'a Task> for TaskRef<'a> {
    fn from(task: &'a Task) -> Self {
        Self::Task(task)
    }
}

impl<'a> From<&'a Arc<Task>> for TaskRef<'a> {
    fn from(task: &'a Arc<Task>) -> Self {
        Self::Task(task)
    }
}

/// Per-object event binding store.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct EventRegistry {
    shared: Arc<RegistryShared>,
}

impl EventRegistry {
    /// Registry with a generated owner id and the system clock.
    pub fn new(scheduler: &Scheduler) -> Self {
        RegistryBuilder::new(scheduler).build()
    }

    pub fn builder(scheduler: &Scheduler) -> RegistryBuilder {
        RegistryBuilder::new(scheduler)
    }

    pub fn owner_id(&self) -> &str {
        &self.shared.owner_id
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.shared.scheduler
    }

    pub fn source(&self) -> EventSource {
        EventSource {
            owner_id: Arc::clone(&self.shared.owner_id),
            registry: Arc::downgrade(&self.shared),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind an inline task that is removed by `clear_bind`.
    pub fn bind(
        &self,
        event_type: &str,
        target: impl Into<Target>,
    ) -> Result<Arc<Task>, EventError> {
        self.bind_with(event_type, target, BindOptions::default())
    }

    /// Bind `target` to `event_type`.
    ///
    /// Unknown event types extend this registry's vocabulary. `delay[<d>]`
    /// creates a one-shot task due at `now + d`; `repeat` fails with
    /// [`EventError::UnsupportedEventKind`] and binds nothing.
    pub fn bind_with(
        &self,
        event_type: &str,
        target: impl Into<Target>,
        options: BindOptions,
    ) -> Result<Arc<Task>, EventError> {
        let parsed = EventType::parse(event_type);
        // 期限はロックを取る前に確定させる（失敗時に状態を変えない）
        let due = match parsed.decode()? {
            EventKind::Plain => None,
            EventKind::Delay(delay) => Some(
                self.shared
                    .clock
                    .now()
                    .checked_add_signed(delay)
                    .ok_or_else(|| EventError::InvalidDelay {
                        event_type: parsed.to_string(),
                        reason: "out of range".to_string(),
                    })?,
            ),
        };
        Ok(self.insert(event_type, parsed, due, target.into(), options))
    }

    fn insert(
        &self,
        literal: &str,
        parsed: EventType,
        due: Option<DateTime<Utc>>,
        target: Target,
        options: BindOptions,
    ) -> Arc<Task> {
        let mut state = self.state();

        if !state.vocabulary.contains(parsed.name()) {
            debug!(owner = %self.owner_id(), event_type = parsed.name(), "extending event vocabulary");
            state.vocabulary.insert(parsed.name().to_string());
        }

        let binding = state
            .bindings
            .entry(literal.to_string())
            .or_insert_with(|| Binding::new(parsed));
        let id = TaskId::compose(self.owner_id(), literal, binding.next_sequence);
        binding.next_sequence += 1;

        let task = Arc::new(match due {
            None => Task::new(id, literal, target, options),
            Some(target_time) => Task::delayed(id, literal, target, options, target_time),
        });
        binding.tasks.push(Arc::clone(&task));

        debug!(
            task_id = %task.id(),
            multithread = options.multithread,
            keep_at_clear = options.keep_at_clear,
            "task bound"
        );
        task
    }

    /// Dispatch `event` to every matching task and return how many were dispatched.
    ///
    /// Candidate keys are the base type plus either `type[*]` (no params) or
    /// the literal parameterized string. Inline tasks have finished when this
    /// returns; deferred ones are queued on the scheduler. Task failures are
    /// logged and do not stop the dispatch.
    pub fn trigger(&self, event: impl Into<Event>) -> usize {
        let mut event = event.into();
        event.fill_id(self.shared.ids.generate_event_id());
        event.fill_source(|| self.source());

        let parsed = event.parsed_type();
        let second = if parsed.has_params() {
            event.event_type().to_string()
        } else {
            parsed.wildcard()
        };
        let candidates = [parsed.name(), second.as_str()];

        let matched: Vec<Arc<Task>> = {
            let mut state = self.state();
            state.latest_event = Some(event.clone());
            candidates
                .iter()
                .filter_map(|key| state.bindings.get(*key))
                .flat_map(|binding| binding.tasks.iter().cloned())
                .collect()
        };
        *LATEST_EVENT.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.clone());

        trace!(
            owner = %self.owner_id(),
            event_type = event.event_type(),
            matched = matched.len(),
            "trigger"
        );

        for task in &matched {
            if let Err(err) = self.dispatch(task, &event) {
                warn!(task_id = %task.id(), error = %err, "task failed");
            }
        }
        matched.len()
    }

    /// Run one task with the usual inline/deferred rules, outside of `trigger`.
    pub fn execute_task(&self, task: &Arc<Task>, event: impl Into<Event>) -> Result<(), EventError> {
        let mut event = event.into();
        event.fill_id(self.shared.ids.generate_event_id());
        event.fill_source(|| self.source());
        self.dispatch(task, &event)
    }

    fn dispatch(&self, task: &Arc<Task>, event: &Event) -> Result<(), EventError> {
        // delay Task は一度しか発火しない
        if !task.claim() {
            return Ok(());
        }

        if task.multithread() {
            let owner = task.is_one_shot().then(|| self.source());
            let queued = self
                .shared
                .scheduler
                .add_task(event.clone(), Arc::clone(task), owner);
            // 停止済み: claim 済みの delay Task は二度と due にならないので外す
            if !queued && task.is_one_shot() {
                self.unbind(task);
            }
            return Ok(());
        }

        let result = task.run(event);
        if task.is_one_shot() {
            self.unbind(task);
        }
        result
    }

    /// Remove one task. Returns `false` when nothing matched.
    ///
    /// IDs may be full (`<owner>.<event_type>.<n>`) or short
    /// (`<event_type>.<n>`); see [`Self::find_task`].
    ///
    /// Already-queued deferred executions of the task still run.
    pub fn unbind<'a>(&self, task: impl Into<TaskRef<'a>>) -> bool {
        let mut state = self.state();
        let removed = match task.into() {
            TaskRef::Task(task) => state
                .bindings
                .get_mut(task.event_type())
                .and_then(|binding| {
                    let index = binding
                        .tasks
                        .iter()
                        .position(|bound| std::ptr::eq(Arc::as_ptr(bound), task))?;
                    Some(binding.tasks.remove(index))
                }),
            TaskRef::Id(id) => {
                let full = self.resolve_id(id);
                self.event_type_of(&full)
                    .and_then(|key| state.bindings.get_mut(key))
                    .and_then(|binding| {
                        let index = binding.tasks.iter().position(|bound| *bound.id() == *full)?;
                        Some(binding.tasks.remove(index))
                    })
            }
        };

        match removed {
            Some(task) => {
                debug!(task_id = %task.id(), "task unbound");
                true
            }
            None => false,
        }
    }

    /// Unbind every task under `event_type` except `keep_at_clear` ones.
    ///
    /// `"*"` clears every event type; the result is `true` only if every
    /// per-type clear succeeded. An event type that was never bound or
    /// seeded gives `false`.
    pub fn clear_bind(&self, event_type: &str) -> bool {
        let mut state = self.state();
        if event_type == "*" {
            // 全 type を処理してから結果をまとめる（途中で止めない）
            return state
                .bindings
                .values_mut()
                .map(clear_binding)
                .fold(true, |all, ok| all & ok);
        }
        state
            .bindings
            .get_mut(event_type)
            .map(clear_binding)
            .unwrap_or(false)
    }

    /// Look up a task by full or short ID.
    ///
    /// A short ID gets `<owner>.` prepended unless it already starts with it.
    pub fn find_task(&self, id: &str) -> Option<Arc<Task>> {
        let full = self.resolve_id(id);
        let key = self.event_type_of(&full)?;
        self.state()
            .bindings
            .get(key)?
            .tasks
            .iter()
            .find(|task| *task.id() == *full)
            .cloned()
    }

    /// Snapshot of the tasks bound under the literal `event_type`.
    pub fn tasks(&self, event_type: &str) -> Vec<Arc<Task>> {
        self.state()
            .bindings
            .get(event_type)
            .map(|binding| binding.tasks.clone())
            .unwrap_or_default()
    }

    /// Every event type key that has been seeded or bound, sorted.
    pub fn event_types(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state().bindings.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_known_event_type(&self, name: &str) -> bool {
        self.state().vocabulary.contains(name)
    }

    /// Total number of bound tasks, the delay poller included.
    pub fn len(&self) -> usize {
        self.state()
            .bindings
            .values()
            .map(|binding| binding.tasks.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest_event(&self) -> Option<Event> {
        self.state().latest_event.clone()
    }

    /// Short IDs (`click.0`) are taken to belong to this registry.
    ///
    /// Anything already starting with `<owner>.` is read as a full ID, so the
    /// short form of an event type named `<owner>.x` must be given in full.
    fn resolve_id(&self, id: &str) -> String {
        let owner = self.owner_id();
        match id.strip_prefix(owner) {
            Some(rest) if rest.starts_with('.') => id.to_string(),
            _ => format!("{owner}.{id}"),
        }
    }

    /// `<owner>.<event_type>.<n>` → `<event_type>`
    fn event_type_of<'a>(&self, full_id: &'a str) -> Option<&'a str> {
        let rest = full_id.strip_prefix(self.owner_id())?.strip_prefix('.')?;
        let (event_type, _sequence) = rest.rsplit_once('.')?;
        Some(event_type)
    }
}

fn clear_binding(binding: &mut Binding) -> bool {
    let before = binding.tasks.len();
    binding.tasks.retain(|task| task.keep_at_clear());
    let removed = before - binding.tasks.len();
    if removed > 0 {
        debug!(event_type = %binding.event_type, removed, "bindings cleared");
    }
    true
}
