//! Task - bind された handler とその実行モード
//!
//! # Target
//! 単体の handler か、順番に呼ぶ handler の列かを bind 時に決めます。
//! 実行時に形を調べ直すことはしません。
//!
//! # Schedule
//! - `Immediate`: 通常の Task
//! - `Delay`: `target_time` を過ぎたら一度だけ発火する Task（DelayTask）

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::event::Event;
use crate::error::{EventError, HandlerError};

/// `<owner>.<event_type>.<sequence>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub(crate) fn compose(owner: &str, event_type: &str, sequence: u64) -> Self {
        Self(format!("{owner}.{event_type}.{sequence}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<str> for TaskId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for TaskId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

pub type Handler = Arc<dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone)]
pub enum Target {
    Single(Handler),
    Chain(Vec<Handler>),
}

impl Target {
    pub fn single<F>(f: F) -> Self
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        Self::Single(Arc::new(f))
    }

    pub fn chain(handlers: impl IntoIterator<Item = Handler>) -> Self {
        Self::Chain(handlers.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Chain(handlers) => handlers.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Handler> for Target {
    fn from(handler: Handler) -> Self {
        Self::Single(handler)
    }
}

impl From<Vec<Handler>> for Target {
    fn from(handlers: Vec<Handler>) -> Self {
        Self::Chain(handlers)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(_) => f.write_str("Single"),
            Self::Chain(handlers) => write!(f, "Chain({})", handlers.len()),
        }
    }
}

#[derive(Debug)]
enum Schedule {
    Immediate,
    Delay {
        target_time: DateTime<Utc>,
        fired: AtomicBool,
    },
}

/// Execution-mode flags given at bind time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BindOptions {
    pub multithread: bool,
    pub keep_at_clear: bool,
}

impl BindOptions {
    /// Run on the scheduler worker instead of the triggering thread.
    pub fn deferred() -> Self {
        Self {
            multithread: true,
            ..Self::default()
        }
    }

    pub fn multithread(mut self, multithread: bool) -> Self {
        self.multithread = multithread;
        self
    }

    /// Survive `clear_bind`.
    pub fn keep_at_clear(mut self, keep: bool) -> Self {
        self.keep_at_clear = keep;
        self
    }
}

#[derive(Debug)]
pub struct Task {
    id: TaskId,
    event_type: String,
    target: Target,
    multithread: bool,
    keep_at_clear: bool,
    schedule: Schedule,
}

impl Task {
    pub(crate) fn new(id: TaskId, event_type: &str, target: Target, options: BindOptions) -> Self {
        Self {
            id,
            event_type: event_type.to_string(),
            target,
            multithread: options.multithread,
            keep_at_clear: options.keep_at_clear,
            schedule: Schedule::Immediate,
        }
    }

    pub(crate) fn delayed(
        id: TaskId,
        event_type: &str,
        target: Target,
        options: BindOptions,
        target_time: DateTime<Utc>,
    ) -> Self {
        Self {
            schedule: Schedule::Delay {
                target_time,
                fired: AtomicBool::new(false),
            },
            ..Self::new(id, event_type, target, options)
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// The literal event type string the task was bound under.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn multithread(&self) -> bool {
        self.multithread
    }

    pub fn keep_at_clear(&self) -> bool {
        self.keep_at_clear
    }

    /// Delay tasks fire once and are then removed from their owner.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.schedule, Schedule::Delay { .. })
    }

    pub fn target_time(&self) -> Option<DateTime<Utc>> {
        match &self.schedule {
            Schedule::Immediate => None,
            Schedule::Delay { target_time, .. } => Some(*target_time),
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match &self.schedule {
            Schedule::Immediate => false,
            Schedule::Delay { target_time, fired } => {
                now >= *target_time && !fired.load(Ordering::Acquire)
            }
        }
    }

    /// Take the right to fire. Always true for immediate tasks, true exactly
    /// once for delay tasks.
    pub(crate) fn claim(&self) -> bool {
        match &self.schedule {
            Schedule::Immediate => true,
            Schedule::Delay { fired, .. } => !fired.swap(true, Ordering::AcqRel),
        }
    }

    /// Invoke the target with `event`, in chain order.
    ///
    /// A handler error or panic stops the chain and is returned as
    /// [`EventError::TaskExecution`].
    pub fn run(&self, event: &Event) -> Result<(), EventError> {
        let handlers: &[Handler] = match &self.target {
            Target::Single(handler) => std::slice::from_ref(handler),
            Target::Chain(handlers) => handlers,
        };
        if handlers.is_empty() {
            return Err(EventError::InvalidTaskTarget(self.id.clone()));
        }

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err.to_string(),
                Err(payload) => panic_message(payload.as_ref()),
            };
            return Err(EventError::TaskExecution {
                task_id: self.id.clone(),
                message,
            });
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
