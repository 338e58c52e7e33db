//! Domain model (events, event type grammar, tasks, IDs).

pub mod event;
pub mod event_type;
pub mod ids;
pub mod task;

pub use self::event::Event;
pub use self::event_type::{EventKind, EventType};
pub use self::ids::EventId;
pub use self::task::{BindOptions, Handler, Target, Task, TaskId, handler};
