//! tether-core
//!
//! Event binding and task scheduling for widget-like objects.
//!
//! # モジュール構成
//! - **domain**: Event, event type 文字列のパーサー, Task / DelayTask, ID
//! - **ports**: Clock, IdGenerator
//! - **registry**: EventRegistry（bind / unbind / trigger / clear_bind / delay polling）
//! - **scheduler**: deferred Task を直列に実行する background worker
//! - **error**: EventError
//!
//! # 使用例
//! ```
//! use std::time::Duration;
//! use tether_core::{BindOptions, Event, EventRegistry, Scheduler, SchedulerConfig, Target};
//!
//! let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
//! let button = EventRegistry::builder(&scheduler).owner_id("button1").build();
//!
//! button.bind("click", Target::single(|_| Ok(()))).unwrap();
//! button
//!     .bind_with(
//!         "resize",
//!         Target::single(|event| {
//!             assert_eq!(event["width"], 10);
//!             Ok(())
//!         }),
//!         BindOptions::deferred(),
//!     )
//!     .unwrap();
//!
//! button.trigger("click");
//! button.trigger(Event::new("resize").with("width", 10));
//! assert!(scheduler.wait_idle(Duration::from_secs(1)));
//! scheduler.shutdown();
//! ```

pub mod domain;
pub mod error;
pub mod ports;
pub mod registry;
pub mod scheduler;

pub use domain::{BindOptions, Event, EventType, Handler, Target, Task, TaskId, handler};
pub use error::{EventError, HandlerError};
pub use registry::{EventRegistry, EventSource, RegistryBuilder, TaskRef, latest_event};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerState};
