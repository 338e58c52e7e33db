//! Scheduler - deferred Task を直列に実行する単一の worker
//!
//! # 状態
//! - **Idle**: queue が空
//! - **Draining**: queue に entry がある
//! - **Stopped**: `shutdown()` 済み（worker は実行中の entry を終えてから抜ける）
//!
//! # 設計
//! - `Mutex<VecDeque<QueueEntry>>` を唯一の共有状態とし、enqueue も pop もこのロック下で行う
//! - entry は実行が終わってから queue から外す（FIFO 順は崩さない）
//! - 別々の registry から来た deferred Task も同じ worker で直列に実行される
//! - 一度 queue に入った entry は取り消せない（unbind しても実行される）
//!
//! Scheduler は明示的に構築し、各 registry に渡します（プロセス全体の共有状態にはしない）。

mod config;
mod worker;

pub use self::config::SchedulerConfig;

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::domain::{Event, Task};
use crate::error::EventError;
use crate::registry::EventSource;

/// One deferred execution.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub event: Event,
    pub task: Arc<Task>,
    /// Registry to unbind a one-shot task from once it has run.
    pub owner: Option<EventSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Draining,
    Stopped,
}

struct SchedulerShared {
    queue: Mutex<VecDeque<QueueEntry>>,
    /// add_task / shutdown → worker
    wake: Condvar,
    /// worker → wait_idle
    drained: Condvar,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    config: SchedulerConfig,
}

impl SchedulerShared {
    fn queue(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

/// Handle to the background worker. Clones share the same queue and thread.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
}

impl Scheduler {
    /// Spawn the worker thread.
    pub fn start(config: SchedulerConfig) -> Result<Self, EventError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(VecDeque::new()),
            wake: Condvar::new(),
            drained: Condvar::new(),
            shutdown_tx,
            worker: Mutex::new(None),
            config,
        });

        let join = thread::Builder::new()
            .name(shared.config.thread_name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || worker::run(shared, shutdown_rx)
            })?;
        *shared.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);

        Ok(Self { shared })
    }

    /// Enqueue `task` to run with `event` on the worker. Never blocks on execution.
    ///
    /// Returns `false` (and logs a warning) when the scheduler has been shut
    /// down; the entry is dropped.
    #[must_use]
    pub fn add_task(&self, event: Event, task: Arc<Task>, owner: Option<EventSource>) -> bool {
        let mut queue = self.shared.queue();
        // shutdown は flag を立ててからこのロックを取るので、ここで見れば取りこぼさない
        if self.shared.is_shutdown() {
            warn!(task_id = %task.id(), "scheduler is stopped, deferred task dropped");
            return false;
        }

        debug!(task_id = %task.id(), position = queue.len(), "task enqueued");
        queue.push_back(QueueEntry { event, task, owner });
        self.shared.wake.notify_one();
        true
    }

    /// Entries not yet finished, the one currently running included.
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }

    pub fn state(&self) -> SchedulerState {
        if self.shared.is_shutdown() {
            SchedulerState::Stopped
        } else if self.pending() > 0 {
            SchedulerState::Draining
        } else {
            SchedulerState::Idle
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Block until the queue is empty or `timeout` elapses. Returns whether it drained.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.shared.queue();
        while !queue.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .shared
                .drained
                .wait_timeout(queue, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
        true
    }

    /// Stop the worker after its current entry and wait for it, unless called
    /// from the worker itself. Entries still queued are not run. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown_tx.send_replace(true);
        {
            let _queue = self.shared.queue();
            self.shared.wake.notify_all();
        }

        let join = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(join) = join else {
            return;
        };
        if join.thread().id() == thread::current().id() {
            // worker 自身からの shutdown: join すると自分を待つことになる
            return;
        }
        if join.join().is_err() {
            warn!("scheduler worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BindOptions, Target, TaskId};
    use std::sync::mpsc;

    fn task(id: &str, target: Target) -> Arc<Task> {
        Arc::new(Task::new(
            TaskId::new(id),
            "resize",
            target,
            BindOptions::deferred(),
        ))
    }

    #[test]
    fn runs_entries_in_fifo_order() {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..20 {
            let log = Arc::clone(&log);
            assert!(scheduler.add_task(
                Event::new("resize"),
                task(
                    &format!("o.resize.{i}"),
                    Target::single(move |_| {
                        log.lock().unwrap().push(i);
                        Ok(())
                    }),
                ),
                None,
            ));
        }

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        scheduler.shutdown();
    }

    #[test]
    fn failures_do_not_stop_the_worker() {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let ran = Arc::new(Mutex::new(false));
        let r = Arc::clone(&ran);

        assert!(scheduler.add_task(
            Event::new("resize"),
            task("o.resize.0", Target::single(|_| panic!("worker must survive"))),
            None,
        ));
        assert!(scheduler.add_task(
            Event::new("resize"),
            task("o.resize.1", Target::single(|_| Err("plain failure".into()))),
            None,
        ));
        assert!(scheduler.add_task(
            Event::new("resize"),
            task(
                "o.resize.2",
                Target::single(move |_| {
                    *r.lock().unwrap() = true;
                    Ok(())
                }),
            ),
            None,
        ));

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert!(*ran.lock().unwrap());
        scheduler.shutdown();
    }

    #[test]
    fn runs_on_the_worker_thread() {
        let scheduler = Scheduler::start(SchedulerConfig {
            thread_name: "test-worker".to_string(),
            ..SchedulerConfig::default()
        })
        .unwrap();
        let name = Arc::new(Mutex::new(None));
        let n = Arc::clone(&name);

        assert!(scheduler.add_task(
            Event::new("resize"),
            task(
                "o.resize.0",
                Target::single(move |_| {
                    *n.lock().unwrap() = thread::current().name().map(str::to_string);
                    Ok(())
                }),
            ),
            None,
        ));

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        assert_eq!(name.lock().unwrap().as_deref(), Some("test-worker"));
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_refuses_new_tasks() {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        scheduler.shutdown();
        scheduler.shutdown();

        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(!scheduler.add_task(
            Event::new("resize"),
            task("o.resize.0", Target::single(|_| Ok(()))),
            None,
        ));
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn shutdown_finishes_the_running_entry_and_skips_the_rest() {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(started_tx);
        let release_rx = Mutex::new(release_rx);
        let first_done = Arc::new(Mutex::new(false));
        let second_ran = Arc::new(Mutex::new(false));

        let done = Arc::clone(&first_done);
        assert!(scheduler.add_task(
            Event::new("resize"),
            task(
                "o.resize.0",
                Target::single(move |_| {
                    started_tx.lock().unwrap().send(()).unwrap();
                    let _ = release_rx.lock().unwrap().recv();
                    *done.lock().unwrap() = true;
                    Ok(())
                }),
            ),
            None,
        ));
        let ran = Arc::clone(&second_ran);
        assert!(scheduler.add_task(
            Event::new("resize"),
            task(
                "o.resize.1",
                Target::single(move |_| {
                    *ran.lock().unwrap() = true;
                    Ok(())
                }),
            ),
            None,
        ));

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let stopper = thread::spawn({
            let scheduler = scheduler.clone();
            move || scheduler.shutdown()
        });
        while scheduler.state() != SchedulerState::Stopped {
            thread::yield_now();
        }
        release_tx.send(()).unwrap();
        stopper.join().unwrap();

        assert!(*first_done.lock().unwrap());
        assert!(!*second_ran.lock().unwrap());
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn wait_idle_times_out_while_busy() {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);

        assert!(scheduler.add_task(
            Event::new("resize"),
            task(
                "o.resize.0",
                Target::single(move |_| {
                    let _ = release_rx.lock().unwrap().recv();
                    Ok(())
                }),
            ),
            None,
        ));

        assert!(!scheduler.wait_idle(Duration::from_millis(50)));
        assert_eq!(scheduler.state(), SchedulerState::Draining);
        release_tx.send(()).unwrap();
        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        scheduler.shutdown();
    }
}
