use std::sync::{Arc, PoisonError};

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::{QueueEntry, SchedulerShared};

pub(super) fn run(shared: Arc<SchedulerShared>, shutdown_rx: watch::Receiver<bool>) {
    debug!(thread = %shared.config.thread_name, "scheduler worker started");

    loop {
        // shutdown が来ていたら抜ける（実行中の entry は終わっている）
        if *shutdown_rx.borrow() {
            break;
        }

        // ロック内では先頭を clone するだけ。handler はロック外で実行する
        let next = {
            let queue = shared.queue();
            match queue.front() {
                Some(entry) => Some(entry.clone()),
                None => {
                    shared.drained.notify_all();
                    // idle: add_task / shutdown で早めに起こされる
                    let _ = shared
                        .wake
                        .wait_timeout(queue, shared.config.idle_interval)
                        .unwrap_or_else(PoisonError::into_inner);
                    None
                }
            }
        };
        let Some(entry) = next else {
            continue;
        };

        execute(&entry);

        let mut queue = shared.queue();
        queue.pop_front();
        if queue.is_empty() {
            shared.drained.notify_all();
        }
    }

    debug!(thread = %shared.config.thread_name, "scheduler worker stopped");
}

/// Run one entry, then release it from its owner if it is one-shot.
fn execute(entry: &QueueEntry) {
    let task = &entry.task;
    trace!(task_id = %task.id(), event_id = ?entry.event.id(), "running deferred task");

    if let Err(err) = task.run(&entry.event) {
        warn!(
            task_id = %task.id(),
            error = %err,
            "deferred task failed, dropped from queue"
        );
    }

    if task.is_one_shot()
        && let Some(registry) = entry.owner.as_ref().and_then(|owner| owner.registry())
    {
        registry.unbind(task);
    }
}
