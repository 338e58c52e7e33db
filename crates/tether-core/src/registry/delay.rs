//! Delay polling
//!
//! `update` が pump されるたびに、base type が `delay` の key を走査し、
//! `target_time` を過ぎた Task を実行します。壁時計の割り込みではなく
//! 協調的なスケジューリングなので、発火の遅れは `update` の頻度で決まります。

use std::sync::Arc;

use tracing::{trace, warn};

use super::EventRegistry;
use crate::domain::{Event, Task};
use crate::ports::{Clock, IdGenerator};

impl EventRegistry {
    /// Fire every delay task whose target time has passed. Returns how many fired.
    pub fn poll_delays(&self) -> usize {
        let now = self.shared.clock.now();
        let due: Vec<Arc<Task>> = self
            .state()
            .bindings
            .values()
            .filter(|binding| binding.event_type.is_delay())
            .flat_map(|binding| binding.tasks.iter())
            .filter(|task| task.is_due(now))
            .cloned()
            .collect();

        if !due.is_empty() {
            trace!(owner = %self.owner_id(), due = due.len(), "delay tasks due");
        }

        for task in &due {
            let mut event = Event::new(task.event_type());
            event.fill_id(self.shared.ids.generate_event_id());
            event.fill_source(|| self.source());
            if let Err(err) = self.dispatch(task, &event) {
                warn!(task_id = %task.id(), error = %err, "delay task failed");
            }
        }
        due.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BindOptions, Target};
    use crate::ports::{Clock, FixedClock};
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::error::EventError;
    use chrono::{Duration, TimeZone, Utc};
    use rstest::rstest;
    use std::sync::Mutex;

    fn setup() -> (Scheduler, Arc<FixedClock>, EventRegistry) {
        let scheduler = Scheduler::start(SchedulerConfig::default()).unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let registry = EventRegistry::builder(&scheduler)
            .owner_id("timer")
            .clock(clock.clone())
            .build();
        (scheduler, clock, registry)
    }

    #[test]
    fn delay_target_time_is_now_plus_duration() {
        let (scheduler, clock, registry) = setup();
        let task = registry
            .bind("delay[500ms]", Target::single(|_| Ok(())))
            .unwrap();

        assert_eq!(task.target_time(), Some(clock.now() + Duration::milliseconds(500)));
        scheduler.shutdown();
    }

    #[test]
    fn delay_fires_once_after_update_and_is_unbound() {
        let (scheduler, clock, registry) = setup();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&fired);
        registry
            .bind(
                "delay[2s]",
                Target::single(move |event| {
                    f.lock().unwrap().push(event.event_type().to_string());
                    Ok(())
                }),
            )
            .unwrap();

        registry.trigger("update");
        assert!(fired.lock().unwrap().is_empty());

        clock.advance(Duration::seconds(2));
        registry.trigger("update");
        registry.trigger("update");

        assert_eq!(*fired.lock().unwrap(), vec!["delay[2s]".to_string()]);
        assert!(registry.tasks("delay[2s]").is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn only_due_tasks_fire() {
        let (scheduler, clock, registry) = setup();
        registry.bind("delay[1s]", Target::single(|_| Ok(()))).unwrap();
        registry.bind("delay[5s]", Target::single(|_| Ok(()))).unwrap();

        clock.advance(Duration::seconds(1));
        assert_eq!(registry.poll_delays(), 1);
        assert!(registry.tasks("delay[1s]").is_empty());
        assert_eq!(registry.tasks("delay[5s]").len(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn failing_delay_task_is_still_removed() {
        let (scheduler, clock, registry) = setup();
        registry
            .bind("delay[0]", Target::single(|_| Err("nope".into())))
            .unwrap();

        clock.advance(Duration::milliseconds(1));
        registry.trigger("update");

        assert!(registry.tasks("delay[0]").is_empty());
        scheduler.shutdown();
    }

    #[test]
    fn deferred_delay_is_not_enqueued_twice() {
        let (scheduler, clock, registry) = setup();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        registry
            .bind_with(
                "delay[1s]",
                Target::single(move |_| {
                    *c.lock().unwrap() += 1;
                    Ok(())
                }),
                BindOptions::deferred(),
            )
            .unwrap();

        clock.advance(Duration::seconds(1));
        registry.trigger("update");
        registry.trigger("update");
        assert!(scheduler.wait_idle(std::time::Duration::from_secs(5)));

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(registry.tasks("delay[1s]").is_empty());
        scheduler.shutdown();
    }

    #[rstest]
    #[case("delay[1e13]")]
    #[case("delay[1e13s]")]
    #[case("delay[1e16]")]
    fn out_of_range_delay_is_rejected_without_side_effects(#[case] event_type: &str) {
        let (scheduler, _clock, registry) = setup();
        let before = registry.len();

        let err = registry
            .bind(event_type, Target::single(|_| Ok(())))
            .unwrap_err();

        assert!(matches!(err, EventError::InvalidDelay { .. }));
        assert_eq!(registry.len(), before);
        assert!(!registry.event_types().contains(&event_type.to_string()));
        scheduler.shutdown();
    }

    #[test]
    fn deferred_delay_refused_after_shutdown_is_unbound() {
        let (scheduler, clock, registry) = setup();
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        registry
            .bind_with(
                "delay[0]",
                Target::single(move |_| {
                    *c.lock().unwrap() += 1;
                    Ok(())
                }),
                BindOptions::deferred(),
            )
            .unwrap();

        scheduler.shutdown();
        clock.advance(Duration::milliseconds(1));
        registry.trigger("update");
        registry.trigger("update");

        assert_eq!(*count.lock().unwrap(), 0);
        assert!(registry.tasks("delay[0]").is_empty());
        assert_eq!(scheduler.pending(), 0);
    }
}
