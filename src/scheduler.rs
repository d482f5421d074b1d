//! Keyed timers on the tokio runtime.
//!
//! Each registration is one tokio task; every fire runs the handler in its own
//! task so a slow handler never holds up another timer.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKey {
    Task(i64),
    Subscription(i64),
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKey::Task(id) => write!(f, "task:{id}"),
            TimerKey::Subscription(id) => write!(f, "subscription:{id}"),
        }
    }
}

#[async_trait::async_trait]
pub trait FireHandler: Send + Sync {
    async fn fire(&self, key: TimerKey) -> Result<()>;
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The deadline has already passed; the caller runs the callback itself.
    #[error("delay for {0} is not positive")]
    NonPositiveDelay(TimerKey),

    #[error("interval for {0} is zero")]
    ZeroInterval(TimerKey),
}

struct Registration {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    live: HashMap<TimerKey, Registration>,
}

#[derive(Default)]
pub struct Scheduler {
    timers: Arc<Mutex<Timers>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `handler` every `interval`, first one interval from now.
    pub fn schedule_recurring(
        &self,
        key: TimerKey,
        interval: Duration,
        handler: Arc<dyn FireHandler>,
    ) -> Result<(), ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::ZeroInterval(key));
        }
        let start = Instant::now() + interval;
        self.register(key, move |_| {
            tokio::spawn(async move {
                let mut ticker = time::interval_at(start, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move { run_handler(handler.as_ref(), key).await });
                }
            })
        });
        tracing::debug!(%key, ?interval, "Recurring timer scheduled");
        Ok(())
    }

    /// Fire `handler` once after `delay`, then retire the timer.
    pub fn schedule_once(
        &self,
        key: TimerKey,
        delay: TimeDelta,
        handler: Arc<dyn FireHandler>,
    ) -> Result<(), ScheduleError> {
        let delay = match delay.to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return Err(ScheduleError::NonPositiveDelay(key)),
        };
        let timers = Arc::clone(&self.timers);
        self.register(key, move |generation| {
            tokio::spawn(async move {
                time::sleep(delay).await;
                {
                    let mut timers = timers.lock().expect("timer lock poisoned");
                    if timers
                        .live
                        .get(&key)
                        .is_some_and(|r| r.generation == generation)
                    {
                        timers.live.remove(&key);
                    }
                }
                run_handler(handler.as_ref(), key).await;
            })
        });
        tracing::debug!(%key, ?delay, "One-shot timer scheduled");
        Ok(())
    }

    /// Stop future fires for `key`. An in-flight handler is left to finish.
    pub fn cancel(&self, key: TimerKey) -> bool {
        let removed = self
            .timers
            .lock()
            .expect("timer lock poisoned")
            .live
            .remove(&key);
        match removed {
            Some(reg) => {
                reg.handle.abort();
                tracing::debug!(%key, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: TimerKey) -> bool {
        self.timers
            .lock()
            .expect("timer lock poisoned")
            .live
            .contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.timers.lock().expect("timer lock poisoned").live.len()
    }

    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        let count = timers.live.len();
        for (_, reg) in timers.live.drain() {
            reg.handle.abort();
        }
        tracing::info!("Scheduler stopped ({count} timers cancelled)");
    }

    fn register(&self, key: TimerKey, spawn: impl FnOnce(u64) -> JoinHandle<()>) {
        let mut timers = self.timers.lock().expect("timer lock poisoned");
        timers.next_generation += 1;
        let generation = timers.next_generation;
        let handle = spawn(generation);
        if let Some(old) = timers.live.insert(key, Registration { generation, handle }) {
            old.handle.abort();
            tracing::warn!(%key, "Replaced a live timer");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.lock() {
            for (_, reg) in timers.live.drain() {
                reg.handle.abort();
            }
        }
    }
}

async fn run_handler(handler: &dyn FireHandler, key: TimerKey) {
    if let Err(e) = handler.fire(key).await {
        tracing::error!(%key, "Timer handler failed: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<TimerKey>>,
        fail: bool,
        stall: Option<(TimerKey, Duration)>,
    }

    impl Recorder {
        fn count(&self, key: TimerKey) -> usize {
            self.fired.lock().unwrap().iter().filter(|k| **k == key).count()
        }
    }

    #[async_trait::async_trait]
    impl FireHandler for Recorder {
        async fn fire(&self, key: TimerKey) -> Result<()> {
            self.fired.lock().unwrap().push(key);
            if let Some((slow, pause)) = self.stall {
                if slow == key {
                    time::sleep(pause).await;
                }
            }
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    async fn advance(secs: u64) {
        time::sleep(Duration::from_secs(secs)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    const TASK: TimerKey = TimerKey::Task(1);
    const USER: TimerKey = TimerKey::Subscription(1);

    #[tokio::test(start_paused = true)]
    async fn test_recurring_waits_one_interval_then_repeats() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        scheduler
            .schedule_recurring(TASK, Duration::from_secs(60), rec.clone())
            .unwrap();

        advance(30).await;
        assert_eq!(rec.count(TASK), 0);
        advance(31).await;
        assert_eq!(rec.count(TASK), 1);
        advance(120).await;
        assert_eq!(rec.count(TASK), 3);
        assert!(scheduler.is_scheduled(TASK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_keeps_timer_alive() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        scheduler
            .schedule_recurring(TASK, Duration::from_secs(10), rec.clone())
            .unwrap();

        advance(35).await;
        assert_eq!(rec.count(TASK), 3);
        assert!(scheduler.is_scheduled(TASK));
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_a_single_time_and_retires() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        scheduler
            .schedule_once(USER, TimeDelta::seconds(10), rec.clone())
            .unwrap();
        assert!(scheduler.is_scheduled(USER));

        advance(11).await;
        assert_eq!(rec.count(USER), 1);
        assert!(!scheduler.is_scheduled(USER));

        advance(100).await;
        assert_eq!(rec.count(USER), 1);
        assert!(!scheduler.cancel(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_rejects_past_deadlines() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        for delay in [TimeDelta::zero(), TimeDelta::seconds(-5)] {
            let err = scheduler.schedule_once(USER, delay, rec.clone()).unwrap_err();
            assert_eq!(err, ScheduleError::NonPositiveDelay(USER));
        }
        assert_eq!(scheduler.len(), 0);
        advance(10).await;
        assert_eq!(rec.count(USER), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_rejected() {
        let scheduler = Scheduler::new();
        let err = scheduler
            .schedule_recurring(TASK, Duration::ZERO, Arc::new(Recorder::default()))
            .unwrap_err();
        assert_eq!(err, ScheduleError::ZeroInterval(TASK));
        assert_eq!(scheduler.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_fires_and_unknown_is_noop() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        assert!(!scheduler.cancel(TimerKey::Task(404)));

        scheduler
            .schedule_recurring(TASK, Duration::from_secs(10), rec.clone())
            .unwrap();
        advance(11).await;
        assert!(scheduler.cancel(TASK));
        assert!(!scheduler.cancel(TASK));
        advance(60).await;
        assert_eq!(rec.count(TASK), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduled_once_is_not_retired_by_old_timer() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        scheduler
            .schedule_once(USER, TimeDelta::seconds(10), rec.clone())
            .unwrap();
        scheduler
            .schedule_once(USER, TimeDelta::seconds(20), rec.clone())
            .unwrap();

        advance(11).await;
        assert_eq!(rec.count(USER), 0);
        assert!(scheduler.is_scheduled(USER));

        advance(10).await;
        assert_eq!(rec.count(USER), 1);
        assert!(!scheduler.is_scheduled(USER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_does_not_delay_other_timers() {
        let scheduler = Scheduler::new();
        let slow = TimerKey::Task(2);
        let rec = Arc::new(Recorder {
            stall: Some((slow, Duration::from_secs(1000))),
            ..Default::default()
        });
        scheduler
            .schedule_recurring(slow, Duration::from_secs(10), rec.clone())
            .unwrap();
        scheduler
            .schedule_recurring(TASK, Duration::from_secs(10), rec.clone())
            .unwrap();

        advance(35).await;
        assert_eq!(rec.count(TASK), 3);
        assert_eq!(rec.count(slow), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_namespaced() {
        let scheduler = Scheduler::new();
        let rec = Arc::new(Recorder::default());
        scheduler
            .schedule_recurring(TimerKey::Task(7), Duration::from_secs(10), rec.clone())
            .unwrap();
        scheduler
            .schedule_once(TimerKey::Subscription(7), TimeDelta::seconds(100), rec.clone())
            .unwrap();
        assert_eq!(scheduler.len(), 2);

        scheduler.shutdown();
        assert_eq!(scheduler.len(), 0);
        assert_eq!(TimerKey::Task(7).to_string(), "task:7");
    }
}
