//! Task and subscription lifecycle on top of the stores, fetcher and scheduler.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::diff::{self, DiffMode};
use crate::error::{MonitorError, Result};
use crate::listing::{Item, ListingSource};
use crate::notify::{Notification, Notifier};
use crate::scheduler::{FireHandler, ScheduleError, Scheduler, TimerKey};
use crate::store::{NewTask, Task, TaskStore, User, UserStore};

/// Longest single subscription extension, roughly a century.
pub const MAX_EXTENSION_DAYS: u32 = 36_500;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub item_limit: usize,
    pub probe_limit: usize,
    pub trial_days: u32,
    pub diff_mode: DiffMode,
    pub pause_expired_owners: bool,
}

impl MonitorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            item_limit: cfg.fetcher.item_limit,
            probe_limit: cfg.fetcher.probe_limit,
            trial_days: cfg.subscription.trial_days,
            diff_mode: cfg.monitor.diff_mode,
            pause_expired_owners: cfg.monitor.pause_expired_owners,
        }
    }
}

/// What a single task check ended up doing.
#[derive(Debug, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another check of the same task is still running.
    Busy,
    Missing,
    OwnerInactive,
    /// Fetch failed or the page had no listings; cursor untouched.
    Unavailable,
    /// Task was deleted while the check ran; result dropped.
    Discarded,
    Checked(Vec<Item>),
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct RehydrateSummary {
    pub tasks: usize,
    pub orphaned_tasks: usize,
    pub subscriptions: usize,
    pub expired_now: usize,
}

/// One mutex per task id, held for the duration of a check.
#[derive(Default)]
struct TickLocks(Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>);

impl TickLocks {
    fn get(&self, task_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.0.lock().expect("tick lock map poisoned");
        Arc::clone(locks.entry(task_id).or_default())
    }

    fn remove(&self, task_id: i64) {
        self.0
            .lock()
            .expect("tick lock map poisoned")
            .remove(&task_id);
    }
}

pub struct Monitor {
    me: Weak<Monitor>,
    tasks: Arc<dyn TaskStore>,
    users: Arc<dyn UserStore>,
    source: Arc<dyn ListingSource>,
    notifier: Arc<dyn Notifier>,
    scheduler: Scheduler,
    settings: MonitorSettings,
    tick_locks: TickLocks,
}

impl Monitor {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        users: Arc<dyn UserStore>,
        source: Arc<dyn ListingSource>,
        notifier: Arc<dyn Notifier>,
        settings: MonitorSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tasks,
            users,
            source,
            notifier,
            scheduler: Scheduler::new(),
            settings,
            tick_locks: TickLocks::default(),
        })
    }

    fn handler(&self) -> Result<Arc<dyn FireHandler>> {
        let me: Arc<dyn FireHandler> = self
            .me
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("monitor is shutting down"))?;
        Ok(me)
    }

    // --- Tasks ---

    /// Probe `url`, persist the task seeded with the probe's ids, start polling.
    pub async fn create_task(
        &self,
        owner_id: i64,
        name: &str,
        url: &str,
        cadence_minutes: u32,
    ) -> Result<Task> {
        if cadence_minutes == 0 {
            return Err(MonitorError::InvalidCadence);
        }
        if self.users.get(owner_id).await?.is_none() {
            return Err(MonitorError::NotFound(format!("user {owner_id}")));
        }

        let Some(items) = self.source.fetch(url, self.settings.probe_limit).await? else {
            return Err(MonitorError::NoListingsFound(url.to_string()));
        };

        let cursor = diff::cursor_of(&items);
        let id = self
            .tasks
            .create(NewTask {
                owner_id,
                name: name.to_string(),
                url: url.to_string(),
                cadence_minutes,
                cursor: cursor.clone(),
            })
            .await?;
        let task = Task {
            id,
            owner_id,
            name: name.to_string(),
            url: url.to_string(),
            cadence_minutes,
            last_seen_cursor: cursor,
        };
        self.schedule_task(&task)?;
        tracing::info!(
            task_id = id,
            owner_id,
            "Task created ({} items seen, every {cadence_minutes} min)",
            task.last_seen_cursor.len()
        );
        Ok(task)
    }

    /// Delete the row first so an in-flight check finds nothing to write back.
    pub async fn remove_task(&self, task_id: i64) -> Result<()> {
        let deleted = self.tasks.delete(task_id).await?;
        self.scheduler.cancel(TimerKey::Task(task_id));
        self.tick_locks.remove(task_id);
        if !deleted {
            return Err(MonitorError::NotFound(format!("task {task_id}")));
        }
        tracing::info!(task_id, "Task removed");
        Ok(())
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task> {
        self.tasks
            .get(task_id)
            .await?
            .ok_or_else(|| MonitorError::NotFound(format!("task {task_id}")))
    }

    pub async fn list_tasks(&self, owner_id: i64) -> Result<Vec<Task>> {
        Ok(self.tasks.list_by_owner(owner_id).await?)
    }

    fn schedule_task(&self, task: &Task) -> Result<()> {
        let interval = Duration::from_secs(u64::from(task.cadence_minutes) * 60);
        self.scheduler
            .schedule_recurring(TimerKey::Task(task.id), interval, self.handler()?)
            .map_err(|_| MonitorError::InvalidCadence)
    }

    /// One fetch-diff-persist cycle for a task.
    pub async fn on_task_tick(&self, task_id: i64) -> Result<TickOutcome> {
        let lock = self.tick_locks.get(task_id);
        let Ok(_guard) = lock.try_lock() else {
            tracing::debug!(task_id, "Previous check still running, skipping tick");
            return Ok(TickOutcome::Busy);
        };

        let Some(task) = self.tasks.get(task_id).await? else {
            self.tick_locks.remove(task_id);
            tracing::debug!(task_id, "Task gone, nothing to check");
            return Ok(TickOutcome::Missing);
        };

        if self.settings.pause_expired_owners {
            let now = Utc::now();
            let active = self
                .users
                .get(task.owner_id)
                .await?
                .is_some_and(|u| u.is_active(now));
            if !active {
                tracing::debug!(task_id, owner_id = task.owner_id, "Owner subscription inactive");
                return Ok(TickOutcome::OwnerInactive);
            }
        }

        let fetched = match self.source.fetch(&task.url, self.settings.item_limit).await {
            Ok(Some(items)) => items,
            Ok(None) => {
                tracing::warn!(task_id, "No listings on page, keeping cursor");
                return Ok(TickOutcome::Unavailable);
            }
            Err(e) => {
                tracing::warn!(task_id, "Fetch failed: {e}");
                return Ok(TickOutcome::Unavailable);
            }
        };

        let fresh = diff::new_items(&task.last_seen_cursor, &fetched, self.settings.diff_mode);
        let cursor = diff::cursor_of(&fetched);
        if !self.tasks.update_cursor(task.id, &cursor).await? {
            tracing::info!(task_id, "Task removed during check, result discarded");
            return Ok(TickOutcome::Discarded);
        }

        if !fresh.is_empty() {
            tracing::info!(task_id, owner_id = task.owner_id, "{} new items", fresh.len());
        }
        for item in fresh.iter().rev() {
            let notification = Notification::NewItem {
                owner_id: task.owner_id,
                task_id: task.id,
                task_name: task.name.clone(),
                item: item.clone(),
            };
            if let Err(e) = self.notifier.send(&notification).await {
                tracing::error!(task_id, item_id = item.id, "Notification failed: {e:#}");
            }
        }
        Ok(TickOutcome::Checked(fresh))
    }

    // --- Users ---

    /// First contact: create the user with a trial subscription.
    pub async fn register_user(&self, user_id: i64) -> Result<User> {
        let now = Utc::now();
        let subscription_expiry = TimeDelta::try_days(i64::from(self.settings.trial_days))
            .and_then(|trial| now.checked_add_signed(trial))
            .ok_or(MonitorError::InvalidDays)?;
        let user = User {
            id: user_id,
            subscription_expiry,
            expiry_notified: false,
        };
        if !self.users.create(&user).await? {
            return Err(MonitorError::AlreadyExists(format!("user {user_id}")));
        }
        self.schedule_expiry(&user, now).await?;
        tracing::info!(user_id, expiry = %user.subscription_expiry, "User registered");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: i64) -> Result<User> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| MonitorError::NotFound(format!("user {user_id}")))
    }

    /// Called once a payment for `days` has been approved.
    pub async fn extend_subscription(&self, user_id: i64, days: u32) -> Result<DateTime<Utc>> {
        if days == 0 || days > MAX_EXTENSION_DAYS {
            return Err(MonitorError::InvalidDays);
        }
        let now = Utc::now();
        let Some(expiry) = self.users.extend_expiry(user_id, days, now).await? else {
            return Err(MonitorError::NotFound(format!("user {user_id}")));
        };
        self.scheduler.cancel(TimerKey::Subscription(user_id));
        let user = User {
            id: user_id,
            subscription_expiry: expiry,
            expiry_notified: false,
        };
        self.schedule_expiry(&user, now).await?;
        tracing::info!(user_id, %expiry, "Subscription extended by {days} days");
        Ok(expiry)
    }

    /// Arm the expiry timer, or run the expiry right away if it is already due.
    async fn schedule_expiry(&self, user: &User, now: DateTime<Utc>) -> Result<()> {
        let key = TimerKey::Subscription(user.id);
        match self
            .scheduler
            .schedule_once(key, user.subscription_expiry - now, self.handler()?)
        {
            Ok(()) => Ok(()),
            Err(ScheduleError::NonPositiveDelay(_)) => {
                self.on_subscription_expired(user.id, now).await?;
                Ok(())
            }
            Err(e) => Err(anyhow::Error::from(e).into()),
        }
    }

    /// Returns whether the expiry notice went out.
    pub async fn on_subscription_expired(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let Some(user) = self.users.get(user_id).await? else {
            tracing::debug!(user_id, "Expiry for unknown user ignored");
            return Ok(false);
        };
        if user.is_active(now) {
            // Fired early or was superseded by an extension.
            let key = TimerKey::Subscription(user_id);
            if !self.scheduler.is_scheduled(key) {
                self.scheduler
                    .schedule_once(key, user.subscription_expiry - now, self.handler()?)
                    .map_err(anyhow::Error::from)?;
            }
            return Ok(false);
        }
        if user.expiry_notified {
            return Ok(false);
        }

        let notification = Notification::SubscriptionExpired {
            user_id,
            expired_at: user.subscription_expiry,
        };
        if let Err(e) = self.notifier.send(&notification).await {
            tracing::error!(user_id, "Expiry notification failed: {e:#}");
        }
        self.users.mark_expiry_notified(user_id).await?;
        tracing::info!(user_id, "Subscription expired");
        Ok(true)
    }

    // --- Startup / shutdown ---

    /// Re-arm every timer from the stores after a restart.
    pub async fn rehydrate(&self, now: DateTime<Utc>) -> Result<RehydrateSummary> {
        let mut summary = RehydrateSummary::default();
        let users = self.users.list_all().await?;
        let known: HashSet<i64> = users.iter().map(|u| u.id).collect();

        for task in self.tasks.list_all().await? {
            if !known.contains(&task.owner_id) {
                tracing::warn!(task_id = task.id, owner_id = task.owner_id, "Task owner missing, not scheduled");
                summary.orphaned_tasks += 1;
                continue;
            }
            self.schedule_task(&task)?;
            summary.tasks += 1;
        }

        for user in users {
            if user.is_active(now) {
                self.schedule_expiry(&user, now).await?;
                summary.subscriptions += 1;
            } else if !user.expiry_notified {
                match self.on_subscription_expired(user.id, now).await {
                    Ok(_) => summary.expired_now += 1,
                    Err(e) => tracing::error!(user_id = user.id, "Expiry handling failed: {e}"),
                }
            }
        }

        tracing::info!(
            "Rehydrated {} tasks, {} subscriptions ({} expired on startup, {} orphaned tasks), {} timers armed",
            summary.tasks,
            summary.subscriptions,
            summary.expired_now,
            summary.orphaned_tasks,
            self.scheduler.len()
        );
        Ok(summary)
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

#[async_trait::async_trait]
impl FireHandler for Monitor {
    async fn fire(&self, key: TimerKey) -> anyhow::Result<()> {
        match key {
            TimerKey::Task(id) => {
                self.on_task_tick(id).await?;
            }
            TimerKey::Subscription(id) => {
                self.on_subscription_expired(id, Utc::now()).await?;
            }
        }
        Ok(())
    }
}
