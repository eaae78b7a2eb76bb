//! Slot scheduler: triggers generation for due slots and reports countdowns.
//!
//! Two background loops run between `start()` and `stop()`. The poll loop processes
//! due slots one at a time; the countdown loop logs minutes remaining for pending
//! slots, once per slot per distinct minute value.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::Settings;
use crate::orchestrator::{GenerationRequest, IdeaGenerator};
use crate::store::{now_epoch, GenerationSlot, IdeaStore, StoreError};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub countdown_interval: Duration,
    /// When set, `in_progress` sessions not updated for this long no longer block
    /// their slot. Unset, any `in_progress` session blocks.
    pub stale_session_after: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            countdown_interval: Duration::from_secs(60),
            stale_session_after: None,
        }
    }
}

impl From<&Settings> for SchedulerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            countdown_interval: settings.countdown_interval,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SlotOutcome {
    /// A generation for the slot is already running.
    Skipped,
    Generated { idea_id: i64, session_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotRun {
    pub slot_id: i64,
    pub outcome: SlotOutcome,
}

pub struct SlotScheduler {
    store: IdeaStore,
    generator: Arc<dyn IdeaGenerator>,
    config: SchedulerConfig,
    /// Last countdown minute value logged per slot.
    countdown: Mutex<HashMap<i64, i64>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SlotScheduler {
    pub fn new(store: IdeaStore, generator: Arc<dyn IdeaGenerator>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            generator,
            config,
            countdown: Mutex::new(HashMap::new()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().unwrap_or_else(|p| p.into_inner()).is_empty()
    }

    /// Spawn the poll and countdown loops. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if !tasks.is_empty() {
            return false;
        }
        self.shutdown.send_replace(false);

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if let Err(e) = this.process_due(now_epoch(), Some(now_epoch as fn() -> i64)).await {
                    tracing::warn!(error = %e, "slot poll failed");
                }
            }
        }));

        let this = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.countdown_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                this.countdown_tick(now_epoch()).await;
            }
        }));

        tracing::info!(
            poll_secs = self.config.poll_interval.as_secs(),
            countdown_secs = self.config.countdown_interval.as_secs(),
            "slot scheduler started"
        );
        true
    }

    /// Signal both loops and wait for them. A generation already running finishes first.
    pub async fn stop(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            tasks.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }
        self.shutdown.send_replace(true);
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        self.countdown
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        tracing::info!("slot scheduler stopped");
    }

    /// Process every enabled slot due at `now`, earliest first.
    ///
    /// Slot-level failures are logged and reported in the result; only the due-slot
    /// query itself can fail the tick.
    pub async fn process_due_slots(&self, now: i64) -> Result<Vec<SlotRun>, StoreError> {
        self.process_due(now, None).await
    }

    /// With a `clock`, each slot reads the time afresh so a long generation does not
    /// skew the next slot's schedule.
    async fn process_due(&self, now: i64, clock: Option<fn() -> i64>) -> Result<Vec<SlotRun>, StoreError> {
        let due = self.store.due_slots(now).await?;
        let mut runs = Vec::with_capacity(due.len());
        for slot in due {
            let slot_now = clock.map_or(now, |read| read().max(now));
            let outcome = self.run_slot(&slot, slot_now).await;
            runs.push(SlotRun {
                slot_id: slot.id,
                outcome,
            });
        }
        Ok(runs)
    }

    async fn run_slot(&self, slot: &GenerationSlot, now: i64) -> SlotOutcome {
        let since = self
            .config
            .stale_session_after
            .map(|after| now - after.as_secs() as i64);
        match self.store.has_in_progress_session(slot.id, since).await {
            Ok(true) => {
                tracing::info!(slot_id = slot.id, "generation already in progress, skipping slot");
                return SlotOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(slot_id = slot.id, error = %e, "in-progress check failed");
                return SlotOutcome::Failed {
                    error: e.to_string(),
                };
            }
        }

        let next_due = now + slot.interval_secs();
        if let Err(e) = self.store.advance_slot(slot.id, next_due).await {
            tracing::error!(slot_id = slot.id, error = %e, "failed to advance slot");
            return SlotOutcome::Failed {
                error: e.to_string(),
            };
        }

        let request = GenerationRequest::for_slot(slot.id, slot.profile_id);
        tracing::info!(
            slot_id = slot.id,
            session_id = %request.session_id,
            next_due_at = next_due,
            "slot due, generating"
        );
        match self.generator.generate(request).await {
            Ok(outcome) => {
                if let Err(e) = self.store.mark_slot_run(slot.id, now_epoch()).await {
                    tracing::warn!(slot_id = slot.id, error = %e, "failed to stamp slot run");
                }
                SlotOutcome::Generated {
                    idea_id: outcome.idea.id,
                    session_id: outcome.summary.session_id,
                }
            }
            Err(e) => {
                tracing::error!(slot_id = slot.id, code = e.code(), error = %e, "slot generation failed");
                SlotOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Log minutes remaining for each pending slot whose minute value changed.
    /// Returns the lines logged.
    pub async fn countdown_tick(&self, now: i64) -> Vec<String> {
        let pending = match self.store.pending_slots(now).await {
            Ok(slots) => slots,
            Err(e) => {
                tracing::warn!(error = %e, "countdown query failed");
                return Vec::new();
            }
        };

        let mut last = self.countdown.lock().unwrap_or_else(|p| p.into_inner());
        let live: HashSet<i64> = pending.iter().map(|s| s.id).collect();
        last.retain(|id, _| live.contains(id));

        let mut lines = Vec::new();
        for slot in &pending {
            let Some(due) = slot.next_due_at else {
                continue;
            };
            let minutes = minutes_until(due, now);
            if last.get(&slot.id) == Some(&minutes) {
                continue;
            }
            last.insert(slot.id, minutes);
            let line = format!(
                "Slot {}: next generation in {} minute{}",
                slot.id,
                minutes,
                if minutes == 1 { "" } else { "s" }
            );
            tracing::info!(slot_id = slot.id, minutes, "{line}");
            lines.push(line);
        }
        lines
    }
}

/// Whole minutes until `due`, rounded up.
fn minutes_until(due: i64, now: i64) -> i64 {
    let secs = (due - now).max(0);
    (secs + 59) / 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{GenerationError, GenerationOutcome};
    use crate::session::SessionStatus;
    use crate::store::NewSlot;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl IdeaGenerator for Unreachable {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
            Err(GenerationError::Config("not configured".into()))
        }
    }

    fn scheduler(store: IdeaStore) -> SlotScheduler {
        SlotScheduler::new(store, Arc::new(Unreachable), SchedulerConfig::default())
    }

    #[test]
    fn minutes_round_up() {
        assert_eq!(minutes_until(1_000, 1_000), 0);
        assert_eq!(minutes_until(1_001, 1_000), 1);
        assert_eq!(minutes_until(1_060, 1_000), 1);
        assert_eq!(minutes_until(1_061, 1_000), 2);
    }

    #[tokio::test]
    async fn countdown_logs_once_per_minute_value() {
        let store = IdeaStore::in_memory().unwrap();
        let now = 10_000;
        let slot_id = store
            .create_slot(NewSlot {
                first_due_at: Some(now + 150),
                ..NewSlot::every(5)
            })
            .await
            .unwrap();
        let sched = scheduler(store);

        assert_eq!(
            sched.countdown_tick(now).await,
            vec![format!("Slot {slot_id}: next generation in 3 minutes")]
        );
        assert!(sched.countdown_tick(now + 10).await.is_empty());
        assert_eq!(
            sched.countdown_tick(now + 100).await,
            vec![format!("Slot {slot_id}: next generation in 1 minute")]
        );
    }

    #[tokio::test]
    async fn failed_generation_still_advances_the_slot() {
        let store = IdeaStore::in_memory().unwrap();
        let now = now_epoch();
        let slot_id = store
            .create_slot(NewSlot {
                first_due_at: Some(now - 5),
                ..NewSlot::every(10)
            })
            .await
            .unwrap();
        let sched = scheduler(store.clone());

        let runs = sched.process_due_slots(now).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert!(matches!(runs[0].outcome, SlotOutcome::Failed { .. }));

        let slot = store.get_slot(slot_id).await.unwrap();
        assert_eq!(slot.next_due_at, Some(now + 600));
        assert_eq!(slot.last_run_at, None);
    }

    fn later_clock() -> i64 {
        50_000
    }

    #[tokio::test]
    async fn loop_driven_slots_schedule_from_the_current_time() {
        let store = IdeaStore::in_memory().unwrap();
        let slot_id = store
            .create_slot(NewSlot {
                first_due_at: Some(9_000),
                ..NewSlot::every(10)
            })
            .await
            .unwrap();
        let sched = scheduler(store.clone());

        let runs = sched
            .process_due(10_000, Some(later_clock as fn() -> i64))
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        let slot = store.get_slot(slot_id).await.unwrap();
        assert_eq!(slot.next_due_at, Some(50_000 + 600));
    }

    #[tokio::test]
    async fn stale_cutoff_releases_only_when_configured() {
        let store = IdeaStore::in_memory().unwrap();
        let now = now_epoch();
        let slot_id = store
            .create_slot(NewSlot {
                first_due_at: Some(now - 5),
                ..NewSlot::every(10)
            })
            .await
            .unwrap();
        store
            .create_session("hung", Some(slot_id), SessionStatus::InProgress)
            .await
            .unwrap();
        let two_hours_later = now + 2 * 60 * 60;

        let strict = scheduler(store.clone());
        let runs = strict.process_due_slots(two_hours_later).await.unwrap();
        assert_eq!(runs[0].outcome, SlotOutcome::Skipped);

        let lenient = SlotScheduler::new(
            store.clone(),
            Arc::new(Unreachable),
            SchedulerConfig {
                stale_session_after: Some(Duration::from_secs(60 * 60)),
                ..SchedulerConfig::default()
            },
        );
        let runs = lenient.process_due_slots(two_hours_later).await.unwrap();
        assert!(matches!(runs[0].outcome, SlotOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let sched = Arc::new(scheduler(IdeaStore::in_memory().unwrap()));
        assert!(sched.start());
        assert!(!sched.start());
        assert!(sched.is_running());
        sched.stop().await;
        assert!(!sched.is_running());
        sched.stop().await;
    }
}
