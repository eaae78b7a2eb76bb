use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ideation_harness::idea::IdeaRecord;
use ideation_harness::orchestrator::{
    GenerationError, GenerationOutcome, GenerationRequest, GenerationSummary, IdeaGenerator,
};
use ideation_harness::repair::parse_idea;
use ideation_harness::scheduler::{SchedulerConfig, SlotOutcome, SlotScheduler};
use ideation_harness::scoring::WeightTable;
use ideation_harness::session::SessionStatus;
use ideation_harness::store::{now_epoch, IdeaStore, NewSlot};
use serde_json::json;

/// Records each request's slot id; fails when `fail` is set.
struct RecordingGenerator {
    seen: Mutex<Vec<Option<i64>>>,
    fail: bool,
}

impl RecordingGenerator {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            fail,
        })
    }

    fn seen(&self) -> Vec<Option<i64>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdeaGenerator for RecordingGenerator {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationOutcome, GenerationError> {
        self.seen.lock().unwrap().push(request.slot_id);
        if self.fail {
            return Err(GenerationError::ExternalService {
                provider: "openrouter".into(),
                message: "HTTP 503".into(),
            });
        }
        let raw = json!({
            "name": "Slotted",
            "domain": "Logistics",
            "quickSummary": "Route batching",
            "concreteExample": {
                "currentState": "a",
                "yourSolution": "b",
                "keyImprovement": "c"
            },
            "evaluation": {
                "marketSize": {"score": 6, "questions": ["Who buys?"]}
            }
        })
        .to_string();
        let mut idea = IdeaRecord::from_draft(
            parse_idea(&raw, None).unwrap(),
            &WeightTable::default(),
            "Unbundling",
            raw.clone(),
            "prompt",
        );
        idea.id = 42;
        let summary = GenerationSummary {
            session_id: request.session_id.clone(),
            idea_id: idea.id,
            name: idea.name.clone(),
            score: idea.score,
            framework: idea.framework.clone(),
            similar: None,
            prompt_chars: 6,
            api_ms: 1,
            duration_ms: 2,
            cost_nanodollars: 0,
        };
        Ok(GenerationOutcome {
            idea,
            logs: Vec::new(),
            summary,
        })
    }
}

fn temp_store() -> IdeaStore {
    let dir = tempfile::tempdir().unwrap();
    let store = IdeaStore::new(dir.path().join("slots.sqlite")).unwrap();
    std::mem::forget(dir);
    store
}

async fn slot_due_at(store: &IdeaStore, due: i64, interval_minutes: i64) -> i64 {
    store
        .create_slot(NewSlot {
            first_due_at: Some(due),
            ..NewSlot::every(interval_minutes)
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn in_progress_session_skips_slot_without_rescheduling() {
    let store = temp_store();
    let now = now_epoch();
    let slot_id = slot_due_at(&store, now - 10, 15).await;
    store
        .create_session("running", Some(slot_id), SessionStatus::InProgress)
        .await
        .unwrap();

    let generator = RecordingGenerator::new(false);
    let sched = SlotScheduler::new(store.clone(), generator.clone(), SchedulerConfig::default());

    for tick in 0..2 {
        let runs = sched.process_due_slots(now + tick).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].slot_id, slot_id);
        assert_eq!(runs[0].outcome, SlotOutcome::Skipped);
    }

    assert!(generator.seen().is_empty());
    let slot = store.get_slot(slot_id).await.unwrap();
    assert_eq!(slot.next_due_at, Some(now - 10));
    assert_eq!(slot.last_run_at, None);
}

#[tokio::test]
async fn long_running_session_keeps_blocking_the_slot() {
    let store = temp_store();
    let now = now_epoch();
    let slot_id = slot_due_at(&store, now - 10, 15).await;
    store
        .create_session("slow", Some(slot_id), SessionStatus::InProgress)
        .await
        .unwrap();

    let generator = RecordingGenerator::new(false);
    let sched = SlotScheduler::new(store.clone(), generator.clone(), SchedulerConfig::default());

    let runs = sched.process_due_slots(now + 3_700).await.unwrap();
    assert_eq!(runs[0].outcome, SlotOutcome::Skipped);
    assert!(generator.seen().is_empty());
    assert_eq!(store.get_slot(slot_id).await.unwrap().next_due_at, Some(now - 10));
}

#[tokio::test]
async fn finished_session_no_longer_blocks_the_slot() {
    let store = temp_store();
    let now = now_epoch();
    let slot_id = slot_due_at(&store, now - 10, 15).await;
    store
        .create_session("done", Some(slot_id), SessionStatus::InProgress)
        .await
        .unwrap();
    store
        .set_session_status("done", SessionStatus::Completed, Some(1))
        .await
        .unwrap();

    let generator = RecordingGenerator::new(false);
    let sched = SlotScheduler::new(store.clone(), generator.clone(), SchedulerConfig::default());

    let runs = sched.process_due_slots(now).await.unwrap();
    assert!(matches!(runs[0].outcome, SlotOutcome::Generated { idea_id: 42, .. }));
    assert_eq!(generator.seen(), vec![Some(slot_id)]);
}

#[tokio::test]
async fn due_slots_run_in_due_order_and_advance() {
    let store = temp_store();
    let now = now_epoch();
    let later = slot_due_at(&store, now - 50, 10).await;
    let earlier = slot_due_at(&store, now - 100, 30).await;
    let future = slot_due_at(&store, now + 600, 10).await;
    let disabled = slot_due_at(&store, now - 500, 10).await;
    store.set_slot_enabled(disabled, false).await.unwrap();

    let generator = RecordingGenerator::new(false);
    let sched = SlotScheduler::new(store.clone(), generator.clone(), SchedulerConfig::default());

    let runs = sched.process_due_slots(now).await.unwrap();
    assert_eq!(
        runs.iter().map(|r| r.slot_id).collect::<Vec<_>>(),
        vec![earlier, later]
    );
    assert!(runs
        .iter()
        .all(|r| matches!(r.outcome, SlotOutcome::Generated { idea_id: 42, .. })));
    assert_eq!(generator.seen(), vec![Some(earlier), Some(later)]);

    let earlier_slot = store.get_slot(earlier).await.unwrap();
    assert_eq!(earlier_slot.next_due_at, Some(now + 30 * 60));
    assert!(earlier_slot.last_run_at.is_some());
    let later_slot = store.get_slot(later).await.unwrap();
    assert_eq!(later_slot.next_due_at, Some(now + 10 * 60));

    assert_eq!(store.get_slot(future).await.unwrap().next_due_at, Some(now + 600));
    assert_eq!(store.get_slot(disabled).await.unwrap().next_due_at, Some(now - 500));

    // Nothing is due on the next tick.
    assert!(sched.process_due_slots(now + 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_generation_is_contained_and_slot_stays_advanced() {
    let store = temp_store();
    let now = now_epoch();
    let first = slot_due_at(&store, now - 20, 5).await;
    let second = slot_due_at(&store, now - 10, 5).await;

    let generator = RecordingGenerator::new(true);
    let sched = SlotScheduler::new(store.clone(), generator.clone(), SchedulerConfig::default());

    let runs = sched.process_due_slots(now).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs
        .iter()
        .all(|r| matches!(r.outcome, SlotOutcome::Failed { .. })));
    assert_eq!(generator.seen(), vec![Some(first), Some(second)]);

    let slot = store.get_slot(first).await.unwrap();
    assert_eq!(slot.next_due_at, Some(now + 300));
    assert_eq!(slot.last_run_at, None);
}

#[tokio::test]
async fn background_loop_runs_due_slot_and_stops_cleanly() {
    let store = temp_store();
    let slot_id = slot_due_at(&store, now_epoch() - 5, 60).await;

    let generator = RecordingGenerator::new(false);
    let sched = Arc::new(SlotScheduler::new(
        store.clone(),
        generator.clone(),
        SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            countdown_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
    ));

    assert!(sched.start());
    for _ in 0..250 {
        if !generator.seen().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    sched.stop().await;

    assert!(!sched.is_running());
    assert_eq!(generator.seen(), vec![Some(slot_id)]);
    assert!(store.get_slot(slot_id).await.unwrap().last_run_at.is_some());
}
