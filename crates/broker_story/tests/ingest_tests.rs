//! Event ingestor routing, idempotent replay, and audit sequencing.

use broker_bus::{Bus, MemoryBus};
use broker_core::{subjects, StoryConfig};
use broker_story::{EventIngestor, ProgressState, SqliteStoryRepo, StoryRepo, StoryStateManager};
use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

struct Fixture {
    ingestor: EventIngestor,
    manager: Arc<StoryStateManager>,
    repo: Arc<SqliteStoryRepo>,
    bus: Arc<MemoryBus>,
}

async fn fixture() -> Fixture {
    let repo = Arc::new(
        SqliteStoryRepo::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory repo"),
    );
    let bus = Arc::new(MemoryBus::new());
    let manager = Arc::new(StoryStateManager::new(
        repo.clone(),
        bus.clone(),
        StoryConfig::default().families,
    ));
    let ingestor = EventIngestor::new(manager.clone(), bus.clone());
    Fixture {
        ingestor,
        manager,
        repo,
        bus,
    }
}

#[tokio::test]
async fn arc_beat_updates_progress_with_heuristic() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    f.ingestor
        .handle_event(
            "arc.beat.reached",
            json!({
                "player_id": player.to_string(),
                "arc_id": "broker_ascension",
                "beat_id": "broker_ascension_climax",
                "arc_role": "main_arc",
            }),
        )
        .await
        .unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    let arc = &snapshot.arc_progress[0];
    assert_eq!(arc.arc_id, "broker_ascension");
    assert_eq!(arc.progress_state, ProgressState::Late);
    assert_eq!(arc.last_beat_id.as_deref(), Some("broker_ascension_climax"));
}

#[tokio::test]
async fn explicit_progress_state_beats_heuristic() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    f.ingestor
        .handle_event(
            "arc.beat.reached",
            json!({
                "player_id": player.to_string(),
                "arc_id": "debt_of_flesh",
                "beat_id": "intro_to_the_trade",
                "progress_state": "mid",
            }),
        )
        .await
        .unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    assert_eq!(snapshot.arc_progress[0].progress_state, ProgressState::Mid);
}

#[tokio::test]
async fn arc_completed_publishes_completion_event() {
    let f = fixture().await;
    let player = Uuid::new_v4();
    let mut sub = f
        .bus
        .subscribe(subjects::STORY_ARC_COMPLETED, None)
        .await
        .unwrap();

    f.ingestor
        .handle_event(
            "arc.completed",
            json!({
                "player_id": player.to_string(),
                "arc_id": "first_harvest",
            }),
        )
        .await
        .unwrap();

    let msg = sub.next().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload["arc_id"], "first_harvest");

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    assert_eq!(
        snapshot.arc_progress[0].progress_state,
        ProgressState::Completed
    );
}

#[tokio::test]
async fn moral_choice_applies_clamped_score_once() {
    let f = fixture().await;
    let player = Uuid::new_v4();
    f.manager.get_snapshot(player).await.unwrap();

    f.ingestor
        .handle_event(
            "moral.choice",
            json!({
                "player_id": player.to_string(),
                "decision_id": "spare_the_informant",
                "choice": "spare",
                "moral_weight": 0.4,
            }),
        )
        .await
        .unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    assert!((snapshot.surgeon_butcher_score - 0.4).abs() < 1e-9);
    assert_eq!(snapshot.recent_decisions.len(), 1);
}

#[tokio::test]
async fn player_death_and_soul_echo_update_debt_of_flesh() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    for _ in 0..2 {
        f.ingestor
            .handle_event(
                "player.death",
                json!({"player_id": player.to_string(), "cause": "harvest gone wrong"}),
            )
            .await
            .unwrap();
    }
    f.ingestor
        .handle_event(
            "soul.echo.encounter",
            json!({
                "player_id": player.to_string(),
                "echo_id": "echo_77",
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await
        .unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    assert_eq!(snapshot.debt_of_flesh_state["death_count"], 2);
    assert_eq!(
        snapshot.debt_of_flesh_state["soul_echoes"]
            .as_array()
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn relationship_change_applies_delta() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    f.manager
        .update_relationship(
            player,
            "npc_chirurgeon",
            broker_story::EntityType::Npc,
            Some(10.0),
            None,
            None,
        )
        .await
        .unwrap();

    f.ingestor
        .handle_event(
            "relationship.changed",
            json!({
                "player_id": player.to_string(),
                "entity_id": "npc_chirurgeon",
                "entity_type": "npc",
                "old_score": 10.0,
                "new_score": 35.0,
                "reason": "paid a debt in kind",
            }),
        )
        .await
        .unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    assert_eq!(snapshot.relationships[0].score, 35.0);
    assert_eq!(
        snapshot.relationships[0].last_interaction.as_deref(),
        Some("paid a debt in kind")
    );
}

#[tokio::test]
async fn replayed_event_is_a_no_op() {
    let f = fixture().await;
    let player = Uuid::new_v4();
    let event = json!({
        "player_id": player.to_string(),
        "event_id": "evt-123",
        "decision_id": "first_kill",
        "choice": "butcher",
        "moral_weight": -0.3,
    });

    f.ingestor
        .handle_event("decision.made", event.clone())
        .await
        .unwrap();
    f.ingestor.handle_event("decision.made", event).await.unwrap();

    let snapshot = f.manager.get_snapshot(player).await.unwrap();
    // Applied exactly once.
    assert!((snapshot.surgeon_butcher_score - (-0.3)).abs() < 1e-9);
    assert_eq!(snapshot.recent_decisions.len(), 1);

    // Exactly one audit row.
    let events = f
        .repo
        .fetch_events_since(player, Utc::now() - Duration::hours(1), None)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence_num, 1);
}

#[tokio::test]
async fn unroutable_player_event_is_audited_generically() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    f.ingestor
        .handle_event(
            "organ.market.opened",
            json!({"player_id": player.to_string(), "market": "night_bazaar"}),
        )
        .await
        .unwrap();

    let events = f
        .repo
        .fetch_events_since(player, Utc::now() - Duration::hours(1), None)
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "organ.market.opened");
}

#[tokio::test]
async fn malformed_events_are_dropped_without_killing_the_loop() {
    let f = fixture().await;

    // Missing player id.
    let err = f
        .ingestor
        .handle_event("decision.made", json!({"decision_id": "x"}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("player_id"));

    // Bad payload bytes at the message level.
    let msg = broker_bus::BusMessage {
        subject: "story.events.decision.made".to_string(),
        payload: b"not json".to_vec(),
        reply: None,
    };
    assert!(f.ingestor.handle_message(&msg).await.is_err());
}

#[tokio::test]
async fn audit_sequence_stays_gap_free_across_event_types() {
    let f = fixture().await;
    let player = Uuid::new_v4();

    for i in 0..4 {
        f.ingestor
            .handle_event(
                "quest.completed",
                json!({
                    "player_id": player.to_string(),
                    "quest_id": format!("side_{}", i),
                    "quest_type": "side",
                }),
            )
            .await
            .unwrap();
    }
    f.ingestor
        .handle_event(
            "player.death",
            json!({"player_id": player.to_string()}),
        )
        .await
        .unwrap();

    let events = f
        .repo
        .fetch_events_since(player, Utc::now() - Duration::hours(1), None)
        .await
        .unwrap();
    let seqs: Vec<i64> = events.iter().map(|e| e.sequence_num).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn dead_npc_interaction_raises_conflict_alert() {
    let f = fixture().await;
    let player = Uuid::new_v4();
    let mut sub = f
        .bus
        .subscribe(subjects::STORY_CONFLICT_DETECTED, None)
        .await
        .unwrap();

    // Fresh interaction with the soon-to-be-dead NPC.
    f.manager
        .update_relationship(
            player,
            "npc_lender",
            broker_story::EntityType::Npc,
            Some(5.0),
            None,
            Some("negotiated a loan".to_string()),
        )
        .await
        .unwrap();

    f.ingestor
        .handle_event(
            "world.state.changed",
            json!({
                "player_id": player.to_string(),
                "changes": {"npc_deaths": ["npc_lender"]},
            }),
        )
        .await
        .unwrap();

    let msg = sub.next().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload["conflict"]["type"], "dead_npc_interaction");
    assert_eq!(payload["conflict"]["npc_id"], "npc_lender");
}
