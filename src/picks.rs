// Daily pick generation and recency queries.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::{DailyPick, Database};
use crate::error::{ServiceError, ServiceResult};
use crate::metrics;
use crate::sampler::SpeciesSampler;
use crate::scheduler::RotationJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotStatus {
    Created,
    Failed,
}

/// What happened to one game slot during a batch.
#[derive(Debug, Clone, Serialize)]
pub struct SlotOutcome {
    pub game_id: i64,
    pub status: SlotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pick: Option<DailyPick>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SlotOutcome {
    pub fn is_created(&self) -> bool {
        self.status == SlotStatus::Created
    }
}

/// Creates one daily pick per game slot.
pub struct PickGenerator {
    db: Arc<Database>,
    sampler: Arc<dyn SpeciesSampler>,
    game_slots: u32,
    // Manual and scheduled batches never interleave.
    batch_lock: Mutex<()>,
}

impl PickGenerator {
    pub fn new(db: Arc<Database>, sampler: Arc<dyn SpeciesSampler>, game_slots: u32) -> Self {
        Self {
            db,
            sampler,
            game_slots,
            batch_lock: Mutex::new(()),
        }
    }

    /// Sample and persist a pick for every slot `1..=K`, in order. A failing
    /// slot is recorded and the batch moves on; exactly K outcomes come back.
    pub async fn generate_all(&self) -> Vec<SlotOutcome> {
        let _guard = self.batch_lock.lock().await;
        let started = Instant::now();

        let mut outcomes = Vec::with_capacity(self.game_slots as usize);
        for game_id in 1..=i64::from(self.game_slots) {
            let slot_label = game_id.to_string();
            match self.generate_one(game_id).await {
                Ok(pick) => {
                    tracing::info!(
                        "New daily pokémon (game_id: {game_id}) saved: {}",
                        pick.pokemon.get("name").and_then(|n| n.as_str()).unwrap_or("?")
                    );
                    metrics::DAILY_PICKS_CREATED_TOTAL
                        .with_label_values(&[slot_label.as_str()])
                        .inc();
                    outcomes.push(SlotOutcome {
                        game_id,
                        status: SlotStatus::Created,
                        pick: Some(pick),
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to create daily pokémon for game_id {game_id}: {e}");
                    metrics::DAILY_PICKS_FAILED_TOTAL
                        .with_label_values(&[slot_label.as_str()])
                        .inc();
                    outcomes.push(SlotOutcome {
                        game_id,
                        status: SlotStatus::Failed,
                        pick: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        metrics::PICK_BATCH_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        outcomes
    }

    async fn generate_one(&self, game_id: i64) -> ServiceResult<DailyPick> {
        let species = self.sampler.sample().await?;
        self.db
            .insert_daily_pick(game_id, &species.data, &Local::now())
            .await
    }
}

#[async_trait]
impl RotationJob for PickGenerator {
    async fn rotate(&self) -> Vec<SlotOutcome> {
        self.generate_all().await
    }
}

/// Answers "latest" and "previous" for a game slot. Any numeric slot may be
/// queried; one without picks, configured or not, is simply not found.
#[derive(Clone)]
pub struct PickQuery {
    db: Arc<Database>,
}

impl PickQuery {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// The most recent pick for the slot.
    pub async fn latest(&self, game_id: i64) -> ServiceResult<DailyPick> {
        self.nth_most_recent(game_id, 0).await
    }

    /// The pick right before the most recent one. This is "yesterday" only
    /// when exactly one pick was generated per day.
    pub async fn previous(&self, game_id: i64) -> ServiceResult<DailyPick> {
        self.nth_most_recent(game_id, 1).await
    }

    async fn nth_most_recent(&self, game_id: i64, n: usize) -> ServiceResult<DailyPick> {
        let mut picks = self.db.recent_daily_picks(game_id, n as i64 + 1).await?;
        if picks.len() <= n {
            return Err(ServiceError::NotFound(format!(
                "Not enough daily pokémon records for game_id {game_id}"
            )));
        }
        Ok(picks.swap_remove(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Species;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn test_db() -> Arc<Database> {
        Arc::new(
            Database::new("sqlite::memory:", Duration::from_secs(10))
                .await
                .unwrap(),
        )
    }

    /// Returns species in sequence, failing on the listed call numbers (1-based).
    struct ScriptedSampler {
        calls: AtomicUsize,
        fail_on: Vec<usize>,
    }

    #[async_trait]
    impl SpeciesSampler for ScriptedSampler {
        async fn sample(&self) -> ServiceResult<Species> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on.contains(&call) {
                return Err(ServiceError::StoreUnavailable("forced failure".into()));
            }
            let id = call as i64;
            Ok(Species {
                id,
                name: format!("mon-{id}"),
                evolution_chain_id: None,
                data: json!({ "id": id, "name": format!("mon-{id}") }),
            })
        }
    }

    fn scripted(fail_on: Vec<usize>) -> Arc<dyn SpeciesSampler> {
        Arc::new(ScriptedSampler {
            calls: AtomicUsize::new(0),
            fail_on,
        })
    }

    #[tokio::test]
    async fn test_generate_all_creates_one_pick_per_slot() {
        let db = test_db().await;
        let generator = PickGenerator::new(db.clone(), scripted(vec![]), 3);

        let outcomes = generator.generate_all().await;
        assert_eq!(outcomes.len(), 3);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.game_id, i as i64 + 1);
            assert!(outcome.is_created());
            assert!(outcome.error.is_none());
        }

        for game_id in 1..=3 {
            let picks = db.recent_daily_picks(game_id, 10).await.unwrap();
            assert_eq!(picks.len(), 1);
            assert_eq!(picks[0].pokemon["id"], game_id);
        }
    }

    #[tokio::test]
    async fn test_one_failing_slot_does_not_abort_batch() {
        let db = test_db().await;
        let generator = PickGenerator::new(db.clone(), scripted(vec![2]), 3);

        let outcomes = generator.generate_all().await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_created());
        assert_eq!(outcomes[1].status, SlotStatus::Failed);
        assert!(outcomes[1].error.as_deref().unwrap().contains("forced failure"));
        assert!(outcomes[1].pick.is_none());
        assert!(outcomes[2].is_created());

        assert_eq!(db.recent_daily_picks(1, 10).await.unwrap().len(), 1);
        assert!(db.recent_daily_picks(2, 10).await.unwrap().is_empty());
        assert_eq!(db.recent_daily_picks(3, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_slot_count_is_configuration() {
        let db = test_db().await;
        let generator = PickGenerator::new(db, scripted(vec![]), 5);
        let outcomes = generator.generate_all().await;
        let slots: Vec<i64> = outcomes.iter().map(|o| o.game_id).collect();
        assert_eq!(slots, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_outcome_serialization() {
        let db = test_db().await;
        let generator = PickGenerator::new(db, scripted(vec![1]), 2);
        let outcomes = generator.generate_all().await;
        let value = serde_json::to_value(&outcomes).unwrap();

        assert_eq!(value[0]["status"], "failed");
        assert!(value[0].get("pick").is_none());
        assert_eq!(value[1]["status"], "created");
        assert_eq!(value[1]["pick"]["game_id"], 2);
        assert!(value[1]["pick"].get("seq").is_none());
    }

    #[tokio::test]
    async fn test_latest_and_previous() {
        let db = test_db().await;
        let query = PickQuery::new(db.clone());

        assert!(matches!(query.latest(1).await, Err(ServiceError::NotFound(_))));
        assert!(matches!(query.previous(1).await, Err(ServiceError::NotFound(_))));

        let t1 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap();
        db.insert_daily_pick(1, &json!({ "id": 1 }), &t1).await.unwrap();

        assert_eq!(query.latest(1).await.unwrap().pokemon["id"], 1);
        assert!(matches!(query.previous(1).await, Err(ServiceError::NotFound(_))));

        db.insert_daily_pick(1, &json!({ "id": 2 }), &t2).await.unwrap();
        let latest = query.latest(1).await.unwrap();
        assert_eq!(latest.pokemon["id"], 2);
        assert_eq!(latest.date, t2.to_rfc3339());
        assert_eq!(query.previous(1).await.unwrap().pokemon["id"], 1);

        // Other slots are unaffected.
        assert!(matches!(query.latest(2).await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_slots_outside_current_count_are_not_found_or_readable() {
        let db = test_db().await;
        let query = PickQuery::new(db.clone());
        assert!(matches!(query.latest(0).await, Err(ServiceError::NotFound(_))));
        assert!(matches!(query.previous(4).await, Err(ServiceError::NotFound(_))));

        // Picks written while K was 5 survive K being lowered to 3.
        let generator = PickGenerator::new(db, scripted(vec![]), 5);
        generator.generate_all().await;
        assert_eq!(query.latest(5).await.unwrap().pokemon["id"], 5);
    }
}
