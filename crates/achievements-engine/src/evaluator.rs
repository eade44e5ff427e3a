use std::sync::{Arc, Mutex, PoisonError};

use achievements_core::{
    now_utc, Achievement, AchievementCatalog, AchievementId, AchievementKind, AchievementsError,
    EngineConfig, EventPayload, NotificationQueue, PendingNotification, PointsLedger,
    ProgressFilter, ProgressKey, ProgressRecord, ProgressSignal, ProgressStatus, ProgressStore,
    ThresholdCriterion, UnlockCriterion, UserId, WriteOutcome,
};
use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::extensions::SignalSink;

/// Per-(user, achievement) mutual exclusion.
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<ProgressKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `key`.
    ///
    /// # Errors
    /// Returns whatever `f` returns.
    pub fn with_key<T>(&self, key: ProgressKey, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = Arc::clone(self.locks.entry(key).or_default().value());
        let result = {
            // The guarded value is `()`, so a poisoned lock carries no bad state.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        self.locks
            .remove_if(&key, |_, entry| Arc::strong_count(entry) == 1);
        result
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// What a single evaluation did to a progress record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    Advanced {
        progress_count: u64,
    },
    Unlocked {
        progress_count: u64,
        #[serde(with = "time::serde::rfc3339")]
        unlocked_at: OffsetDateTime,
    },
    AlreadyUnlocked,
    /// The achievement cannot be advanced by signals.
    Ignored,
}

#[derive(Clone, Copy)]
enum Mode<'a> {
    Signal(&'a EventPayload),
    Override,
}

/// Locked to unlocked state machine over the progress store.
pub struct UnlockEvaluator {
    store: Arc<dyn ProgressStore>,
    queue: Arc<dyn NotificationQueue>,
    catalog: Arc<dyn AchievementCatalog>,
    ledger: Option<Arc<dyn PointsLedger>>,
    criterion: Arc<dyn UnlockCriterion>,
    locks: KeyedLocks,
    award_points: bool,
}

impl UnlockEvaluator {
    #[must_use]
    pub fn new(
        store: Arc<dyn ProgressStore>,
        queue: Arc<dyn NotificationQueue>,
        catalog: Arc<dyn AchievementCatalog>,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            ledger: None,
            criterion: Arc::new(ThresholdCriterion),
            locks: KeyedLocks::new(),
            award_points: true,
        }
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn PointsLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn with_criterion(mut self, criterion: Arc<dyn UnlockCriterion>) -> Self {
        self.criterion = criterion;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.award_points = config.award_points;
        self
    }

    /// Applies a signal to every achievement its trigger key advances.
    ///
    /// Failures are logged per achievement and never returned.
    pub fn handle_signal(&self, signal: &ProgressSignal) -> Vec<(AchievementId, Transition)> {
        let achievements = match self.catalog.achievements_for_trigger(&signal.trigger_key) {
            Ok(achievements) => achievements,
            Err(err) => {
                error!(
                    user_id = %signal.user_id,
                    trigger = %signal.trigger_key,
                    error = %err,
                    "failed to resolve achievements for trigger; signal dropped"
                );
                return Vec::new();
            }
        };

        let mut outcomes = Vec::new();
        for achievement in achievements
            .iter()
            .filter(|achievement| achievement.advances_on(&signal.trigger_key))
        {
            let key = ProgressKey::new(signal.user_id, achievement.id);
            match self.transition(key, achievement, Mode::Signal(&signal.payload)) {
                Ok(transition) => outcomes.push((achievement.id, transition)),
                Err(err) => error!(
                    user_id = %signal.user_id,
                    achievement_id = %achievement.id,
                    error = %err,
                    "progress update failed; signal dropped"
                ),
            }
        }

        if outcomes.is_empty() {
            debug!(trigger = %signal.trigger_key, "signal advanced no achievements");
        }
        outcomes
    }

    /// Applies one signal to one achievement through its criterion.
    ///
    /// # Errors
    /// Returns [`AchievementsError::UnknownAchievement`] when the catalog has
    /// no definition, or the store error when persistence fails.
    pub fn evaluate_signal(
        &self,
        user_id: UserId,
        achievement_id: AchievementId,
        payload: &EventPayload,
    ) -> Result<Transition> {
        let achievement = self.require_achievement(achievement_id)?;
        if achievement.kind == AchievementKind::Award {
            return Ok(Transition::Ignored);
        }
        self.transition(
            ProgressKey::new(user_id, achievement_id),
            &achievement,
            Mode::Signal(payload),
        )
    }

    /// Unlocks without consulting the criterion. Idempotent.
    ///
    /// # Errors
    /// Returns [`AchievementsError::UnknownAchievement`] when the catalog has
    /// no definition, or the store error when persistence fails.
    pub fn force_unlock(
        &self,
        user_id: UserId,
        achievement_id: AchievementId,
    ) -> Result<Transition> {
        let achievement = self.require_achievement(achievement_id)?;
        let transition = self.transition(
            ProgressKey::new(user_id, achievement_id),
            &achievement,
            Mode::Override,
        )?;
        info!(
            user_id = %user_id,
            achievement_id = %achievement_id,
            ?transition,
            "administrative unlock"
        );
        Ok(transition)
    }

    /// Removes the user's record and any undelivered notification for it.
    /// Returns `false` when there was nothing to remove.
    ///
    /// # Errors
    /// Returns the store error when deletion fails.
    pub fn revoke(&self, user_id: UserId, achievement_id: AchievementId) -> Result<bool> {
        let key = ProgressKey::new(user_id, achievement_id);
        self.locks.with_key(key, || {
            let removed = self.store.delete(key)?;
            let cancelled = self.queue.cancel(key)?;
            info!(
                user_id = %user_id,
                achievement_id = %achievement_id,
                removed,
                cancelled,
                "achievement revoked"
            );
            Ok(removed)
        })
    }

    /// # Errors
    /// Returns the store error when the query fails.
    pub fn list_progress(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>> {
        self.store.list(filter)
    }

    fn require_achievement(&self, id: AchievementId) -> Result<Achievement> {
        match self.catalog.get_achievement(id)? {
            Some(achievement) => Ok(achievement),
            None => {
                warn!(achievement_id = %id, "unknown achievement");
                Err(anyhow!(AchievementsError::UnknownAchievement(id)))
            }
        }
    }

    fn transition(
        &self,
        key: ProgressKey,
        achievement: &Achievement,
        mode: Mode<'_>,
    ) -> Result<Transition> {
        self.locks.with_key(key, || {
            let now = now_utc();
            let mut record = self
                .store
                .get(key)?
                .unwrap_or_else(|| ProgressRecord::locked(key, now));

            if record.is_unlocked() {
                return Ok(Transition::AlreadyUnlocked);
            }

            let satisfied = match mode {
                Mode::Signal(payload) => {
                    record.progress_count = record.progress_count.saturating_add(1);
                    self.criterion
                        .is_satisfied(record.progress_count, payload, achievement)
                }
                Mode::Override => true,
            };
            record.updated_at = now;

            if !satisfied {
                return match self.store.upsert(&record)? {
                    WriteOutcome::Written => Ok(Transition::Advanced {
                        progress_count: record.progress_count,
                    }),
                    WriteOutcome::StatusConflict => Ok(Transition::AlreadyUnlocked),
                };
            }

            record.status = ProgressStatus::Unlocked;
            record.unlocked_at = Some(now);
            if self.store.upsert(&record)? == WriteOutcome::StatusConflict {
                return Ok(Transition::AlreadyUnlocked);
            }

            info!(
                user_id = %key.user_id,
                achievement_id = %key.achievement_id,
                progress_count = record.progress_count,
                "achievement unlocked"
            );

            if let Err(err) = self.queue.enqueue(&PendingNotification::new(key, now)) {
                error!(key = %key, error = %err, "failed to queue unlock notification");
            }
            self.award(key.user_id, achievement);

            Ok(Transition::Unlocked {
                progress_count: record.progress_count,
                unlocked_at: now,
            })
        })
    }

    fn award(&self, user_id: UserId, achievement: &Achievement) {
        if !self.award_points || achievement.points == 0 {
            return;
        }
        let Some(ledger) = &self.ledger else {
            return;
        };
        if let Err(err) = ledger.award_points(user_id, achievement.points) {
            warn!(
                user_id = %user_id,
                achievement_id = %achievement.id,
                error = %err,
                "failed to award points"
            );
        }
    }
}

impl SignalSink for UnlockEvaluator {
    fn signal(&self, signal: ProgressSignal) {
        let outcomes = self.handle_signal(&signal);
        debug!(
            user_id = %signal.user_id,
            trigger = %signal.trigger_key,
            evaluated = outcomes.len(),
            "signal handled"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, InProcessBus};
    use crate::channel::MemoryNotificationQueue;
    use crate::extensions::ExtensionRegistry;
    use achievements_core::HostEvent;
    use achievements_store_sqlite::SqliteAchievementStore;
    use anyhow::bail;
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    struct Fixture {
        store: Arc<SqliteAchievementStore>,
        queue: Arc<MemoryNotificationQueue>,
        evaluator: UnlockEvaluator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(must(SqliteAchievementStore::open(Path::new(":memory:"))));
        must(store.migrate());
        must(store.upsert_achievement(&Achievement {
            id: AchievementId(1),
            title: "Regular".to_string(),
            image_url: None,
            points: 20,
            kind: AchievementKind::Event,
            trigger_keys: vec!["post_published".to_string()],
            target: 2,
        }));
        must(store.upsert_achievement(&Achievement {
            id: AchievementId(2),
            title: "Staff pick".to_string(),
            image_url: None,
            points: 100,
            kind: AchievementKind::Award,
            trigger_keys: vec!["post_published".to_string()],
            target: 1,
        }));

        let queue = Arc::new(MemoryNotificationQueue::new());
        let evaluator = UnlockEvaluator::new(store.clone(), queue.clone(), store.clone())
            .with_ledger(store.clone());
        Fixture {
            store,
            queue,
            evaluator,
        }
    }

    struct UnavailableStore;

    impl ProgressStore for UnavailableStore {
        fn get(&self, _key: ProgressKey) -> Result<Option<ProgressRecord>> {
            bail!("database is locked")
        }

        fn list(&self, _filter: &ProgressFilter) -> Result<Vec<ProgressRecord>> {
            bail!("database is locked")
        }

        fn upsert(&self, _record: &ProgressRecord) -> Result<WriteOutcome> {
            bail!("database is locked")
        }

        fn delete(&self, _key: ProgressKey) -> Result<bool> {
            bail!("database is locked")
        }
    }

    struct RejectingLedger;

    impl PointsLedger for RejectingLedger {
        fn award_points(&self, _user_id: UserId, _delta: i64) -> Result<()> {
            bail!("ledger offline")
        }
    }

    struct RejectingQueue;

    impl NotificationQueue for RejectingQueue {
        fn enqueue(&self, _notification: &PendingNotification) -> Result<()> {
            bail!("queue full")
        }

        fn pending(&self, _user_id: UserId) -> Result<Vec<PendingNotification>> {
            Ok(Vec::new())
        }

        fn drain(&self, _user_id: UserId) -> Result<Vec<PendingNotification>> {
            Ok(Vec::new())
        }

        fn cancel(&self, _key: ProgressKey) -> Result<usize> {
            Ok(0)
        }
    }

    fn payload() -> EventPayload {
        EventPayload::Content {
            author_id: UserId(1),
            object_id: 3,
        }
    }

    #[test]
    fn signal_advances_then_unlocks_at_target() {
        let fx = fixture();
        let first = must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(1), &payload()));
        assert_eq!(first, Transition::Advanced { progress_count: 1 });

        let second = must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(1), &payload()));
        assert!(matches!(second, Transition::Unlocked { progress_count: 2, .. }));
        assert_eq!(must(fx.store.user_points(UserId(1))), 20);
        assert_eq!(must(fx.queue.pending(UserId(1))).len(), 1);
    }

    #[test]
    fn replayed_signals_after_unlock_are_no_ops() {
        let fx = fixture();
        for _ in 0..2 {
            must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(1), &payload()));
        }
        let replay = must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(1), &payload()));
        assert_eq!(replay, Transition::AlreadyUnlocked);

        let record = match must(fx.store.get(ProgressKey::new(UserId(1), AchievementId(1)))) {
            Some(record) => record,
            None => panic!("missing record"),
        };
        assert_eq!(record.progress_count, 2);
        assert_eq!(must(fx.queue.pending(UserId(1))).len(), 1);
        assert_eq!(must(fx.store.user_points(UserId(1))), 20);
    }

    #[test]
    fn award_achievements_ignore_signals_but_accept_override() {
        let fx = fixture();
        let ignored = must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(2), &payload()));
        assert_eq!(ignored, Transition::Ignored);

        let outcomes = fx.evaluator.handle_signal(&ProgressSignal {
            user_id: UserId(1),
            trigger_key: "post_published".to_string(),
            payload: payload(),
        });
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, AchievementId(1));

        let forced = must(fx.evaluator.force_unlock(UserId(1), AchievementId(2)));
        assert!(matches!(forced, Transition::Unlocked { progress_count: 0, .. }));
        assert_eq!(
            must(fx.evaluator.force_unlock(UserId(1), AchievementId(2))),
            Transition::AlreadyUnlocked
        );
        assert_eq!(must(fx.store.user_points(UserId(1))), 100);
    }

    #[test]
    fn unknown_achievement_is_a_typed_error() {
        let fx = fixture();
        let err = match fx.evaluator.force_unlock(UserId(1), AchievementId(404)) {
            Ok(transition) => panic!("expected error, got {transition:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<AchievementsError>(),
            Some(&AchievementsError::UnknownAchievement(AchievementId(404)))
        );
    }

    #[test]
    fn unknown_trigger_is_absorbed() {
        let fx = fixture();
        let outcomes = fx.evaluator.handle_signal(&ProgressSignal {
            user_id: UserId(1),
            trigger_key: "never_defined".to_string(),
            payload: EventPayload::Unresolvable,
        });
        assert!(outcomes.is_empty());
    }

    #[test]
    fn store_failure_is_absorbed_by_signal_and_bus_handlers() {
        let fx = fixture();
        let evaluator = Arc::new(UnlockEvaluator::new(
            Arc::new(UnavailableStore),
            fx.queue.clone(),
            fx.store.clone(),
        ));

        let outcomes = evaluator.handle_signal(&ProgressSignal {
            user_id: UserId(1),
            trigger_key: "post_published".to_string(),
            payload: payload(),
        });
        assert!(outcomes.is_empty());

        let bus = Arc::new(InProcessBus::new());
        let registry = match ExtensionRegistry::from_config(
            &EngineConfig::v1(),
            bus.clone(),
            evaluator.clone(),
        ) {
            Ok(registry) => registry,
            Err(err) => panic!("test failure: {err}"),
        };
        assert!(!registry.is_empty());
        assert_eq!(bus.emit(&HostEvent::new("post_published", payload())), 1);
        assert!(must(fx.queue.pending(UserId(1))).is_empty());

        let err = match evaluator.force_unlock(UserId(1), AchievementId(1)) {
            Ok(transition) => panic!("expected error, got {transition:?}"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("database is locked"));
    }

    #[test]
    fn ledger_failure_keeps_unlock_and_notification() {
        let fx = fixture();
        let evaluator = UnlockEvaluator::new(fx.store.clone(), fx.queue.clone(), fx.store.clone())
            .with_ledger(Arc::new(RejectingLedger));

        let forced = must(evaluator.force_unlock(UserId(3), AchievementId(1)));
        assert!(matches!(forced, Transition::Unlocked { .. }));
        assert_eq!(must(fx.queue.pending(UserId(3))).len(), 1);
        assert_eq!(must(fx.store.user_points(UserId(3))), 0);
    }

    #[test]
    fn enqueue_failure_leaves_unlock_committed() {
        let fx = fixture();
        let evaluator =
            UnlockEvaluator::new(fx.store.clone(), Arc::new(RejectingQueue), fx.store.clone())
                .with_ledger(fx.store.clone());

        must(evaluator.evaluate_signal(UserId(6), AchievementId(1), &payload()));
        let unlocked = must(evaluator.evaluate_signal(UserId(6), AchievementId(1), &payload()));
        assert!(matches!(unlocked, Transition::Unlocked { progress_count: 2, .. }));

        let record = match must(fx.store.get(ProgressKey::new(UserId(6), AchievementId(1)))) {
            Some(record) => record,
            None => panic!("missing record"),
        };
        assert!(record.is_unlocked());
        assert!(record.unlocked_at.is_some());
        assert_eq!(must(fx.store.user_points(UserId(6))), 20);
    }

    #[test]
    fn points_are_skipped_when_disabled_by_config() {
        let fx = fixture();
        let mut config = EngineConfig::v1();
        config.award_points = false;
        let evaluator = UnlockEvaluator::new(fx.store.clone(), fx.queue.clone(), fx.store.clone())
            .with_ledger(fx.store.clone())
            .with_config(&config);

        must(evaluator.force_unlock(UserId(5), AchievementId(1)));
        assert_eq!(must(fx.store.user_points(UserId(5))), 0);
    }

    #[test]
    fn revoke_returns_pair_to_fresh_state() {
        let fx = fixture();
        must(fx.evaluator.force_unlock(UserId(1), AchievementId(1)));
        assert!(must(fx.evaluator.revoke(UserId(1), AchievementId(1))));
        assert!(must(fx.queue.pending(UserId(1))).is_empty());
        assert!(!must(fx.evaluator.revoke(UserId(1), AchievementId(1))));

        let restarted = must(fx.evaluator.evaluate_signal(UserId(1), AchievementId(1), &payload()));
        assert_eq!(restarted, Transition::Advanced { progress_count: 1 });
    }

    #[test]
    fn keyed_locks_release_idle_entries() {
        let locks = KeyedLocks::new();
        let key = ProgressKey::new(UserId(1), AchievementId(1));
        let value = must(locks.with_key(key, || Ok(7)));
        assert_eq!(value, 7);
        assert!(locks.is_empty());
    }
}
