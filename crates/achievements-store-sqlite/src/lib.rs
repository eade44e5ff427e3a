#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use achievements_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Achievement, AchievementCatalog, AchievementId,
    AchievementKind, AchievementsError, EngineConfig, NotificationQueue, PendingNotification,
    PointsLedger, ProgressFilter, ProgressKey, ProgressRecord, ProgressStatus, ProgressStore,
    UserId, WriteOutcome,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const SCHEMA_MIGRATION_VERSION: i64 = 1;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS achievements (
  achievement_id INTEGER PRIMARY KEY CHECK (achievement_id >= 1),
  title TEXT NOT NULL,
  image_url TEXT,
  points INTEGER NOT NULL,
  kind TEXT NOT NULL CHECK (kind IN ('event', 'award')),
  target INTEGER NOT NULL CHECK (target >= 1),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS achievement_triggers (
  achievement_id INTEGER NOT NULL,
  trigger_key TEXT NOT NULL,
  PRIMARY KEY (achievement_id, trigger_key),
  FOREIGN KEY (achievement_id) REFERENCES achievements(achievement_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_achievement_triggers_key
  ON achievement_triggers(trigger_key, achievement_id);

CREATE TABLE IF NOT EXISTS progress (
  user_id INTEGER NOT NULL CHECK (user_id >= 1),
  achievement_id INTEGER NOT NULL CHECK (achievement_id >= 1),
  status TEXT NOT NULL CHECK (status IN ('locked', 'unlocked')),
  progress_count INTEGER NOT NULL CHECK (progress_count >= 0),
  unlocked_at TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (user_id, achievement_id)
);

CREATE INDEX IF NOT EXISTS idx_progress_status
  ON progress(status, user_id);

CREATE TABLE IF NOT EXISTS pending_notifications (
  queue_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  notification_id TEXT NOT NULL UNIQUE,
  user_id INTEGER NOT NULL,
  achievement_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  UNIQUE (user_id, achievement_id)
);

CREATE TABLE IF NOT EXISTS user_points (
  user_id INTEGER PRIMARY KEY,
  points INTEGER NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engine_config (
  config_version INTEGER PRIMARY KEY,
  config_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

/// SQLite-backed implementation of every persistence collaborator the
/// engine needs: progress, notification queue, catalog and points ledger.
pub struct SqliteAchievementStore {
    conn: Mutex<Connection>,
}

impl SqliteAchievementStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );",
        )
        .context("failed to ensure schema_migrations exists")?;

        conn.execute_batch(SCHEMA_V1)
            .context("failed to apply achievements schema")?;

        let now = timestamp(now_utc())?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_MIGRATION_VERSION, now],
        )
        .context("failed to register achievements schema migration")?;

        let default_config = EngineConfig::v1();
        let payload =
            serde_json::to_string(&default_config).context("failed to serialize default config")?;
        conn.execute(
            "INSERT OR IGNORE INTO engine_config(config_version, config_json, updated_at)
             VALUES (?1, ?2, ?3)",
            params![i64::from(default_config.config_version), payload, now],
        )
        .context("failed to seed default engine config")?;

        Ok(())
    }

    /// Returns the highest configuration version stored.
    pub fn get_config(&self) -> Result<EngineConfig> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT config_json FROM engine_config ORDER BY config_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read engine config")?;

        let Some(raw) = raw else {
            return Ok(EngineConfig::v1());
        };

        let value: Value = serde_json::from_str(&raw).context("invalid stored config JSON")?;
        EngineConfig::from_json(&value)
            .map_err(|err| anyhow!("failed to parse stored config: {err}"))
    }

    pub fn set_config(&self, config: &EngineConfig) -> Result<()> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid engine configuration: {err}"))?;

        let payload = serde_json::to_string(config).context("failed to serialize config")?;
        let now = timestamp(now_utc())?;

        self.lock()?
            .execute(
                "INSERT INTO engine_config(config_version, config_json, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(config_version) DO UPDATE SET
                   config_json = excluded.config_json,
                   updated_at = excluded.updated_at",
                params![i64::from(config.config_version), payload, now],
            )
            .context("failed to upsert engine config")?;

        Ok(())
    }

    pub fn upsert_achievement(&self, achievement: &Achievement) -> Result<()> {
        achievement
            .validate()
            .map_err(|err| anyhow!("invalid achievement {}: {err}", achievement.id))?;

        let now = timestamp(now_utc())?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to start achievement transaction")?;

        tx.execute(
            "INSERT INTO achievements(achievement_id, title, image_url, points, kind, target, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(achievement_id) DO UPDATE SET
               title = excluded.title,
               image_url = excluded.image_url,
               points = excluded.points,
               kind = excluded.kind,
               target = excluded.target,
               updated_at = excluded.updated_at",
            params![
                sql_id(achievement.id.0)?,
                achievement.title,
                achievement.image_url,
                achievement.points,
                achievement.kind.as_str(),
                i64::from(achievement.target),
                now,
            ],
        )
        .context("failed to upsert achievement")?;

        tx.execute(
            "DELETE FROM achievement_triggers WHERE achievement_id = ?1",
            params![sql_id(achievement.id.0)?],
        )
        .context("failed to clear achievement triggers")?;

        for trigger_key in &achievement.trigger_keys {
            tx.execute(
                "INSERT OR IGNORE INTO achievement_triggers(achievement_id, trigger_key) VALUES (?1, ?2)",
                params![sql_id(achievement.id.0)?, trigger_key],
            )
            .context("failed to insert achievement trigger")?;
        }

        tx.commit()
            .context("failed to commit achievement transaction")?;
        debug!(achievement_id = %achievement.id, "achievement definition stored");
        Ok(())
    }

    pub fn list_achievements(&self) -> Result<Vec<Achievement>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT achievement_id, title, image_url, points, kind, target
             FROM achievements
             ORDER BY achievement_id ASC",
        )?;
        let rows = stmt.query_map([], parse_achievement_row)?;
        let mut achievements = collect_rows(rows)?;
        drop(stmt);

        for achievement in &mut achievements {
            achievement.trigger_keys = load_trigger_keys(&conn, achievement.id)?;
        }

        Ok(achievements)
    }

    pub fn user_points(&self, user_id: UserId) -> Result<i64> {
        let points: Option<i64> = self
            .lock()?
            .query_row(
                "SELECT points FROM user_points WHERE user_id = ?1",
                params![sql_id(user_id.0)?],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read user points")?;

        Ok(points.unwrap_or(0))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }

    #[cfg(test)]
    fn connection(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(err) => panic!("test failure: {err}"),
        }
    }
}

impl ProgressStore for SqliteAchievementStore {
    fn get(&self, key: ProgressKey) -> Result<Option<ProgressRecord>> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT user_id, achievement_id, status, progress_count, unlocked_at, updated_at
                 FROM progress
                 WHERE user_id = ?1 AND achievement_id = ?2",
                params![sql_id(key.user_id.0)?, sql_id(key.achievement_id.0)?],
                parse_progress_row,
            )
            .optional()
            .context("failed to read progress record")?;

        Ok(record)
    }

    fn list(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>> {
        let user_id = filter.user_id.map(|user| sql_id(user.0)).transpose()?;
        let status = filter.status.map(ProgressStatus::as_str);

        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, achievement_id, status, progress_count, unlocked_at, updated_at
             FROM progress
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR status = ?2)
             ORDER BY user_id ASC, achievement_id ASC",
        )?;
        let rows = stmt.query_map(params![user_id, status], parse_progress_row)?;

        let records = collect_rows(rows)?;
        Ok(records
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    fn upsert(&self, record: &ProgressRecord) -> Result<WriteOutcome> {
        let unlocked_at = record.unlocked_at.map(timestamp).transpose()?;
        let changed = self
            .lock()?
            .execute(
                "INSERT INTO progress(user_id, achievement_id, status, progress_count, unlocked_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id, achievement_id) DO UPDATE SET
                   status = excluded.status,
                   progress_count = MAX(progress.progress_count, excluded.progress_count),
                   unlocked_at = excluded.unlocked_at,
                   updated_at = excluded.updated_at
                 WHERE progress.status = 'locked'",
                params![
                    sql_id(record.user_id.0)?,
                    sql_id(record.achievement_id.0)?,
                    record.status.as_str(),
                    sql_count(record.progress_count)?,
                    unlocked_at,
                    timestamp(record.updated_at)?,
                ],
            )
            .context("failed to upsert progress record")?;

        if changed == 0 {
            return Ok(WriteOutcome::StatusConflict);
        }
        Ok(WriteOutcome::Written)
    }

    fn delete(&self, key: ProgressKey) -> Result<bool> {
        let user_id = sql_id(key.user_id.0)?;
        let achievement_id = sql_id(key.achievement_id.0)?;

        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to start revoke transaction")?;

        let removed = tx
            .execute(
                "DELETE FROM progress WHERE user_id = ?1 AND achievement_id = ?2",
                params![user_id, achievement_id],
            )
            .context("failed to delete progress record")?;
        tx.execute(
            "DELETE FROM pending_notifications WHERE user_id = ?1 AND achievement_id = ?2",
            params![user_id, achievement_id],
        )
        .context("failed to delete pending notifications")?;

        tx.commit().context("failed to commit revoke transaction")?;
        Ok(removed > 0)
    }
}

impl NotificationQueue for SqliteAchievementStore {
    fn enqueue(&self, notification: &PendingNotification) -> Result<()> {
        let inserted = self
            .lock()?
            .execute(
                "INSERT INTO pending_notifications(notification_id, user_id, achievement_id, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id, achievement_id) DO NOTHING",
                params![
                    notification.notification_id.to_string(),
                    sql_id(notification.user_id.0)?,
                    sql_id(notification.achievement_id.0)?,
                    timestamp(notification.created_at)?,
                ],
            )
            .context("failed to enqueue notification")?;

        if inserted == 0 {
            debug!(key = %notification.key(), "notification already queued");
        }
        Ok(())
    }

    fn pending(&self, user_id: UserId) -> Result<Vec<PendingNotification>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT notification_id, user_id, achievement_id, created_at
             FROM pending_notifications
             WHERE user_id = ?1
             ORDER BY queue_seq ASC",
        )?;
        let rows = stmt.query_map(params![sql_id(user_id.0)?], parse_notification_row)?;
        collect_rows(rows)
    }

    fn drain(&self, user_id: UserId) -> Result<Vec<PendingNotification>> {
        let user = sql_id(user_id.0)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .context("failed to start drain transaction")?;

        let drained = {
            let mut stmt = tx.prepare(
                "SELECT notification_id, user_id, achievement_id, created_at
                 FROM pending_notifications
                 WHERE user_id = ?1
                 ORDER BY queue_seq ASC",
            )?;
            let rows = stmt.query_map(params![user], parse_notification_row)?;
            collect_rows(rows)?
        };

        tx.execute(
            "DELETE FROM pending_notifications WHERE user_id = ?1",
            params![user],
        )
        .context("failed to delete drained notifications")?;
        tx.commit().context("failed to commit drain transaction")?;

        Ok(drained)
    }

    fn cancel(&self, key: ProgressKey) -> Result<usize> {
        let removed = self
            .lock()?
            .execute(
                "DELETE FROM pending_notifications WHERE user_id = ?1 AND achievement_id = ?2",
                params![sql_id(key.user_id.0)?, sql_id(key.achievement_id.0)?],
            )
            .context("failed to cancel pending notification")?;
        Ok(removed)
    }
}

impl AchievementCatalog for SqliteAchievementStore {
    fn get_achievement(&self, id: AchievementId) -> Result<Option<Achievement>> {
        let conn = self.lock()?;
        let achievement = conn
            .query_row(
                "SELECT achievement_id, title, image_url, points, kind, target
                 FROM achievements
                 WHERE achievement_id = ?1",
                params![sql_id(id.0)?],
                parse_achievement_row,
            )
            .optional()
            .context("failed to read achievement")?;

        let Some(mut achievement) = achievement else {
            return Ok(None);
        };
        achievement.trigger_keys = load_trigger_keys(&conn, achievement.id)?;
        Ok(Some(achievement))
    }

    fn achievements_for_trigger(&self, trigger_key: &str) -> Result<Vec<Achievement>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.achievement_id, a.title, a.image_url, a.points, a.kind, a.target
             FROM achievements a
             JOIN achievement_triggers t ON t.achievement_id = a.achievement_id
             WHERE t.trigger_key = ?1
             ORDER BY a.achievement_id ASC",
        )?;
        let rows = stmt.query_map(params![trigger_key], parse_achievement_row)?;
        let mut achievements = collect_rows(rows)?;
        drop(stmt);

        for achievement in &mut achievements {
            achievement.trigger_keys = load_trigger_keys(&conn, achievement.id)?;
        }

        Ok(achievements)
    }
}

impl PointsLedger for SqliteAchievementStore {
    fn award_points(&self, user_id: UserId, delta: i64) -> Result<()> {
        let now = timestamp(now_utc())?;
        self.lock()?
            .execute(
                "INSERT INTO user_points(user_id, points, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                   points = user_points.points + excluded.points,
                   updated_at = excluded.updated_at",
                params![sql_id(user_id.0)?, delta, now],
            )
            .context("failed to award points")?;
        Ok(())
    }
}

fn load_trigger_keys(conn: &Connection, id: AchievementId) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT trigger_key FROM achievement_triggers
         WHERE achievement_id = ?1
         ORDER BY trigger_key ASC",
    )?;
    let rows = stmt.query_map(params![sql_id(id.0)?], |row| row.get::<_, String>(0))?;
    collect_rows(rows)
}

fn parse_progress_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressRecord> {
    let user_id: i64 = row.get(0)?;
    let achievement_id: i64 = row.get(1)?;
    let status_raw: String = row.get(2)?;
    let progress_count: i64 = row.get(3)?;
    let unlocked_at_raw: Option<String> = row.get(4)?;
    let updated_at_raw: String = row.get(5)?;

    let status = ProgressStatus::parse(&status_raw).ok_or_else(|| {
        conversion_error(
            2,
            rusqlite::types::Type::Text,
            format!("invalid status: {status_raw}"),
        )
    })?;

    let progress_count = u64::try_from(progress_count).map_err(|_| {
        conversion_error(
            3,
            rusqlite::types::Type::Integer,
            format!("invalid progress_count: {progress_count}"),
        )
    })?;

    let unlocked_at = unlocked_at_raw
        .as_deref()
        .map(parse_rfc3339_utc)
        .transpose()
        .map_err(to_sql_error)?;

    Ok(ProgressRecord {
        user_id: UserId(parse_row_id(0, user_id)?),
        achievement_id: AchievementId(parse_row_id(1, achievement_id)?),
        status,
        progress_count,
        unlocked_at,
        updated_at: parse_rfc3339_utc(&updated_at_raw).map_err(to_sql_error)?,
    })
}

fn parse_achievement_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Achievement> {
    let achievement_id: i64 = row.get(0)?;
    let kind_raw: String = row.get(4)?;
    let target: i64 = row.get(5)?;

    let kind = AchievementKind::parse(&kind_raw).ok_or_else(|| {
        conversion_error(
            4,
            rusqlite::types::Type::Text,
            format!("invalid kind: {kind_raw}"),
        )
    })?;

    let target = u32::try_from(target).map_err(|_| {
        conversion_error(
            5,
            rusqlite::types::Type::Integer,
            format!("invalid target: {target}"),
        )
    })?;

    Ok(Achievement {
        id: AchievementId(parse_row_id(0, achievement_id)?),
        title: row.get(1)?,
        image_url: row.get(2)?,
        points: row.get(3)?,
        kind,
        trigger_keys: Vec::new(),
        target,
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingNotification> {
    let notification_id_raw: String = row.get(0)?;
    let user_id: i64 = row.get(1)?;
    let achievement_id: i64 = row.get(2)?;
    let created_at_raw: String = row.get(3)?;

    let notification_id = Ulid::from_string(&notification_id_raw).map_err(|_| {
        conversion_error(
            0,
            rusqlite::types::Type::Text,
            format!("invalid notification_id ULID: {notification_id_raw}"),
        )
    })?;

    Ok(PendingNotification {
        notification_id,
        user_id: UserId(parse_row_id(1, user_id)?),
        achievement_id: AchievementId(parse_row_id(2, achievement_id)?),
        created_at: parse_rfc3339_utc(&created_at_raw).map_err(to_sql_error)?,
    })
}

fn parse_row_id(index: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw).map_err(|_| {
        conversion_error(
            index,
            rusqlite::types::Type::Integer,
            format!("invalid id: {raw}"),
        )
    })
}

fn conversion_error(index: usize, kind: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        kind,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: AchievementsError) -> rusqlite::Error {
    conversion_error(0, rusqlite::types::Type::Text, err.to_string())
}

fn timestamp(value: OffsetDateTime) -> Result<String> {
    format_rfc3339(value).map_err(|err| anyhow!(err.to_string()))
}

fn sql_id(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("id out of sqlite range: {value}"))
}

fn sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("progress_count out of sqlite range: {value}"))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteAchievementStore {
        let store = must(SqliteAchievementStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_achievement(id: u64, trigger: &str) -> Achievement {
        Achievement {
            id: AchievementId(id),
            title: format!("Badge {id}"),
            image_url: None,
            points: 10,
            kind: AchievementKind::Event,
            trigger_keys: vec![trigger.to_string()],
            target: 2,
        }
    }

    fn key() -> ProgressKey {
        ProgressKey::new(UserId(7), AchievementId(1))
    }

    fn unlocked(key: ProgressKey, count: u64) -> ProgressRecord {
        let now = now_utc();
        ProgressRecord {
            status: ProgressStatus::Unlocked,
            progress_count: count,
            unlocked_at: Some(now),
            ..ProgressRecord::locked(key, now)
        }
    }

    #[test]
    fn migrate_is_idempotent_and_seeds_config() {
        let store = fixture_store();
        must(store.migrate());

        let migrations: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM schema_migrations",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(migrations, 1);
        assert_eq!(must(store.get_config()), EngineConfig::v1());
    }

    #[test]
    fn set_config_replaces_stored_version() {
        let store = fixture_store();
        let mut config = EngineConfig::v1();
        config.award_points = false;
        config.enabled_extensions = vec!["content".to_string()];
        must(store.set_config(&config));
        assert_eq!(must(store.get_config()), config);

        config.heartbeat_interval_secs = 0;
        assert!(store.set_config(&config).is_err());
    }

    #[test]
    fn upsert_never_overwrites_unlocked_record() {
        let store = fixture_store();
        let key = key();

        assert_eq!(must(store.upsert(&unlocked(key, 2))), WriteOutcome::Written);

        let mut locked = ProgressRecord::locked(key, now_utc());
        locked.progress_count = 5;
        assert_eq!(must(store.upsert(&locked)), WriteOutcome::StatusConflict);

        let stored = match must(store.get(key)) {
            Some(record) => record,
            None => panic!("missing progress record"),
        };
        assert!(stored.is_unlocked());
        assert_eq!(stored.progress_count, 2);
        assert!(stored.unlocked_at.is_some());
    }

    #[test]
    fn upsert_keeps_highest_progress_count() {
        let store = fixture_store();
        let key = key();

        let mut record = ProgressRecord::locked(key, now_utc());
        record.progress_count = 4;
        must(store.upsert(&record));
        record.progress_count = 1;
        assert_eq!(must(store.upsert(&record)), WriteOutcome::Written);

        let stored = must(store.get(key));
        assert_eq!(stored.map(|record| record.progress_count), Some(4));
    }

    #[test]
    fn delete_removes_record_and_queued_notification() {
        let store = fixture_store();
        let key = key();
        must(store.upsert(&unlocked(key, 1)));
        must(store.enqueue(&PendingNotification::new(key, now_utc())));

        assert!(must(store.delete(key)));
        assert!(must(store.get(key)).is_none());
        assert!(must(store.pending(key.user_id)).is_empty());
        assert!(!must(store.delete(key)));
    }

    #[test]
    fn drain_returns_queue_order_and_empties_queue() {
        let store = fixture_store();
        let user = UserId(3);
        let first = ProgressKey::new(user, AchievementId(2));
        let second = ProgressKey::new(user, AchievementId(1));
        let earlier = must(parse_rfc3339_utc("2026-01-01T00:00:00Z").map_err(anyhow::Error::from));

        must(store.enqueue(&PendingNotification::new(first, earlier)));
        must(store.enqueue(&PendingNotification::new(second, now_utc())));
        must(store.enqueue(&PendingNotification::new(
            ProgressKey::new(UserId(4), AchievementId(1)),
            earlier,
        )));

        let drained = must(store.drain(user));
        let ids: Vec<_> = drained.iter().map(|item| item.achievement_id).collect();
        assert_eq!(ids, vec![AchievementId(2), AchievementId(1)]);
        assert!(must(store.drain(user)).is_empty());
        assert_eq!(must(store.pending(UserId(4))).len(), 1);
    }

    #[test]
    fn enqueue_ignores_duplicate_notification_for_same_key() {
        let store = fixture_store();
        let key = key();
        must(store.enqueue(&PendingNotification::new(key, now_utc())));
        must(store.enqueue(&PendingNotification::new(key, now_utc())));

        assert_eq!(must(store.pending(key.user_id)).len(), 1);
        assert_eq!(must(store.cancel(key)), 1);
        assert_eq!(must(store.cancel(key)), 0);
    }

    #[test]
    fn list_applies_user_status_and_achievement_filters() {
        let store = fixture_store();
        must(store.upsert(&unlocked(ProgressKey::new(UserId(1), AchievementId(1)), 1)));
        must(store.upsert(&ProgressRecord::locked(
            ProgressKey::new(UserId(1), AchievementId(2)),
            now_utc(),
        )));
        must(store.upsert(&ProgressRecord::locked(
            ProgressKey::new(UserId(2), AchievementId(1)),
            now_utc(),
        )));

        assert_eq!(must(store.list(&ProgressFilter::default())).len(), 3);
        assert_eq!(must(store.list(&ProgressFilter::for_user(UserId(1)))).len(), 2);

        let unlocked_only = must(store.list(
            &ProgressFilter::default().with_status(ProgressStatus::Unlocked),
        ));
        assert_eq!(unlocked_only.len(), 1);
        assert_eq!(unlocked_only[0].user_id, UserId(1));

        let second = must(store.list(
            &ProgressFilter::default().with_achievements(&[AchievementId(2)]),
        ));
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn catalog_resolves_achievements_by_trigger() {
        let store = fixture_store();
        must(store.upsert_achievement(&fixture_achievement(1, "post_published")));
        must(store.upsert_achievement(&fixture_achievement(2, "comment_approved")));

        let mut multi = fixture_achievement(3, "post_published");
        multi.trigger_keys.push("comment_approved".to_string());
        must(store.upsert_achievement(&multi));

        let ids: Vec<_> = must(store.achievements_for_trigger("comment_approved"))
            .into_iter()
            .map(|achievement| achievement.id)
            .collect();
        assert_eq!(ids, vec![AchievementId(2), AchievementId(3)]);

        let stored = match must(store.get_achievement(AchievementId(3))) {
            Some(achievement) => achievement,
            None => panic!("missing achievement"),
        };
        assert_eq!(
            stored.trigger_keys,
            vec!["comment_approved".to_string(), "post_published".to_string()]
        );
        assert!(must(store.get_achievement(AchievementId(99))).is_none());
        assert_eq!(must(store.list_achievements()).len(), 3);
    }

    #[test]
    fn upsert_achievement_replaces_triggers_and_rejects_invalid() {
        let store = fixture_store();
        must(store.upsert_achievement(&fixture_achievement(1, "post_published")));
        must(store.upsert_achievement(&fixture_achievement(1, "user_registered")));
        assert!(must(store.achievements_for_trigger("post_published")).is_empty());

        let mut invalid = fixture_achievement(2, "post_published");
        invalid.target = 0;
        assert!(store.upsert_achievement(&invalid).is_err());
    }

    #[test]
    fn points_ledger_accumulates() {
        let store = fixture_store();
        assert_eq!(must(store.user_points(UserId(5))), 0);
        must(store.award_points(UserId(5), 25));
        must(store.award_points(UserId(5), 10));
        assert_eq!(must(store.user_points(UserId(5))), 35);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_progress_is_monotonic_until_unlocked(
            writes in prop::collection::vec((0u64..50, any::<bool>()), 1..40)
        ) {
            let store = fixture_store();
            let key = key();
            let mut expected_count = 0u64;
            let mut unlocked_at_count: Option<u64> = None;

            for (count, unlock) in writes {
                let record = if unlock {
                    unlocked(key, count)
                } else {
                    let mut record = ProgressRecord::locked(key, now_utc());
                    record.progress_count = count;
                    record
                };

                let outcome = must(store.upsert(&record));
                match unlocked_at_count {
                    Some(_) => {
                        prop_assert_eq!(outcome, WriteOutcome::StatusConflict);
                    }
                    None => {
                        prop_assert_eq!(outcome, WriteOutcome::Written);
                        expected_count = expected_count.max(count);
                        if unlock {
                            unlocked_at_count = Some(expected_count);
                        }
                    }
                }

                let stored = match must(store.get(key)) {
                    Some(record) => record,
                    None => panic!("missing progress record"),
                };
                prop_assert_eq!(stored.progress_count, expected_count);
                prop_assert_eq!(stored.is_unlocked(), unlocked_at_count.is_some());
            }
        }
    }
}
