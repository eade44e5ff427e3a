//! Domain model shared by every achievements crate.
//!
//! Stores, the engine and host integrations meet at the collaborator traits
//! declared here: [`ProgressStore`], [`NotificationQueue`],
//! [`AchievementCatalog`] and [`PointsLedger`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AchievementsError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown achievement: {0}")]
    UnknownAchievement(AchievementId),
    #[error("unknown extension: {0}")]
    UnknownExtension(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = AchievementsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_positive_id(value, "user_id").map(Self)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct AchievementId(pub u64);

impl Display for AchievementId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AchievementId {
    type Err = AchievementsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_positive_id(value, "achievement_id").map(Self)
    }
}

fn parse_positive_id(value: &str, field: &str) -> Result<u64, AchievementsError> {
    let parsed: u64 = value
        .trim()
        .parse()
        .map_err(|err| AchievementsError::Validation(format!("invalid {field} {value:?}: {err}")))?;
    if parsed == 0 {
        return Err(AchievementsError::Validation(format!("{field} MUST be >= 1")));
    }
    Ok(parsed)
}

/// Identity of a single progress record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProgressKey {
    pub user_id: UserId,
    pub achievement_id: AchievementId,
}

impl ProgressKey {
    #[must_use]
    pub fn new(user_id: UserId, achievement_id: AchievementId) -> Self {
        Self {
            user_id,
            achievement_id,
        }
    }
}

impl Display for ProgressKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.user_id, self.achievement_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Locked,
    Unlocked,
}

impl ProgressStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "locked" => Some(Self::Locked),
            "unlocked" => Some(Self::Unlocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AchievementKind {
    /// Advanced by progress signals from extensions.
    Event,
    /// Granted only by an operator through the administrative override.
    Award,
}

impl AchievementKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Award => "award",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "event" => Some(Self::Event),
            "award" => Some(Self::Award),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Achievement {
    pub id: AchievementId,
    pub title: String,
    pub image_url: Option<String>,
    pub points: i64,
    pub kind: AchievementKind,
    pub trigger_keys: Vec<String>,
    pub target: u32,
}

impl Achievement {
    /// Validates a definition before it is published to a catalog.
    ///
    /// # Errors
    /// Returns [`AchievementsError::Validation`] when the title is blank,
    /// the target is zero, or an event achievement declares no triggers.
    pub fn validate(&self) -> Result<(), AchievementsError> {
        if self.title.trim().is_empty() {
            return Err(AchievementsError::Validation(
                "title MUST be provided".to_string(),
            ));
        }

        if self.target == 0 {
            return Err(AchievementsError::Validation(
                "target MUST be >= 1".to_string(),
            ));
        }

        if self.kind == AchievementKind::Event && self.trigger_keys.is_empty() {
            return Err(AchievementsError::Validation(
                "event achievements require at least one trigger key".to_string(),
            ));
        }

        if self.trigger_keys.iter().any(|key| key.trim().is_empty()) {
            return Err(AchievementsError::Validation(
                "trigger keys MUST NOT be blank".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn advances_on(&self, trigger_key: &str) -> bool {
        self.kind == AchievementKind::Event
            && self.trigger_keys.iter().any(|key| key == trigger_key)
    }

    #[must_use]
    pub fn notification_item(&self) -> NotificationItem {
        NotificationItem {
            id: self.id,
            title: self.title.clone(),
            image_url: self.image_url.clone(),
            points: self.points,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressRecord {
    pub user_id: UserId,
    pub achievement_id: AchievementId,
    pub status: ProgressStatus,
    pub progress_count: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub unlocked_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ProgressRecord {
    /// Fresh record for a pair that has never been touched.
    #[must_use]
    pub fn locked(key: ProgressKey, now: OffsetDateTime) -> Self {
        Self {
            user_id: key.user_id,
            achievement_id: key.achievement_id,
            status: ProgressStatus::Locked,
            progress_count: 0,
            unlocked_at: None,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.user_id, self.achievement_id)
    }

    #[must_use]
    pub fn is_unlocked(&self) -> bool {
        self.status == ProgressStatus::Unlocked
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressFilter {
    pub user_id: Option<UserId>,
    pub status: Option<ProgressStatus>,
    pub achievement_ids: Vec<AchievementId>,
}

impl ProgressFilter {
    #[must_use]
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: ProgressStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_achievements(mut self, achievement_ids: &[AchievementId]) -> Self {
        self.achievement_ids = achievement_ids.to_vec();
        self
    }

    #[must_use]
    pub fn matches(&self, record: &ProgressRecord) -> bool {
        (self.user_id.is_none() || self.user_id == Some(record.user_id))
            && (self.status.is_none() || self.status == Some(record.status))
            && (self.achievement_ids.is_empty()
                || self.achievement_ids.contains(&record.achievement_id))
    }
}

/// Result of a conditional progress write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    /// The stored record was already unlocked and was left untouched.
    StatusConflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingNotification {
    pub notification_id: Ulid,
    pub user_id: UserId,
    pub achievement_id: AchievementId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl PendingNotification {
    #[must_use]
    pub fn new(key: ProgressKey, created_at: OffsetDateTime) -> Self {
        Self {
            notification_id: Ulid::new(),
            user_id: key.user_id,
            achievement_id: key.achievement_id,
            created_at,
        }
    }

    #[must_use]
    pub fn key(&self) -> ProgressKey {
        ProgressKey::new(self.user_id, self.achievement_id)
    }
}

/// One badge as carried in the heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationItem {
    pub id: AchievementId,
    pub title: String,
    pub image_url: Option<String>,
    pub points: i64,
}

/// Payload of a host or third-party event, one variant per event family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum EventPayload {
    UserAction {
        user_id: UserId,
    },
    Content {
        author_id: UserId,
        object_id: u64,
    },
    Comment {
        author_id: Option<UserId>,
        comment_id: u64,
        post_id: u64,
    },
    SocialAccount {
        user_id: UserId,
        network: String,
    },
    Unresolvable,
}

impl EventPayload {
    /// The user credited with the event, when one can be attributed.
    #[must_use]
    pub fn acting_user(&self) -> Option<UserId> {
        match self {
            Self::UserAction { user_id } | Self::SocialAccount { user_id, .. } => Some(*user_id),
            Self::Content { author_id, .. } => Some(*author_id),
            Self::Comment { author_id, .. } => *author_id,
            Self::Unresolvable => None,
        }
    }
}

/// An event as raised on the host's event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostEvent {
    pub name: String,
    pub payload: EventPayload,
}

impl HostEvent {
    #[must_use]
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Normalized progress signal raised by an extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSignal {
    pub user_id: UserId,
    pub trigger_key: String,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contributor {
    pub name: String,
    pub gravatar_url: Option<String>,
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub version: u32,
    pub actions: BTreeMap<String, String>,
    pub contributors: Vec<Contributor>,
    pub image_url: Option<String>,
    pub rss_url: Option<String>,
    pub homepage_url: Option<String>,
}

impl ExtensionDescriptor {
    /// Validates descriptor metadata at registration time.
    ///
    /// # Errors
    /// Returns [`AchievementsError::Validation`] when the identifier is
    /// blank, the version is zero, or no actions are declared.
    pub fn validate(&self) -> Result<(), AchievementsError> {
        if self.id.trim().is_empty() {
            return Err(AchievementsError::Validation(
                "extension id MUST be provided".to_string(),
            ));
        }

        if self.version == 0 {
            return Err(AchievementsError::Validation(format!(
                "extension {} version MUST be >= 1",
                self.id
            )));
        }

        if self.actions.is_empty() {
            return Err(AchievementsError::Validation(format!(
                "extension {} MUST declare at least one action",
                self.id
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub config_version: u32,
    pub award_points: bool,
    pub enabled_extensions: Vec<String>,
    pub heartbeat_interval_secs: u64,
    pub skip_poll_while_panel_open: bool,
}

impl EngineConfig {
    pub const MIN_HEARTBEAT_INTERVAL_SECS: u64 = 5;
    pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 120;

    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            award_points: true,
            enabled_extensions: vec!["buddystream".to_string(), "content".to_string()],
            heartbeat_interval_secs: 15,
            skip_poll_while_panel_open: true,
        }
    }

    /// Validates configuration bounds.
    ///
    /// # Errors
    /// Returns [`AchievementsError::Configuration`] when the version is zero,
    /// the heartbeat interval is out of range, or extension ids are blank or
    /// repeated.
    pub fn validate(&self) -> Result<(), AchievementsError> {
        if self.config_version == 0 {
            return Err(AchievementsError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        if !(Self::MIN_HEARTBEAT_INTERVAL_SECS..=Self::MAX_HEARTBEAT_INTERVAL_SECS)
            .contains(&self.heartbeat_interval_secs)
        {
            return Err(AchievementsError::Configuration(format!(
                "heartbeat_interval_secs MUST be in [{}, {}]",
                Self::MIN_HEARTBEAT_INTERVAL_SECS,
                Self::MAX_HEARTBEAT_INTERVAL_SECS
            )));
        }

        let mut seen = BTreeSet::new();
        for extension in &self.enabled_extensions {
            if extension.trim().is_empty() {
                return Err(AchievementsError::Configuration(
                    "enabled_extensions MUST NOT contain blank ids".to_string(),
                ));
            }
            if !seen.insert(extension.as_str()) {
                return Err(AchievementsError::Configuration(format!(
                    "extension {extension} is enabled more than once"
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`AchievementsError::Configuration`] when JSON decoding fails
    /// or decoded values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, AchievementsError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            AchievementsError::Configuration(format!("invalid config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn is_extension_enabled(&self, id: &str) -> bool {
        self.enabled_extensions.iter().any(|item| item == id)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::v1()
    }
}

/// Decides whether a locked record has met its achievement's criteria.
pub trait UnlockCriterion: Send + Sync {
    fn is_satisfied(
        &self,
        progress_count: u64,
        payload: &EventPayload,
        achievement: &Achievement,
    ) -> bool;
}

/// `progress_count >= target`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdCriterion;

impl UnlockCriterion for ThresholdCriterion {
    fn is_satisfied(
        &self,
        progress_count: u64,
        _payload: &EventPayload,
        achievement: &Achievement,
    ) -> bool {
        progress_count >= u64::from(achievement.target)
    }
}

pub trait ProgressStore: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn get(&self, key: ProgressKey) -> Result<Option<ProgressRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn list(&self, filter: &ProgressFilter) -> Result<Vec<ProgressRecord>>;

    /// Creates or overwrites the record for its key. An existing unlocked
    /// record is never overwritten and `progress_count` never decreases.
    #[allow(clippy::missing_errors_doc)]
    fn upsert(&self, record: &ProgressRecord) -> Result<WriteOutcome>;

    /// Removes the record and any notification still queued for it.
    #[allow(clippy::missing_errors_doc)]
    fn delete(&self, key: ProgressKey) -> Result<bool>;
}

pub trait NotificationQueue: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn enqueue(&self, notification: &PendingNotification) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn pending(&self, user_id: UserId) -> Result<Vec<PendingNotification>>;

    /// Removes and returns every queued notification for the user, oldest
    /// first.
    #[allow(clippy::missing_errors_doc)]
    fn drain(&self, user_id: UserId) -> Result<Vec<PendingNotification>>;

    #[allow(clippy::missing_errors_doc)]
    fn cancel(&self, key: ProgressKey) -> Result<usize>;
}

pub trait AchievementCatalog: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn get_achievement(&self, id: AchievementId) -> Result<Option<Achievement>>;

    #[allow(clippy::missing_errors_doc)]
    fn achievements_for_trigger(&self, trigger_key: &str) -> Result<Vec<Achievement>>;
}

pub trait PointsLedger: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn award_points(&self, user_id: UserId, delta: i64) -> Result<()>;
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`AchievementsError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, AchievementsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| AchievementsError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(AchievementsError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`AchievementsError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, AchievementsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            AchievementsError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
