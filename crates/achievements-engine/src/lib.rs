//! Achievement progress and notification engine.
//!
//! Events raised on an [`EventBus`] reach [`Extension`] adapters, which turn
//! them into progress signals for the [`UnlockEvaluator`]. Unlocks land in a
//! per-user notification queue that the [`NotificationChannel`] serves to a
//! polling [`HeartbeatClient`].

mod bus;
mod channel;
mod client;
mod evaluator;
mod extensions;

pub use bus::{EventBus, EventHandler, InProcessBus, SubscriptionId};
pub use channel::{
    AchievementsPoll, HeartbeatRequest, HeartbeatResponse, MemoryNotificationQueue,
    NotificationChannel, PollKind,
};
pub use client::{
    HeartbeatClient, NotificationPanel, ViewDensity, ACHIEVEMENTS_KEY, AUTH_CHECK_KEY,
};
pub use evaluator::{KeyedLocks, Transition, UnlockEvaluator};
pub use extensions::{
    builtin_extension, BuddyStreamExtension, ContentExtension, Extension, ExtensionRegistry,
    ExtensionRegistryBuilder, SignalSink, BUILTIN_EXTENSION_IDS,
};
