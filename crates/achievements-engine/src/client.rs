use achievements_core::{EngineConfig, NotificationItem};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::channel::AchievementsPoll;

/// Host key carrying the login flag on every heartbeat tick.
pub const AUTH_CHECK_KEY: &str = "auth-check";
pub const ACHIEVEMENTS_KEY: &str = "achievements";

/// Layout tier for the notification panel, keyed to how many items it holds.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViewDensity {
    Single,
    Dual,
    Tri,
    Quad,
}

impl ViewDensity {
    #[must_use]
    pub fn for_count(count: usize) -> Self {
        match count {
            0 | 1 => Self::Single,
            2 => Self::Dual,
            3 => Self::Tri,
            _ => Self::Quad,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Dual => "dual",
            Self::Tri => "tri",
            Self::Quad => "quad",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NotificationPanel {
    items: Vec<NotificationItem>,
    density: ViewDensity,
    visible: bool,
}

impl NotificationPanel {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            density: ViewDensity::Single,
            visible: false,
        }
    }

    fn show(&mut self, items: Vec<NotificationItem>) {
        self.items.extend(items);
        // Once the panel reaches the quad tier it stays there.
        if self.density != ViewDensity::Quad {
            self.density = ViewDensity::for_count(self.items.len());
        }
        self.visible = true;
    }

    #[must_use]
    pub fn items(&self) -> &[NotificationItem] {
        &self.items
    }

    #[must_use]
    pub fn density(&self) -> ViewDensity {
        self.density
    }

    #[must_use]
    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

/// Client half of the heartbeat protocol.
///
/// Decides when a heartbeat should ask for notifications and renders the
/// ones that come back. The server queue stays authoritative; every gate here
/// only saves bandwidth and attention.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HeartbeatClient {
    logged_in: bool,
    window_visible: bool,
    awaiting_response: bool,
    skip_while_panel_open: bool,
    panel: Option<NotificationPanel>,
}

impl HeartbeatClient {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            logged_in: true,
            window_visible: true,
            awaiting_response: false,
            skip_while_panel_open: config.skip_poll_while_panel_open,
            panel: None,
        }
    }

    /// Value to attach under the `achievements` key of the next heartbeat,
    /// or `None` to leave the key off.
    pub fn on_send(&mut self) -> Option<AchievementsPoll> {
        if !self.logged_in || !self.window_visible {
            return None;
        }

        if self.awaiting_response {
            debug!("achievements poll already in flight");
            return None;
        }

        if self.skip_while_panel_open && self.is_panel_visible() {
            return None;
        }

        self.awaiting_response = true;
        Some(AchievementsPoll::notifications())
    }

    /// Consumes one heartbeat tick and returns how many notifications were
    /// rendered.
    ///
    /// # Errors
    /// Returns an error when the `achievements` value is not a list of
    /// notification items; the login flag is still updated.
    pub fn on_tick(&mut self, data: &Value) -> Result<usize> {
        self.logged_in = data.get(AUTH_CHECK_KEY) == Some(&Value::Bool(true));
        self.awaiting_response = false;

        let Some(raw) = data.get(ACHIEVEMENTS_KEY) else {
            return Ok(0);
        };
        let items: Vec<NotificationItem> = serde_json::from_value(raw.clone())
            .context("heartbeat achievements value is not a notification list")?;
        if items.is_empty() {
            return Ok(0);
        }

        let rendered = items.len();
        self.panel
            .get_or_insert_with(NotificationPanel::new)
            .show(items);
        Ok(rendered)
    }

    /// A heartbeat that failed in transit frees the in-flight slot.
    pub fn on_error(&mut self) {
        self.awaiting_response = false;
    }

    pub fn on_visibility_change(&mut self, hidden: bool) {
        self.window_visible = !hidden;
    }

    /// Hides the panel. Items already shown stay in it.
    pub fn dismiss(&mut self) {
        if let Some(panel) = self.panel.as_mut() {
            panel.visible = false;
        }
    }

    #[must_use]
    pub fn panel(&self) -> Option<&NotificationPanel> {
        self.panel.as_ref()
    }

    #[must_use]
    pub fn is_panel_visible(&self) -> bool {
        self.panel.as_ref().is_some_and(NotificationPanel::is_visible)
    }

    #[must_use]
    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }
}
