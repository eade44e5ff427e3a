use std::collections::BTreeMap;
use std::sync::Arc;

use achievements_core::{
    AchievementsError, Contributor, EngineConfig, EventPayload, ExtensionDescriptor, HostEvent,
    ProgressSignal, UserId,
};
use tracing::{debug, info, warn};

use crate::bus::{EventBus, SubscriptionId};

/// Receiver of normalized progress signals.
pub trait SignalSink: Send + Sync {
    /// Must absorb its own failures; the caller is another subsystem's
    /// event handler.
    fn signal(&self, signal: ProgressSignal);
}

/// Adapter translating one external subsystem's events into progress
/// signals. Adapters never touch progress state themselves.
pub trait Extension: Send + Sync {
    fn descriptor(&self) -> &ExtensionDescriptor;

    /// The user credited with `event`, or `None` to ignore it.
    fn resolve_user(&self, event: &HostEvent) -> Option<UserId> {
        event.payload.acting_user()
    }

    fn trigger_key(&self, event: &HostEvent) -> String {
        event.name.clone()
    }
}

struct RegisteredExtension {
    extension: Arc<dyn Extension>,
    subscriptions: Vec<SubscriptionId>,
}

/// Wires adapters into the bus. Consumed by [`ExtensionRegistryBuilder::build`],
/// after which the set of adapters is fixed.
pub struct ExtensionRegistryBuilder {
    bus: Arc<dyn EventBus>,
    sink: Arc<dyn SignalSink>,
    extensions: BTreeMap<String, RegisteredExtension>,
}

impl ExtensionRegistryBuilder {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, sink: Arc<dyn SignalSink>) -> Self {
        Self {
            bus,
            sink,
            extensions: BTreeMap::new(),
        }
    }

    /// Subscribes the adapter to every action it declares.
    ///
    /// Registering an identifier twice replaces the earlier adapter and
    /// detaches its handlers first, so each identifier holds exactly one set
    /// of subscriptions.
    ///
    /// # Errors
    /// Returns [`AchievementsError::Validation`] when the descriptor is
    /// malformed; nothing is subscribed in that case.
    pub fn register(&mut self, extension: Arc<dyn Extension>) -> Result<(), AchievementsError> {
        let descriptor = extension.descriptor();
        descriptor.validate()?;
        let id = descriptor.id.clone();

        if let Some(previous) = self.extensions.remove(&id) {
            warn!(extension = %id, "extension registered twice; replacing previous instance");
            for subscription in previous.subscriptions {
                self.bus.unsubscribe(subscription);
            }
        }

        let subscriptions = descriptor
            .actions
            .keys()
            .map(|action| {
                let handler_extension = Arc::clone(&extension);
                let sink = Arc::clone(&self.sink);
                self.bus.subscribe(
                    action,
                    Arc::new(move |event: &HostEvent| {
                        dispatch(handler_extension.as_ref(), sink.as_ref(), event);
                    }),
                )
            })
            .collect();

        info!(
            extension = %id,
            version = descriptor.version,
            actions = descriptor.actions.len(),
            "extension registered"
        );
        self.extensions.insert(
            id,
            RegisteredExtension {
                extension,
                subscriptions,
            },
        );
        Ok(())
    }

    #[must_use]
    pub fn build(self) -> ExtensionRegistry {
        ExtensionRegistry {
            extensions: self.extensions,
        }
    }
}

fn dispatch(extension: &dyn Extension, sink: &dyn SignalSink, event: &HostEvent) {
    let Some(user_id) = extension.resolve_user(event) else {
        debug!(
            extension = %extension.descriptor().id,
            event = %event.name,
            "event has no attributable user; ignored"
        );
        return;
    };

    sink.signal(ProgressSignal {
        user_id,
        trigger_key: extension.trigger_key(event),
        payload: event.payload.clone(),
    });
}

/// Read-only view of the active adapters, keyed by identifier.
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, RegisteredExtension>,
}

impl ExtensionRegistry {
    /// Instantiates and registers each built-in adapter enabled by `config`.
    ///
    /// # Errors
    /// Returns [`AchievementsError::UnknownExtension`] when the configuration
    /// enables an identifier with no built-in adapter.
    pub fn from_config(
        config: &EngineConfig,
        bus: Arc<dyn EventBus>,
        sink: Arc<dyn SignalSink>,
    ) -> Result<Self, AchievementsError> {
        let mut builder = ExtensionRegistryBuilder::new(bus, sink);
        for id in &config.enabled_extensions {
            let extension = builtin_extension(id)
                .ok_or_else(|| AchievementsError::UnknownExtension(id.clone()))?;
            builder.register(extension)?;
        }
        Ok(builder.build())
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ExtensionDescriptor> {
        self.extensions
            .get(id)
            .map(|registered| registered.extension.descriptor())
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ExtensionDescriptor> {
        self.extensions
            .values()
            .map(|registered| registered.extension.descriptor())
    }

    #[must_use]
    pub fn subscription_count(&self, id: &str) -> usize {
        self.extensions
            .get(id)
            .map_or(0, |registered| registered.subscriptions.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

pub const BUILTIN_EXTENSION_IDS: [&str; 2] = [BuddyStreamExtension::ID, ContentExtension::ID];

#[must_use]
pub fn builtin_extension(id: &str) -> Option<Arc<dyn Extension>> {
    match id {
        BuddyStreamExtension::ID => Some(Arc::new(BuddyStreamExtension::new())),
        ContentExtension::ID => Some(Arc::new(ContentExtension::new())),
        _ => None,
    }
}

/// Social network account links made through the BuddyStream plugin.
pub struct BuddyStreamExtension {
    descriptor: ExtensionDescriptor,
}

impl BuddyStreamExtension {
    pub const ID: &'static str = "buddystream";

    #[must_use]
    pub fn new() -> Self {
        let actions = [
            ("buddystream_facebook_activated", "Facebook"),
            ("buddystream_flickr_activated", "Flickr"),
            ("buddystream_lastfm_activated", "Last.fm"),
            ("buddystream_twitter_activated", "Twitter"),
            ("buddystream_youtube_activated", "YouTube"),
        ]
        .into_iter()
        .map(|(action, network)| {
            (
                action.to_string(),
                format!("The user connects their {network} account to BuddyStream."),
            )
        })
        .collect();

        Self {
            descriptor: ExtensionDescriptor {
                id: Self::ID.to_string(),
                name: "BuddyStream".to_string(),
                description: "BuddyStream is a BuddyPress plugin that will synchronize all of \
                              your favorite Social Networks to the BuddyPress activity stream."
                    .to_string(),
                version: 1,
                actions,
                contributors: vec![Contributor {
                    name: "Peter Hofman".to_string(),
                    gravatar_url: Some(
                        "http://www.gravatar.com/avatar/fa62da3fa8b3997be04448e7280dad29"
                            .to_string(),
                    ),
                    profile_url: Some("http://profiles.wordpress.org/blackphantom/".to_string()),
                }],
                image_url: Some("http://placekitten.com/772/250".to_string()),
                rss_url: Some("http://buddystream.net/blog/feed/".to_string()),
                homepage_url: Some("http://wordpress.org/extend/plugins/buddystream/".to_string()),
            },
        }
    }
}

impl Default for BuddyStreamExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl Extension for BuddyStreamExtension {
    fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }

    // BuddyStream only ever reports account links.
    fn resolve_user(&self, event: &HostEvent) -> Option<UserId> {
        match &event.payload {
            EventPayload::SocialAccount { user_id, .. } => Some(*user_id),
            _ => None,
        }
    }
}

/// Host platform content lifecycle: publishing, approved comments and
/// registrations.
pub struct ContentExtension {
    descriptor: ExtensionDescriptor,
}

impl ContentExtension {
    pub const ID: &'static str = "content";

    #[must_use]
    pub fn new() -> Self {
        let actions = [
            ("post_published", "The user publishes a post."),
            ("comment_approved", "A comment the user wrote is approved."),
            ("user_registered", "The user registers an account."),
        ]
        .into_iter()
        .map(|(action, description)| (action.to_string(), description.to_string()))
        .collect();

        Self {
            descriptor: ExtensionDescriptor {
                id: Self::ID.to_string(),
                name: "Site content".to_string(),
                description: "Posts, comments and registrations on the host site.".to_string(),
                version: 1,
                actions,
                contributors: Vec::new(),
                image_url: None,
                rss_url: None,
                homepage_url: None,
            },
        }
    }
}

impl Default for ContentExtension {
    fn default() -> Self {
        Self::new()
    }
}

impl Extension for ContentExtension {
    fn descriptor(&self) -> &ExtensionDescriptor {
        &self.descriptor
    }
}
