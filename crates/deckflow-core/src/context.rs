//! Collaborators injected into every controller.

use std::sync::Arc;

use dashmap::DashMap;

use crate::actions::Action;
use crate::identifier::InputIdentifier;
use crate::shared::Paths;
use crate::store::AppSettings;
use crate::ui::UiSender;

/// Instantiates the actions a page refers to. Implemented by the plugin layer.
pub trait ActionFactory: Send + Sync {
    /// `None` means no installed plugin provides `id`.
    fn create(
        &self,
        id: &str,
        settings: &serde_json::Value,
        identifier: &InputIdentifier,
        state: u16,
    ) -> Option<Arc<dyn Action>>;
}

/// A factory that knows no actions; every page action renders as missing.
pub struct NoActions;

impl ActionFactory for NoActions {
    fn create(
        &self,
        _id: &str,
        _settings: &serde_json::Value,
        _identifier: &InputIdentifier,
        _state: u16,
    ) -> Option<Arc<dyn Action>> {
        None
    }
}

/// The owner of a set of controllers, asked to drop and re-detect a failing deck.
pub trait DeckLifecycle: Send + Sync {
    fn remove_and_reconnect(&self, serial: &str);
}

pub struct NoLifecycle;

impl DeckLifecycle for NoLifecycle {
    fn remove_and_reconnect(&self, serial: &str) {
        log::warn!("Deck {serial} failed but no manager is attached to reconnect it");
    }
}

/// Consecutive transport failures per serial number. Shared across controllers so a count
/// survives reconnecting the same deck.
#[derive(Default)]
pub struct FailureTracker {
    counts: DashMap<String, u32>,
}

impl FailureTracker {
    pub fn record_failure(&self, serial: &str) -> u32 {
        let mut entry = self.counts.entry(serial.to_owned()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn record_success(&self, serial: &str) {
        if let Some(mut entry) = self.counts.get_mut(serial) {
            *entry = 0;
        }
    }

    pub fn count(&self, serial: &str) -> u32 {
        self.counts.get(serial).map(|c| *c).unwrap_or(0)
    }

    pub fn reset(&self, serial: &str) {
        self.counts.remove(serial);
    }
}

#[derive(Clone)]
pub struct DeckContext {
    pub settings: Arc<AppSettings>,
    pub paths: Paths,
    pub actions: Arc<dyn ActionFactory>,
    pub ui: UiSender,
    pub lifecycle: Arc<dyn DeckLifecycle>,
    pub failures: Arc<FailureTracker>,
}

impl DeckContext {
    pub fn new(settings: AppSettings, paths: Paths) -> Self {
        Self {
            settings: Arc::new(settings),
            paths,
            actions: Arc::new(NoActions),
            ui: UiSender::default(),
            lifecycle: Arc::new(NoLifecycle),
            failures: Arc::new(FailureTracker::default()),
        }
    }

    pub fn with_actions(mut self, actions: Arc<dyn ActionFactory>) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: Arc<dyn DeckLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_ui(mut self, ui: UiSender) -> Self {
        self.ui = ui;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_counts_reset_on_success() {
        let tracker = FailureTracker::default();
        assert_eq!(tracker.record_failure("A"), 1);
        assert_eq!(tracker.record_failure("A"), 2);
        assert_eq!(tracker.record_failure("B"), 1);
        tracker.record_success("A");
        assert_eq!(tracker.count("A"), 0);
        assert_eq!(tracker.count("B"), 1);
    }
}
