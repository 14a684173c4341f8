use crate::identifier::InputIdentifier;

use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    /// The render loop's median frame rate crossed the warning threshold.
    LowFps { serial: String, low: bool, fps: f32 },
    StateChanged {
        serial: String,
        identifier: InputIdentifier,
        state: u16,
    },
    /// An action bound on the active page is outdated or its plugin is missing.
    ActionUnavailable {
        serial: String,
        identifier: InputIdentifier,
        action: String,
    },
    DeckRemoved { serial: String },
    ScreensaverShown { serial: String, showing: bool },
}

/// Sending half handed to controllers. Cloning is cheap; sends never block.
#[derive(Clone)]
pub struct UiSender {
    sender: broadcast::Sender<UiEvent>,
}

impl UiSender {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: UiEvent) {
        // No subscribers is the headless case, not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for UiSender {
    fn default() -> Self {
        Self::new(64)
    }
}
