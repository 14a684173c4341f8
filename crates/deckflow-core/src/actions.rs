//! The interface page actions implement, and the context they are invoked with.

use std::sync::Arc;

use image::RgbaImage;

use crate::controller::DeckController;
use crate::identifier::InputIdentifier;
use crate::inputs::{ControllerInput, ControllerInputState, LabelPosition};
use crate::page::Page;
use crate::shared::Color;

/// Events delivered to the actions of an input's active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputEvent {
    Down,
    Up,
    /// Released before the hold threshold elapsed.
    ShortUp,
    HoldStart,
    /// Released after a hold started.
    HoldStop,
    TurnCw,
    TurnCcw,
    ShortTouchPress,
    LongTouchPress,
    DragLeft,
    DragRight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionHealth {
    Ok,
    /// The installed plugin is older than the one the page was built with.
    Outdated,
    MissingPlugin,
}

impl ActionHealth {
    pub fn is_unavailable(self) -> bool {
        self != ActionHealth::Ok
    }
}

/// A user-configured behaviour bound to one state of an input.
///
/// Every callback runs on the controller's worker pool, never on the render or tick loop.
pub trait Action: Send + Sync {
    fn id(&self) -> &str;

    fn health(&self) -> ActionHealth {
        ActionHealth::Ok
    }

    /// The input finished loading with this action's state active.
    fn on_ready(&self, _ctx: &ActionContext) {}

    /// The action's settings or the page changed while it was visible.
    fn on_update(&self, _ctx: &ActionContext) {}

    /// Periodic hook driven by the tick loop.
    fn on_tick(&self, _ctx: &ActionContext) {}

    fn event_callback(&self, _event: InputEvent, _ctx: &ActionContext) {}
}

/// Stand-in for an action whose plugin is not installed.
pub struct MissingAction {
    id: String,
}

impl MissingAction {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_owned() }
    }
}

impl Action for MissingAction {
    fn id(&self) -> &str {
        &self.id
    }

    fn health(&self) -> ActionHealth {
        ActionHealth::MissingPlugin
    }
}

/// Where an action callback is running, and handles to change what that input shows.
#[derive(Clone)]
pub struct ActionContext {
    pub controller: Arc<DeckController>,
    pub page: Arc<Page>,
    pub identifier: InputIdentifier,
    pub state: u16,
    /// Position of the action inside its state's action list.
    pub index: usize,
}

impl ActionContext {
    pub fn input(&self) -> Option<Arc<ControllerInput>> {
        self.controller.get_input(&self.identifier)
    }

    pub fn input_state(&self) -> Option<Arc<ControllerInputState>> {
        self.input()?.get_state(self.state)
    }

    pub fn settings(&self) -> serde_json::Value {
        self.page
            .get_settings_for_action(&self.identifier, self.state, self.index)
    }

    pub fn set_settings(&self, settings: serde_json::Value) {
        self.page
            .set_settings_for_action(&self.identifier, self.state, self.index, settings);
    }

    /// Set the action-provided label text; page labels still take precedence.
    pub fn set_label(&self, position: LabelPosition, text: Option<String>) {
        if let Some(state) = self.input_state() {
            state.label_manager().lock().set_action_text(position, text);
            self.refresh();
        }
    }

    pub fn set_media_path(&self, path: Option<&str>) {
        if let Some(state) = self.input_state() {
            state.set_action_media_path(path, &self.controller);
            self.refresh();
        }
    }

    pub fn set_background_color(&self, color: Option<Color>) {
        if let Some(state) = self.input_state() {
            state.background_manager().lock().set_action_color(color);
            self.refresh();
        }
    }

    /// Flash an image over the input for `duration`.
    pub fn show_overlay(&self, image: RgbaImage, duration: std::time::Duration) {
        if let Some(state) = self.input_state() {
            state.show_overlay(&self.controller, &self.identifier, image, duration);
        }
    }

    pub fn set_state(&self, state: u16) {
        if let Some(input) = self.input() {
            input.set_state(&self.controller, state);
        }
    }

    fn refresh(&self) {
        if let Some(input) = self.input()
            && input.active_state() == self.state
        {
            input.update(&self.controller);
        }
    }
}
