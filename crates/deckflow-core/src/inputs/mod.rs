//! Physical inputs (keys, dials, touchscreens) and their state machines.
//!
//! Each input owns an ordered map of states; exactly one is active. Presses run through a
//! small machine that turns down/up edges into `Down`, `Up`, `ShortUp`, `HoldStart` and
//! `HoldStop`, with the hold timer living on the controller's scheduler.

pub mod dial;
pub mod key;
pub mod managers;
pub mod state;
pub mod touchscreen;

pub use crate::render::label::LabelPosition;
pub use managers::{
    BackgroundColorManager, LabelConfig, LabelManager, LayoutConfig, LayoutManager,
};
pub use state::{ComposeRequest, ControllerInputState};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use image::RgbaImage;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::actions::{Action, ActionContext, InputEvent};
use crate::controller::DeckController;
use crate::device::{Deck, DeckEvent};
use crate::identifier::{InputIdentifier, InputKind};
use crate::page::Page;
use crate::scheduler::TimerToken;
use crate::ui::UiEvent;

#[derive(Default)]
struct PressState {
    pressed: bool,
    hold_started: bool,
    hold_timer: Option<TimerToken>,
}

pub struct ControllerInput {
    identifier: InputIdentifier,
    states: RwLock<BTreeMap<u16, Arc<ControllerInputState>>>,
    state: AtomicU16,
    press: Mutex<PressState>,
    default_family: String,
}

impl ControllerInput {
    pub fn new(identifier: InputIdentifier, default_family: &str) -> Self {
        let input = Self {
            identifier,
            states: RwLock::new(BTreeMap::new()),
            state: AtomicU16::new(0),
            press: Mutex::new(PressState::default()),
            default_family: default_family.to_owned(),
        };
        input.create_n_states(1);
        input
    }

    pub fn identifier(&self) -> &InputIdentifier {
        &self.identifier
    }

    pub fn kind(&self) -> InputKind {
        self.identifier.kind()
    }

    pub fn state_count(&self) -> u16 {
        self.states.read().len() as u16
    }

    pub fn get_state(&self, state: u16) -> Option<Arc<ControllerInputState>> {
        self.states.read().get(&state).cloned()
    }

    pub fn active_state(&self) -> u16 {
        self.state.load(Ordering::SeqCst)
    }

    /// The active state. Falls back to state 0, which always exists.
    pub fn get_active_state(&self) -> Arc<ControllerInputState> {
        let states = self.states.read();
        states
            .get(&self.active_state())
            .or_else(|| states.values().next())
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(ControllerInputState::new(
                    self.identifier.clone(),
                    0,
                    &self.default_family,
                ))
            })
    }

    /// Grow or shrink the state map to `n` states (at least one). Removed states release
    /// their media and actions.
    pub fn create_n_states(&self, n: u16) {
        let n = n.max(1);
        let removed: Vec<Arc<ControllerInputState>> = {
            let mut states = self.states.write();
            for state in 0..n {
                states.entry(state).or_insert_with(|| {
                    Arc::new(ControllerInputState::new(
                        self.identifier.clone(),
                        state,
                        &self.default_family,
                    ))
                });
            }
            let stale: Vec<u16> = states.keys().copied().filter(|s| *s >= n).collect();
            stale.iter().filter_map(|s| states.remove(s)).collect()
        };
        for state in removed {
            state.close();
        }
        if self.active_state() >= n {
            self.state.store(0, Ordering::SeqCst);
        }
    }

    /// Append a state and return its index.
    pub fn add_state(&self) -> u16 {
        let n = self.state_count();
        self.create_n_states(n + 1);
        n
    }

    /// Remove state `state`; later states shift down by one. The last state cannot be removed.
    pub fn remove_state(&self, state: u16) -> bool {
        let removed = {
            let mut states = self.states.write();
            if states.len() <= 1 {
                return false;
            }
            let Some(removed) = states.remove(&state) else {
                return false;
            };
            let later: Vec<u16> = states.keys().copied().filter(|s| *s > state).collect();
            for index in later {
                if let Some(moved) = states.remove(&index) {
                    moved.renumber(index - 1);
                    states.insert(index - 1, moved);
                }
            }
            removed
        };
        removed.close();
        let active = self.active_state();
        if active >= self.state_count() || active == state {
            self.state.store(0, Ordering::SeqCst);
        }
        true
    }

    /// Switch the active state, notify the UI and render it.
    pub fn set_state(&self, controller: &Arc<DeckController>, state: u16) {
        if self.get_state(state).is_none() {
            log::warn!("{} has no state {state}", self.identifier);
            return;
        }
        self.state.store(state, Ordering::SeqCst);
        controller.ui().emit(UiEvent::StateChanged {
            serial: controller.serial().to_owned(),
            identifier: self.identifier.clone(),
            state,
        });
        self.update(controller);
        self.run_actions(controller, "on_ready", |action, ctx| action.on_ready(ctx));
    }

    /// Queue a re-render on the render loop.
    pub fn update(&self, controller: &DeckController) {
        controller.mark_dirty(&self.identifier);
    }

    pub fn load_from_page(&self, controller: &DeckController, page: &Page) {
        let config = page.input_config(&self.identifier);
        self.load_from_input_dict(controller, &config, Some(page));
    }

    /// Rebuild every state from an input config of the form `{ "states": { "0": {...} } }`.
    /// Action objects come from `page` when given.
    pub fn load_from_input_dict(&self, controller: &DeckController, config: &Value, page: Option<&Page>) {
        let count = config
            .get("states")
            .and_then(Value::as_object)
            .and_then(|states| states.keys().filter_map(|k| k.parse::<u16>().ok()).max())
            .map(|max| max + 1)
            .unwrap_or(1);

        let mut fresh = BTreeMap::new();
        for index in 0..count {
            let state = Arc::new(ControllerInputState::new(
                self.identifier.clone(),
                index,
                &self.default_family,
            ));
            if let Some(page) = page {
                state.set_actions(page.action_objects(&self.identifier, index));
            }
            let state_config = config
                .get("states")
                .and_then(|s| s.get(index.to_string()))
                .cloned()
                .unwrap_or(Value::Null);
            state.load_from_config(&state_config, controller);
            fresh.insert(index, state);
        }

        // Readers always see a complete map, never an empty one.
        let old = std::mem::replace(&mut *self.states.write(), fresh);
        for state in old.into_values() {
            state.close();
        }

        let active = config
            .get("state")
            .and_then(Value::as_u64)
            .map(|s| s as u16)
            .filter(|s| *s < count)
            .unwrap_or(0);
        self.state.store(active, Ordering::SeqCst);

        for action in self.get_active_state().actions() {
            if action.health().is_unavailable() {
                controller.ui().emit(UiEvent::ActionUnavailable {
                    serial: controller.serial().to_owned(),
                    identifier: self.identifier.clone(),
                    action: action.id().to_owned(),
                });
            }
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.press.lock().pressed
    }

    /// Forget any press in progress without emitting events.
    pub fn release_press(&self) {
        let mut press = self.press.lock();
        if let Some(timer) = press.hold_timer.take() {
            timer.cancel();
        }
        press.pressed = false;
        press.hold_started = false;
    }

    pub(crate) fn press_down(self: &Arc<Self>, controller: &Arc<DeckController>) {
        let delay = Duration::from_millis(controller.settings().hold_threshold_ms);
        let weak_input = Arc::downgrade(self);
        let weak_controller = Arc::downgrade(controller);
        let timer = controller.scheduler().schedule(delay, move || {
            let (Some(input), Some(controller)) = (weak_input.upgrade(), weak_controller.upgrade())
            else {
                return;
            };
            let start_hold = {
                let mut press = input.press.lock();
                let start = press.pressed && !press.hold_started;
                press.hold_started |= start;
                start
            };
            if start_hold {
                input.dispatch(&controller, InputEvent::HoldStart);
            }
        });
        {
            let mut press = self.press.lock();
            if let Some(previous) = press.hold_timer.replace(timer) {
                previous.cancel();
            }
            press.pressed = true;
            press.hold_started = false;
        }
        self.update(controller);
        self.dispatch(controller, InputEvent::Down);
    }

    pub(crate) fn press_up(self: &Arc<Self>, controller: &Arc<DeckController>) {
        let held = {
            let mut press = self.press.lock();
            if !press.pressed {
                return;
            }
            if let Some(timer) = press.hold_timer.take() {
                timer.cancel();
            }
            press.pressed = false;
            std::mem::take(&mut press.hold_started)
        };
        self.update(controller);
        self.dispatch(controller, InputEvent::Up);
        self.dispatch(
            controller,
            if held {
                InputEvent::HoldStop
            } else {
                InputEvent::ShortUp
            },
        );
    }

    /// Route a device event for this input.
    pub fn event_callback(self: &Arc<Self>, controller: &Arc<DeckController>, event: DeckEvent) {
        match self.kind() {
            InputKind::Key => key::handle_event(self, controller, event),
            InputKind::Dial => dial::handle_event(self, controller, event),
            InputKind::Touchscreen => touchscreen::handle_event(self, controller, event),
        }
    }

    /// Deliver `event` to every action of the active state on the worker pool.
    pub fn dispatch(&self, controller: &Arc<DeckController>, event: InputEvent) {
        log::debug!("{} {event:?}", self.identifier);
        self.run_actions(controller, "event", move |action, ctx| {
            action.event_callback(event, ctx)
        });
    }

    pub fn on_tick(&self, controller: &Arc<DeckController>) {
        self.run_actions(controller, "on_tick", |action, ctx| action.on_tick(ctx));
    }

    pub fn on_ready(&self, controller: &Arc<DeckController>) {
        self.run_actions(controller, "on_ready", |action, ctx| action.on_ready(ctx));
    }

    pub fn on_update(&self, controller: &Arc<DeckController>) {
        self.run_actions(controller, "on_update", |action, ctx| action.on_update(ctx));
    }

    fn run_actions<F>(&self, controller: &Arc<DeckController>, what: &str, call: F)
    where
        F: Fn(&dyn Action, &ActionContext) + Clone + Send + 'static,
    {
        let Some(page) = controller.active_page() else {
            return;
        };
        let state = self.active_state();
        let Some(input_state) = self.get_state(state) else {
            return;
        };
        for (index, action) in input_state.actions().into_iter().enumerate() {
            let ctx = ActionContext {
                controller: controller.clone(),
                page: page.clone(),
                identifier: self.identifier.clone(),
                state,
                index,
            };
            let call = call.clone();
            let label = format!("{} {what} on {}", action.id(), self.identifier);
            controller
                .workers()
                .execute(label, move || call(action.as_ref(), &ctx));
        }
    }

    /// Composite the active state for the device.
    pub fn get_current_image(&self, controller: &DeckController) -> RgbaImage {
        match self.kind() {
            InputKind::Key => key::render(self, controller),
            InputKind::Dial => dial::render(self, controller),
            InputKind::Touchscreen => touchscreen::render(self, controller),
        }
    }

    /// Release every state's resources.
    pub fn close(&self) {
        self.release_press();
        for state in self.states.read().values() {
            state.close();
        }
    }
}

/// All inputs of one deck.
pub struct InputSet {
    inputs: BTreeMap<InputIdentifier, Arc<ControllerInput>>,
}

impl InputSet {
    pub fn for_deck(deck: &dyn Deck, default_family: &str) -> Self {
        let identifiers = [InputKind::Key, InputKind::Dial, InputKind::Touchscreen]
            .into_iter()
            .flat_map(|kind| kind.available_identifiers(deck));
        Self {
            inputs: identifiers
                .map(|id| {
                    let input = Arc::new(ControllerInput::new(id.clone(), default_family));
                    (id, input)
                })
                .collect(),
        }
    }

    pub fn get(&self, identifier: &InputIdentifier) -> Option<Arc<ControllerInput>> {
        self.inputs.get(identifier).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ControllerInput>> {
        self.inputs.values()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &InputIdentifier> {
        self.inputs.keys()
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn close(&self) {
        for input in self.inputs.values() {
            input.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FakeDeck, FakeDeckLayout};
    use crate::identifier::DEFAULT_TOUCHSCREEN;

    fn key() -> ControllerInput {
        ControllerInput::new(InputIdentifier::Key { x: 0, y: 0 }, "Roboto")
    }

    struct Recorder(Arc<Mutex<Vec<InputEvent>>>);

    impl Action for Recorder {
        fn id(&self) -> &str {
            "test.recorder"
        }

        fn event_callback(&self, event: InputEvent, _ctx: &ActionContext) {
            self.0.lock().push(event);
        }
    }

    struct RecorderFactory(Arc<Mutex<Vec<InputEvent>>>);

    impl crate::context::ActionFactory for RecorderFactory {
        fn create(
            &self,
            _id: &str,
            _settings: &Value,
            _identifier: &InputIdentifier,
            _state: u16,
        ) -> Option<Arc<dyn Action>> {
            Some(Arc::new(Recorder(self.0.clone())))
        }
    }

    /// A headless controller with a recording action on key 0 and a single worker, so
    /// callbacks run in dispatch order.
    fn recording_controller(
        root: &std::path::Path,
        hold_threshold_ms: u64,
    ) -> (Arc<DeckController>, Arc<Mutex<Vec<InputEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let settings = crate::store::AppSettings {
            hold_threshold_ms,
            worker_threads: 1,
            font_dirs: vec![root.join("no-fonts")],
            ..Default::default()
        };
        let context = crate::context::DeckContext::new(settings, crate::shared::Paths::rooted(root))
            .with_actions(Arc::new(RecorderFactory(events.clone())));
        let controller = DeckController::headless(
            Arc::new(FakeDeck::new("H", FakeDeckLayout::default())),
            context,
            crate::store::DeckSettings::default(),
        );
        let page = Arc::new(Page::from_json(
            "hold",
            serde_json::json!({ "keys": { "0,0": { "states": { "0": {
                "actions": [ { "id": "test.recorder" } ]
            } } } } }),
        ));
        controller.load_page(Some(page));
        controller.render_tick();
        (controller, events)
    }

    #[test]
    fn short_press_ends_with_short_up() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, events) = recording_controller(dir.path(), 200);
        controller.handle_device_event(DeckEvent::KeyDown(0));
        controller.handle_device_event(DeckEvent::KeyUp(0));
        std::thread::sleep(Duration::from_millis(400));
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));

        assert_eq!(
            *events.lock(),
            vec![InputEvent::Down, InputEvent::Up, InputEvent::ShortUp]
        );
        controller.close();
    }

    #[test]
    fn long_press_starts_and_stops_a_hold() {
        let dir = tempfile::tempdir().unwrap();
        let (controller, events) = recording_controller(dir.path(), 50);
        controller.handle_device_event(DeckEvent::KeyDown(0));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !events.lock().contains(&InputEvent::HoldStart) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        controller.handle_device_event(DeckEvent::KeyUp(0));
        assert!(controller.workers().wait_idle(Duration::from_secs(5)));

        assert_eq!(
            *events.lock(),
            vec![
                InputEvent::Down,
                InputEvent::HoldStart,
                InputEvent::Up,
                InputEvent::HoldStop
            ]
        );
        controller.close();
    }

    #[test]
    fn create_n_states_grows_and_shrinks() {
        let input = key();
        assert_eq!(input.state_count(), 1);
        input.create_n_states(3);
        assert_eq!(input.state_count(), 3);
        input.state.store(2, Ordering::SeqCst);
        input.create_n_states(2);
        assert_eq!(input.state_count(), 2);
        assert_eq!(input.active_state(), 0);
        input.create_n_states(0);
        assert_eq!(input.state_count(), 1);
    }

    #[test]
    fn reloading_states_never_exposes_an_empty_map() {
        use std::sync::atomic::AtomicBool;

        let dir = tempfile::tempdir().unwrap();
        let (controller, _) = recording_controller(dir.path(), 200);
        let input = Arc::new(key());
        let config = serde_json::json!({ "state": 2, "states": { "0": {}, "1": {}, "2": {} } });
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let input = input.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                let mut empty = 0;
                while !done.load(Ordering::SeqCst) {
                    if input.state_count() == 0 || input.get_state(0).is_none() {
                        empty += 1;
                    }
                }
                empty
            })
        };
        for _ in 0..200 {
            input.load_from_input_dict(&controller, &config, None);
        }
        done.store(true, Ordering::SeqCst);

        assert_eq!(reader.join().unwrap(), 0);
        assert_eq!(input.state_count(), 3);
        assert_eq!(input.active_state(), 2);
    }

    #[test]
    fn add_and_remove_states() {
        let input = key();
        assert_eq!(input.add_state(), 1);
        assert_eq!(input.add_state(), 2);
        assert!(input.remove_state(1));
        assert_eq!(input.state_count(), 2);
        assert_eq!(input.get_state(1).unwrap().state(), 1);
        assert!(input.remove_state(0));
        assert!(!input.remove_state(0));
        assert_eq!(input.state_count(), 1);
    }

    #[test]
    fn input_set_covers_keys_dials_and_touchscreen() {
        let plus = FakeDeck::new("P", FakeDeckLayout::plus());
        let set = InputSet::for_deck(&plus, "Roboto");
        assert_eq!(set.len(), 8 + 4 + 1);
        assert!(set.get(&InputIdentifier::Dial(3)).is_some());
        assert!(
            set.get(&InputIdentifier::Touchscreen(DEFAULT_TOUCHSCREEN.into()))
                .is_some()
        );

        let original = FakeDeck::new("O", FakeDeckLayout::default());
        assert_eq!(InputSet::for_deck(&original, "Roboto").len(), 15);
    }
}
