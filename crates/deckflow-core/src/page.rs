//! JSON-backed page documents.
//!
//! A page maps input identifiers to per-state configuration and owns the action objects
//! instantiated for it. Layout of the document:
//!
//! ```json
//! {
//!   "keys": { "0,0": { "states": { "0": {
//!       "labels": { "bottom": { "text": "Hi" } },
//!       "media": { "path": "icon.png", "size": 1.0, "fill-mode": "cover" },
//!       "background": { "color": [10, 20, 30, 255] },
//!       "actions": [ { "id": "com.example.action", "settings": {} } ]
//!   } } } },
//!   "dials": { "0": { ... } },
//!   "touchscreens": { "sd-plus": { ... } },
//!   "brightness": { "value": 50, "overwrite": true },
//!   "background": { "path": "wall.png", "overwrite": true },
//!   "screensaver": { "enable": true, "overwrite": true }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context as _;
use parking_lot::RwLock;
use serde_json::{Value, json};

use crate::actions::{Action, MissingAction};
use crate::context::ActionFactory;
use crate::identifier::{InputIdentifier, InputKind};
use crate::store::{BackgroundSettings, ScreensaverSettings, json_value_to_bytes, write_atomic_bytes};

type ActionObjects = HashMap<InputIdentifier, BTreeMap<u16, Vec<Arc<dyn Action>>>>;

pub struct Page {
    name: String,
    path: Option<PathBuf>,
    json: RwLock<Value>,
    action_objects: RwLock<ActionObjects>,
    ready_to_clear: AtomicBool,
}

impl Page {
    pub fn from_json(name: impl Into<String>, json: Value) -> Self {
        let json = if json.is_object() { json } else { json!({}) };
        Self {
            name: name.into(),
            path: None,
            json: RwLock::new(json),
            action_objects: RwLock::new(HashMap::new()),
            ready_to_clear: AtomicBool::new(true),
        }
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read page {}", path.display()))?;
        let json: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("page {} is not valid JSON", path.display()))?;
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut page = Self::from_json(name, json);
        page.path = Some(path.to_path_buf());
        Ok(page)
    }

    pub fn save(&self) -> Result<(), anyhow::Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = json_value_to_bytes(&self.json.read())?;
        write_atomic_bytes(path, &bytes)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// `false` while a load of this page is still being applied to a deck.
    pub fn is_ready_to_clear(&self) -> bool {
        self.ready_to_clear.load(Ordering::Acquire)
    }

    pub fn set_ready_to_clear(&self, ready: bool) {
        self.ready_to_clear.store(ready, Ordering::Release);
    }

    pub fn json(&self) -> Value {
        self.json.read().clone()
    }

    pub fn input_config(&self, identifier: &InputIdentifier) -> Value {
        self.json
            .read()
            .get(identifier.kind().page_section())
            .and_then(|section| section.get(identifier.page_key()))
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub fn state_config(&self, identifier: &InputIdentifier, state: u16) -> Value {
        self.json
            .read()
            .get(identifier.kind().page_section())
            .and_then(|section| section.get(identifier.page_key()))
            .and_then(|input| input.get("states"))
            .and_then(|states| states.get(state.to_string()))
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// Number of states configured for an input; always at least one.
    pub fn state_count(&self, identifier: &InputIdentifier) -> u16 {
        let config = self.input_config(identifier);
        let Some(states) = config.get("states").and_then(Value::as_object) else {
            return 1;
        };
        states
            .keys()
            .filter_map(|k| k.parse::<u16>().ok())
            .max()
            .map(|max| max + 1)
            .unwrap_or(1)
    }

    /// Identifiers of a given kind that have configuration on this page.
    pub fn identifiers(&self, kind: InputKind) -> Vec<InputIdentifier> {
        self.json
            .read()
            .get(kind.page_section())
            .and_then(Value::as_object)
            .map(|section| {
                section
                    .keys()
                    .filter_map(|k| InputIdentifier::from_page_key(kind, k))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replace a single field of a state's config (`"labels"`, `"media"`, `"background"`, ...).
    pub fn set_state_field(&self, identifier: &InputIdentifier, state: u16, field: &str, value: Value) {
        let mut json = self.json.write();
        let Some(root) = json.as_object_mut() else {
            return;
        };
        let state_obj = root
            .entry(identifier.kind().page_section())
            .or_insert_with(|| json!({}))
            .as_object_mut()
            .map(|section| {
                section
                    .entry(identifier.page_key())
                    .or_insert_with(|| json!({ "states": {} }))
            })
            .and_then(Value::as_object_mut)
            .map(|input| input.entry("states").or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut)
            .map(|states| states.entry(state.to_string()).or_insert_with(|| json!({})))
            .and_then(Value::as_object_mut);
        if let Some(state_obj) = state_obj {
            state_obj.insert(field.to_owned(), value);
        }
    }

    fn action_entry(&self, identifier: &InputIdentifier, state: u16, index: usize) -> Option<Value> {
        self.state_config(identifier, state)
            .get("actions")
            .and_then(|a| a.get(index))
            .cloned()
    }

    pub fn get_settings_for_action(
        &self,
        identifier: &InputIdentifier,
        state: u16,
        index: usize,
    ) -> Value {
        self.action_entry(identifier, state, index)
            .and_then(|a| a.get("settings").cloned())
            .unwrap_or_else(|| json!({}))
    }

    pub fn set_settings_for_action(
        &self,
        identifier: &InputIdentifier,
        state: u16,
        index: usize,
        settings: Value,
    ) {
        let mut actions = self
            .state_config(identifier, state)
            .get("actions")
            .cloned()
            .unwrap_or_else(|| json!([]));
        if let Some(entry) = actions.get_mut(index).and_then(Value::as_object_mut) {
            entry.insert("settings".to_owned(), settings);
            self.set_state_field(identifier, state, "actions", actions);
        }
    }

    /// Instantiate every action referenced by the page. Unknown actions become placeholders
    /// that render the unavailable-action warning.
    pub fn load_action_objects(&self, factory: &dyn ActionFactory) {
        let mut objects: ActionObjects = HashMap::new();
        for kind in [InputKind::Key, InputKind::Dial, InputKind::Touchscreen] {
            for identifier in self.identifiers(kind) {
                for state in 0..self.state_count(&identifier) {
                    let entries = self
                        .state_config(&identifier, state)
                        .get("actions")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    let mut actions: Vec<Arc<dyn Action>> = Vec::with_capacity(entries.len());
                    for entry in entries {
                        let Some(id) = entry.get("id").and_then(Value::as_str) else {
                            continue;
                        };
                        let settings = entry.get("settings").cloned().unwrap_or_else(|| json!({}));
                        match factory.create(id, &settings, &identifier, state) {
                            Some(action) => actions.push(action),
                            None => {
                                log::warn!(
                                    "No plugin provides action {id} used on {identifier} of page {}",
                                    self.name
                                );
                                actions.push(Arc::new(MissingAction::new(id)));
                            }
                        }
                    }
                    if !actions.is_empty() {
                        objects
                            .entry(identifier.clone())
                            .or_default()
                            .insert(state, actions);
                    }
                }
            }
        }
        *self.action_objects.write() = objects;
    }

    pub fn action_objects(&self, identifier: &InputIdentifier, state: u16) -> Vec<Arc<dyn Action>> {
        self.action_objects
            .read()
            .get(identifier)
            .and_then(|states| states.get(&state))
            .cloned()
            .unwrap_or_default()
    }

    /// Page-level brightness that replaces the deck setting, if the page asks for it.
    pub fn brightness_override(&self) -> Option<u8> {
        let json = self.json.read();
        let block = json.get("brightness")?;
        if !overwrites(block) {
            return None;
        }
        block
            .get("value")
            .and_then(Value::as_u64)
            .map(|v| v.min(100) as u8)
    }

    pub fn background_override(&self) -> Option<BackgroundSettings> {
        let block = self.json.read().get("background").cloned()?;
        if !overwrites(&block) {
            return None;
        }
        serde_json::from_value(block).ok()
    }

    pub fn screensaver_override(&self) -> Option<ScreensaverSettings> {
        let block = self.json.read().get("screensaver").cloned()?;
        if !overwrites(&block) {
            return None;
        }
        serde_json::from_value(block).ok()
    }
}

fn overwrites(block: &Value) -> bool {
    block.get("overwrite").and_then(Value::as_bool).unwrap_or(false)
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionHealth;
    use crate::context::NoActions;

    fn sample() -> Page {
        Page::from_json(
            "sample",
            json!({
                "keys": {
                    "1,0": { "states": {
                        "0": { "actions": [ { "id": "a.b", "settings": { "n": 1 } } ] },
                        "2": {}
                    } }
                },
                "dials": { "0": { "states": { "0": {} } } },
                "brightness": { "value": 140, "overwrite": true },
                "background": { "path": "wall.png" }
            }),
        )
    }

    #[test]
    fn reads_config_snapshots() {
        let page = sample();
        let key = InputIdentifier::Key { x: 1, y: 0 };
        assert_eq!(page.state_count(&key), 3);
        assert_eq!(page.state_count(&InputIdentifier::Key { x: 0, y: 0 }), 1);
        assert_eq!(page.identifiers(InputKind::Dial), vec![InputIdentifier::Dial(0)]);
        assert_eq!(page.get_settings_for_action(&key, 0, 0), json!({ "n": 1 }));
        assert_eq!(page.get_settings_for_action(&key, 0, 5), json!({}));
        assert_eq!(page.brightness_override(), Some(100));
        assert_eq!(page.background_override(), None);
    }

    #[test]
    fn writes_settings_and_fields() {
        let page = sample();
        let key = InputIdentifier::Key { x: 1, y: 0 };
        page.set_settings_for_action(&key, 0, 0, json!({ "n": 2 }));
        assert_eq!(page.get_settings_for_action(&key, 0, 0), json!({ "n": 2 }));

        let fresh = InputIdentifier::Key { x: 4, y: 2 };
        page.set_state_field(&fresh, 1, "background", json!({ "color": [1, 2, 3, 4] }));
        assert_eq!(
            page.state_config(&fresh, 1)["background"]["color"],
            json!([1, 2, 3, 4])
        );
    }

    #[test]
    fn unknown_actions_become_missing_placeholders() {
        let page = sample();
        page.load_action_objects(&NoActions);
        let actions = page.action_objects(&InputIdentifier::Key { x: 1, y: 0 }, 0);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].health(), ActionHealth::MissingPlugin);
        assert_eq!(actions[0].id(), "a.b");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.json");
        std::fs::write(&path, b"{\"keys\":{}}").unwrap();
        let page = Page::load(&path).unwrap();
        assert_eq!(page.name(), "main");
        page.set_state_field(
            &InputIdentifier::Dial(2),
            0,
            "labels",
            json!({ "top": { "text": "Vol" } }),
        );
        page.save().unwrap();

        let reloaded = Page::load(&path).unwrap();
        assert_eq!(
            reloaded.state_config(&InputIdentifier::Dial(2), 0)["labels"]["top"]["text"],
            "Vol"
        );
    }
}
