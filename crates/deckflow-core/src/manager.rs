//! Owns the controllers of every connected deck and reconnects failing ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::RwLock;

use crate::context::{DeckContext, DeckLifecycle};
use crate::controller::DeckController;
use crate::device::{Deck, list_hardware_decks};
use crate::page::Page;
use crate::store::{DeckSettings, decks::get_deck_settings};

/// Pause before re-scanning after a deck was dropped, so a replugged device can re-enumerate.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

pub struct DeckManager {
    context: DeckContext,
    controllers: RwLock<HashMap<String, Arc<DeckController>>>,
}

/// The lifecycle hook handed to controllers. Weak so controllers never keep the manager alive.
struct ManagerHandle(Weak<DeckManager>);

impl DeckLifecycle for ManagerHandle {
    fn remove_and_reconnect(&self, serial: &str) {
        let Some(manager) = self.0.upgrade() else {
            return;
        };
        let serial = serial.to_owned();
        // Called from the failing controller's render loop, which `remove` has to stop.
        let spawned = std::thread::Builder::new()
            .name("deck-reconnect".to_owned())
            .spawn(move || {
                manager.remove(&serial);
                std::thread::sleep(RECONNECT_DELAY);
                if let Err(error) = manager.scan() {
                    log::warn!("Re-scanning for decks failed: {error:#}");
                }
            });
        if let Err(error) = spawned {
            log::error!("Failed to spawn reconnect thread: {error}");
        }
    }
}

impl DeckManager {
    pub fn new(context: DeckContext) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            context: context.with_lifecycle(Arc::new(ManagerHandle(weak.clone()))),
            controllers: RwLock::new(HashMap::new()),
        })
    }

    pub fn context(&self) -> &DeckContext {
        &self.context
    }

    /// Open every connected hardware deck that has no controller yet. Returns how many were added.
    pub fn scan(&self) -> anyhow::Result<usize> {
        let mut added = 0;
        for deck in list_hardware_decks()? {
            if self.controllers.read().contains_key(deck.serial_number()) {
                continue;
            }
            self.add_deck(Arc::new(deck));
            added += 1;
        }
        log::info!("Found {added} new deck(s)");
        Ok(added)
    }

    /// Build and start a controller for `deck`, then load its default page if it has one.
    pub fn add_deck(&self, deck: Arc<dyn Deck>) -> Arc<DeckController> {
        let serial = deck.serial_number().to_owned();
        let settings = self.deck_settings(&serial);
        let default_page = settings.default_page.clone();
        // A reconnected deck starts with a fresh failure budget.
        self.context.failures.reset(&serial);
        let controller = DeckController::new(deck, self.context.clone(), settings);
        let previous = self
            .controllers
            .write()
            .insert(serial.clone(), controller.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        if let Some(page) = default_page {
            let path = self.resolve_page_path(&page);
            if let Err(error) = self.load_page_file(&serial, &path) {
                log::warn!("Failed to load default page for {serial}: {error:#}");
            }
        }
        controller
    }

    fn deck_settings(&self, serial: &str) -> DeckSettings {
        match get_deck_settings(&self.context.paths.decks_dir(), serial) {
            Ok(store) => store.value,
            Err(error) => {
                log::warn!("Failed to read settings for deck {serial}: {error:#}");
                DeckSettings::default()
            }
        }
    }

    /// Page references are file paths, absolute or relative to the pages directory.
    pub fn resolve_page_path(&self, page: &str) -> PathBuf {
        let path = Path::new(page);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let in_pages = self.context.paths.pages_dir().join(path);
        if in_pages.extension().is_none() {
            in_pages.with_extension("json")
        } else {
            in_pages
        }
    }

    pub fn load_page_file(&self, serial: &str, path: &Path) -> anyhow::Result<Arc<Page>> {
        let controller = self
            .controller(serial)
            .with_context(|| format!("no deck with serial {serial}"))?;
        let page = Arc::new(Page::load(path)?);
        controller.load_page(Some(page.clone()));
        Ok(page)
    }

    pub fn controller(&self, serial: &str) -> Option<Arc<DeckController>> {
        self.controllers.read().get(serial).cloned()
    }

    pub fn controllers(&self) -> Vec<Arc<DeckController>> {
        self.controllers.read().values().cloned().collect()
    }

    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.controllers.read().keys().cloned().collect();
        serials.sort();
        serials
    }

    /// Close and forget one controller.
    pub fn remove(&self, serial: &str) -> bool {
        let removed = self.controllers.write().remove(serial);
        match removed {
            Some(controller) => {
                controller.close();
                log::info!("Removed deck {serial}");
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&self) {
        let controllers: Vec<_> = self.controllers.write().drain().map(|(_, c)| c).collect();
        for controller in controllers {
            controller.close();
        }
    }
}
