//! Idle screensaver. While showing, the controller's inputs are swapped for an action-free
//! set and the background shows the screensaver media. Any interaction wakes the deck.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::controller::DeckController;
use crate::inputs::InputSet;
use crate::scheduler::TimerToken;
use crate::store::{BackgroundSettings, ScreensaverSettings};
use crate::ui::UiEvent;

struct Saved {
    inputs: Arc<InputSet>,
    brightness: u8,
}

const DEFAULT_DELAY_MINUTES: f64 = 5.0;

/// Idle time before the screensaver shows, at least one second. Delays a `Duration` cannot
/// hold fall back to the default.
fn idle_delay(minutes: f64) -> Duration {
    match Duration::try_from_secs_f64((minutes * 60.0).max(1.0)) {
        Ok(delay) => delay,
        Err(error) => {
            log::warn!("Invalid screensaver delay of {minutes} minutes ({error}); using {DEFAULT_DELAY_MINUTES}");
            Duration::from_secs_f64(DEFAULT_DELAY_MINUTES * 60.0)
        }
    }
}

#[derive(Default)]
pub struct ScreenSaver {
    settings: Mutex<ScreensaverSettings>,
    showing: AtomicBool,
    timer: Mutex<Option<TimerToken>>,
    saved: Mutex<Option<Saved>>,
}

impl ScreenSaver {
    pub fn is_showing(&self) -> bool {
        self.showing.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> ScreensaverSettings {
        self.settings.lock().clone()
    }

    /// Apply new settings and restart the idle timer.
    pub fn configure(&self, controller: &Arc<DeckController>, settings: ScreensaverSettings) {
        let enabled = settings.enable;
        *self.settings.lock() = settings;
        if !enabled && self.is_showing() {
            self.hide(controller);
        }
        self.arm(controller);
    }

    /// Called for every input event. Returns `true` when the event woke the deck and must not
    /// reach the input.
    pub fn on_key_change(&self, controller: &Arc<DeckController>) -> bool {
        if self.is_showing() {
            self.hide(controller);
            return true;
        }
        self.arm(controller);
        false
    }

    pub fn cancel_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
    }

    fn arm(&self, controller: &Arc<DeckController>) {
        self.cancel_timer();
        let settings = self.settings();
        if !settings.enable || self.is_showing() {
            return;
        }
        let delay = idle_delay(settings.time_delay_minutes);
        let weak: Weak<DeckController> = Arc::downgrade(controller);
        let token = controller.scheduler().schedule(delay, move || {
            let Some(controller) = weak.upgrade() else {
                return;
            };
            let worker_controller = controller.clone();
            controller.workers().execute("screensaver show", move || {
                worker_controller.screensaver().show(&worker_controller);
            });
        });
        *self.timer.lock() = Some(token);
    }

    pub fn show(&self, controller: &Arc<DeckController>) {
        if self.showing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_timer();
        let settings = self.settings();
        log::info!("Showing screensaver on {}", controller.serial());

        let current = controller.inputs();
        for input in current.iter() {
            input.release_press();
        }
        let fresh = Arc::new(InputSet::for_deck(
            controller.deck(),
            &controller.settings().default_font_family,
        ));
        let previous = controller.swap_inputs(fresh);
        *self.saved.lock() = Some(Saved {
            inputs: previous,
            brightness: controller.brightness(),
        });

        controller.background().load(
            &BackgroundSettings {
                path: settings.path.clone(),
                r#loop: settings.r#loop,
                fps: settings.fps,
                show: true,
            },
            &controller.media_base_dirs(),
            controller.videos_dir().as_deref(),
        );
        controller.set_brightness(settings.brightness);
        controller.mark_all_dirty();
        controller.ui().emit(UiEvent::ScreensaverShown {
            serial: controller.serial().to_owned(),
            showing: true,
        });
    }

    pub fn hide(&self, controller: &Arc<DeckController>) {
        if !self.showing.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("Hiding screensaver on {}", controller.serial());
        if let Some(saved) = self.saved.lock().take() {
            controller.swap_inputs(saved.inputs).close();
            controller.set_brightness(saved.brightness);
        }
        controller.ui().emit(UiEvent::ScreensaverShown {
            serial: controller.serial().to_owned(),
            showing: false,
        });
        match controller.active_page() {
            Some(page) => controller.load_page(Some(page)),
            None => {
                controller.apply_background(None);
                controller.mark_all_dirty();
            }
        }
        self.arm(controller);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DeckContext;
    use crate::device::{FakeDeck, FakeDeckLayout};
    use crate::shared::Paths;
    use crate::store::{AppSettings, DeckSettings};

    #[test]
    fn idle_delay_is_bounded() {
        assert_eq!(idle_delay(2.0), Duration::from_secs(120));
        assert_eq!(idle_delay(0.0), Duration::from_secs(1));
        assert_eq!(idle_delay(-3.0), Duration::from_secs(1));
        assert_eq!(idle_delay(1e20), Duration::from_secs(300));
        assert_eq!(idle_delay(f64::INFINITY), Duration::from_secs(300));
    }

    #[test]
    fn unrepresentable_delay_still_arms_the_timer() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = DeckSettings::default();
        settings.screensaver.enable = true;
        settings.screensaver.time_delay_minutes = 1e20;
        let controller = DeckController::headless(
            Arc::new(FakeDeck::new("SS", FakeDeckLayout::default())),
            DeckContext::new(AppSettings::default(), Paths::rooted(dir.path())),
            settings,
        );
        assert!(controller.screensaver().timer.lock().is_some());
        assert!(!controller.screensaver().is_showing());
        controller.close();
    }
}
