//! Periodic `on_tick` delivery to the active state of every input.

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::controller::DeckController;

struct Shared {
    running: Mutex<bool>,
    wakeup: Condvar,
}

impl Shared {
    /// Sleep for `interval` or until stopped. Returns whether the loop should go on.
    fn sleep(&self, interval: Duration) -> bool {
        let mut running = self.running.lock();
        if *running {
            self.wakeup.wait_for(&mut running, interval);
        }
        *running
    }
}

pub struct TickThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TickThread {
    fn default() -> Self {
        Self::new()
    }
}

impl TickThread {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                running: Mutex::new(false),
                wakeup: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn start(&self, controller: Weak<DeckController>, name: &str, interval: Duration) {
        {
            let mut running = self.shared.running.lock();
            if *running {
                return;
            }
            *running = true;
        }
        let shared = self.shared.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("{name}-tick"))
            .spawn(move || run(&shared, controller, interval));
        match spawned {
            Ok(handle) => *self.handle.lock() = Some(handle),
            Err(error) => {
                log::error!("Failed to spawn tick thread: {error}");
                *self.shared.running.lock() = false;
            }
        }
    }

    pub fn is_running(&self) -> bool {
        *self.shared.running.lock()
    }

    pub fn stop(&self) {
        *self.shared.running.lock() = false;
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.lock().take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

fn run(shared: &Shared, controller: Weak<DeckController>, interval: Duration) {
    while shared.sleep(interval) {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        tick_once(&controller);
    }
    log::debug!("Tick loop exited");
}

/// One pass over the inputs. Skipped while a page load is still being applied.
pub(crate) fn tick_once(controller: &Arc<DeckController>) {
    let Some(page) = controller.active_page() else {
        return;
    };
    if !page.is_ready_to_clear() {
        log::trace!("Skipping tick while page {} loads", page.name());
        return;
    }
    for input in controller.inputs().iter() {
        input.on_tick(controller);
    }
}
