//! Fixed-size pool that runs action callbacks off the render and tick threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, unbounded};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send>;

struct Labeled {
    label: String,
    job: Job,
}

pub struct WorkerPool {
    sender: Mutex<Option<Sender<Labeled>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(name: &str, threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Labeled>();
        let pending = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for n in 0..threads.max(1) {
            let receiver = receiver.clone();
            let pending = pending.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("{name}-worker-{n}"))
                .spawn(move || {
                    for Labeled { label, job } in receiver.iter() {
                        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                            log::error!("Action callback '{label}' panicked");
                        }
                        pending.fetch_sub(1, Ordering::SeqCst);
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(error) => log::error!("Failed to spawn worker thread: {error}"),
            }
        }
        Self {
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            pending,
        }
    }

    /// Queue `job`. Returns `false` once the pool has been shut down.
    pub fn execute(&self, label: impl Into<String>, job: impl FnOnce() + Send + 'static) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        let queued = sender
            .send(Labeled {
                label: label.into(),
                job: Box::new(job),
            })
            .is_ok();
        if !queued {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        queued
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Block until every queued job finished, or `timeout` passed.
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while self.pending() > 0 {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        true
    }

    /// Let queued jobs finish, then join every worker. A worker calling this only detaches.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let current = std::thread::current().id();
        for handle in self.handles.lock().drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
