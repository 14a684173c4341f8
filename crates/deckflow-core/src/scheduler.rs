//! One timer thread per controller. Hold detection, overlay expiry and the screensaver idle
//! timer all run here; jobs must be short and hand real work to the worker pool.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send>;

/// Cancels a scheduled job. Dropping the token does not cancel.
#[derive(Clone, Default)]
pub struct TimerToken {
    cancelled: Arc<AtomicBool>,
}

impl TimerToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct Queue {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, (TimerToken, Job)>,
    next_id: u64,
    running: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

pub struct Scheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(name: &str) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                deadlines: BinaryHeap::new(),
                jobs: HashMap::new(),
                next_id: 0,
                running: true,
            }),
            wakeup: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-timers"))
            .spawn(move || run(&thread_shared))
            .map_err(|error| log::error!("Failed to spawn scheduler thread: {error}"))
            .ok();
        Self {
            shared,
            handle: Mutex::new(handle),
        }
    }

    pub fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerToken {
        let token = TimerToken::default();
        let mut queue = self.shared.queue.lock();
        if !queue.running {
            token.cancel();
            return token;
        }
        let id = queue.next_id;
        queue.next_id += 1;
        queue.deadlines.push(Reverse((Instant::now() + delay, id)));
        queue.jobs.insert(id, (token.clone(), Box::new(job)));
        drop(queue);
        self.shared.wakeup.notify_one();
        token
    }

    /// Drop pending jobs and join the timer thread.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.running = false;
            queue.jobs.clear();
            queue.deadlines.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = self.handle.lock().take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    while queue.running {
        let now = Instant::now();
        match queue.deadlines.peek().copied() {
            Some(Reverse((deadline, id))) if deadline <= now => {
                queue.deadlines.pop();
                let Some((token, job)) = queue.jobs.remove(&id) else {
                    continue;
                };
                if token.is_cancelled() {
                    continue;
                }
                drop(queue);
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    log::error!("Timer job panicked");
                }
                queue = shared.queue.lock();
            }
            Some(Reverse((deadline, _))) => {
                shared.wakeup.wait_until(&mut queue, deadline);
            }
            None => shared.wakeup.wait(&mut queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_jobs_in_deadline_order_and_skips_cancelled() {
        let scheduler = Scheduler::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        scheduler.schedule(Duration::from_millis(40), move || o.lock().push(2));
        let o = order.clone();
        scheduler.schedule(Duration::from_millis(10), move || o.lock().push(1));
        let o = order.clone();
        let cancelled = scheduler.schedule(Duration::from_millis(20), move || o.lock().push(99));
        cancelled.cancel();

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn shutdown_discards_pending_jobs() {
        let scheduler = Scheduler::new("test");
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        scheduler.schedule(Duration::from_millis(50), move || {
            r.fetch_add(1, Ordering::SeqCst);
        });
        scheduler.shutdown();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(scheduler.schedule(Duration::ZERO, || {}).is_cancelled());
    }
}
