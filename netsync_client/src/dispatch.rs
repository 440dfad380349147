//! Main-thread dispatch queue.
//!
//! Receive workers never touch gameplay state. They enqueue callbacks here,
//! and the owning thread runs them in enqueue order at the start of its tick.
//! Any number of [`Dispatcher`] handles may feed one [`DispatchQueue`].

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::trace;

/// A unit of deferred work run against the consumer's state `C`.
pub type Job<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Producer handle. Cheap to clone; usable from any task or thread.
pub struct Dispatcher<C> {
    tx: UnboundedSender<Job<C>>,
}

impl<C> Clone for Dispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> Dispatcher<C> {
    /// Enqueues `job`. Returns `false` if the queue was closed.
    pub fn dispatch<F>(&self, job: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(job)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side. Owned by the single thread that owns `C`.
pub struct DispatchQueue<C> {
    rx: UnboundedReceiver<Job<C>>,
    tx: UnboundedSender<Job<C>>,
}

impl<C> Default for DispatchQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> DispatchQueue<C> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { rx, tx }
    }

    /// Returns a new producer handle.
    pub fn dispatcher(&self) -> Dispatcher<C> {
        Dispatcher {
            tx: self.tx.clone(),
        }
    }

    /// Runs every queued job against `ctx`, oldest first.
    ///
    /// Returns the number of jobs run.
    pub fn drain(&mut self, ctx: &mut C) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(job) => {
                    job(ctx);
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if ran > 0 {
            trace!(jobs = ran, "Drained dispatch queue");
        }
        ran
    }

    /// Stops accepting new jobs. Already queued jobs can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_jobs_in_enqueue_order() {
        let mut queue = DispatchQueue::<Vec<u32>>::new();
        let a = queue.dispatcher();
        let b = a.clone();
        a.dispatch(|v| v.push(1));
        b.dispatch(|v| v.push(2));
        a.dispatch(|v| v.push(3));

        let mut log = Vec::new();
        assert_eq!(queue.drain(&mut log), 3);
        assert_eq!(log, vec![1, 2, 3]);
        assert_eq!(queue.drain(&mut log), 0);
    }

    #[test]
    fn producers_on_other_threads() {
        let mut queue = DispatchQueue::<Vec<(u32, u32)>>::new();
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let d = queue.dispatcher();
                std::thread::spawn(move || {
                    for seq in 0..100 {
                        d.dispatch(move |v| v.push((worker, seq)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut log = Vec::new();
        assert_eq!(queue.drain(&mut log), 400);
        // Per-producer order is preserved.
        for worker in 0..4 {
            let seqs: Vec<u32> = log.iter().filter(|(w, _)| *w == worker).map(|(_, s)| *s).collect();
            assert_eq!(seqs, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn closed_queue_rejects_new_jobs() {
        let mut queue = DispatchQueue::<u32>::new();
        let d = queue.dispatcher();
        assert!(d.dispatch(|n| *n += 1));
        queue.close();
        assert!(!d.dispatch(|n| *n += 10));
        assert!(d.is_closed());

        let mut n = 0;
        queue.drain(&mut n);
        assert_eq!(n, 1);
    }

    #[test]
    fn dropping_queue_closes_dispatchers() {
        let queue = DispatchQueue::<u32>::new();
        let d = queue.dispatcher();
        drop(queue);
        assert!(!d.dispatch(|_| {}));
    }
}
