//! Cancel-and-restart debouncing of touched paths

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

enum Signal {
    Touched,
    Stop,
}

type PendingSet = Arc<Mutex<BTreeSet<String>>>;

/// Coalesces bursts of touched paths into one flush per quiet period.
///
/// Every touch restarts the window, so a flush only runs after `delay` has
/// passed with no new touches. The flush receives the drained pending set.
pub struct Debouncer {
    sender: PendingSender,
    handle: Option<JoinHandle<()>>,
}

/// Cloneable producer side, safe to call from notification threads
#[derive(Clone)]
pub struct PendingSender {
    tx: Sender<Signal>,
    pending: PendingSet,
}

impl PendingSender {
    pub fn touch(&self, path: impl Into<String>) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into());
        // Only fails once the debounce thread is gone
        let _ = self.tx.send(Signal::Touched);
    }
}

impl Debouncer {
    pub fn spawn<F>(delay: Duration, flush: F) -> Self
    where
        F: FnMut(Vec<String>) + Send + 'static,
    {
        let (tx, rx) = channel::unbounded();
        let pending: PendingSet = Arc::new(Mutex::new(BTreeSet::new()));
        let thread_pending = Arc::clone(&pending);

        let handle = std::thread::Builder::new()
            .name("cartographer-debounce".to_string())
            .spawn(move || run(rx, thread_pending, delay, flush))
            .ok();

        if handle.is_none() {
            tracing::error!("Failed to spawn debounce thread; changes will not be flushed");
        }

        Self {
            sender: PendingSender { tx, pending },
            handle,
        }
    }

    pub fn sender(&self) -> PendingSender {
        self.sender.clone()
    }

    pub fn touch(&self, path: impl Into<String>) {
        self.sender.touch(path);
    }

    /// Paths waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.sender
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Flush anything pending and join the debounce thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.tx.send(Signal::Stop);
            if handle.join().is_err() {
                tracing::error!("Debounce thread panicked");
            }
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F>(rx: Receiver<Signal>, pending: PendingSet, delay: Duration, mut flush: F)
where
    F: FnMut(Vec<String>),
{
    loop {
        match rx.recv() {
            Ok(Signal::Touched) => {}
            Ok(Signal::Stop) | Err(_) => break,
        }

        let stopping = loop {
            match rx.recv_timeout(delay) {
                Ok(Signal::Touched) => continue,
                Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => break true,
                Err(RecvTimeoutError::Timeout) => break false,
            }
        };

        drain(&pending, &mut flush);
        if stopping {
            return;
        }
    }

    drain(&pending, &mut flush);
}

fn drain<F>(pending: &PendingSet, flush: &mut F)
where
    F: FnMut(Vec<String>),
{
    let paths: Vec<String> = std::mem::take(&mut *pending.lock().unwrap_or_else(PoisonError::into_inner))
        .into_iter()
        .collect();
    if !paths.is_empty() {
        tracing::debug!("Flushing {} pending paths", paths.len());
        flush(paths);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(delay: Duration) -> (Debouncer, Arc<Mutex<Vec<Vec<String>>>>) {
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&flushes);
        let debouncer = Debouncer::spawn(delay, move |paths| sink.lock().unwrap().push(paths));
        (debouncer, flushes)
    }

    #[test]
    fn test_burst_produces_single_flush() {
        let (debouncer, flushes) = recording(Duration::from_millis(100));
        let files = ["src/a.rs", "src/b.rs", "src/c.rs"];

        for i in 0..10 {
            debouncer.touch(files[i % files.len()]);
        }
        std::thread::sleep(Duration::from_millis(400));

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0], vec!["src/a.rs", "src/b.rs", "src/c.rs"]);
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[test]
    fn test_each_touch_restarts_the_window() {
        let (debouncer, flushes) = recording(Duration::from_millis(200));

        for i in 0..6 {
            debouncer.touch(format!("src/f{i}.rs"));
            std::thread::sleep(Duration::from_millis(30));
        }
        assert!(flushes.lock().unwrap().is_empty());

        std::thread::sleep(Duration::from_millis(500));
        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].len(), 6);
    }

    #[test]
    fn test_separate_bursts_flush_separately() {
        let (debouncer, flushes) = recording(Duration::from_millis(50));

        debouncer.touch("src/a.rs");
        std::thread::sleep(Duration::from_millis(300));
        debouncer.touch("src/b.rs");
        std::thread::sleep(Duration::from_millis(300));

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 2);
        assert_eq!(flushes[0], vec!["src/a.rs"]);
        assert_eq!(flushes[1], vec!["src/b.rs"]);
    }

    #[test]
    fn test_stop_flushes_pending() {
        let (debouncer, flushes) = recording(Duration::from_secs(30));
        debouncer.touch("src/late.rs");
        debouncer.stop();

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0], vec!["src/late.rs"]);
    }
}
