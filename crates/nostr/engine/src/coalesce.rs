//! Debounce/throttle coalescing channel.
//!
//! Items pushed into a [`Coalescer`] are buffered and handed to a flush callback
//! in batches. A batch is flushed once arrivals have been quiet for `debounce`,
//! or once `throttle` has elapsed since the batch opened, whichever comes first.
//! Two flushes are never closer together than `throttle`. Dropping every handle
//! flushes whatever is buffered and stops the task.

use crate::config::millis;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Debounce and throttle durations for one coalescer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoalesceWindow {
    #[serde(with = "millis")]
    pub debounce: Duration,
    #[serde(with = "millis")]
    pub throttle: Duration,
}

impl CoalesceWindow {
    pub const fn from_millis(debounce: u64, throttle: u64) -> Self {
        Self {
            debounce: Duration::from_millis(debounce),
            throttle: Duration::from_millis(throttle),
        }
    }
}

/// Sending half of a coalescing channel.
pub struct Coalescer<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Coalescer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Coalescer<T> {
    /// Spawn the coalescing task. `flush` runs on that task.
    pub fn spawn<F>(window: CoalesceWindow, flush: F) -> (Self, JoinHandle<()>)
    where
        F: FnMut(Vec<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, window, flush));
        (Self { tx }, handle)
    }

    /// Buffer an item. Returns false once the task has stopped.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

/// Wait for the next item until `deadline`. `Err(())` means the channel closed.
async fn collect_until<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    batch: &mut Vec<T>,
    deadline: Instant,
) -> Result<bool, ()> {
    tokio::select! {
        item = rx.recv() => match item {
            Some(item) => {
                batch.push(item);
                Ok(true)
            }
            None => Err(()),
        },
        _ = sleep_until(deadline) => Ok(false),
    }
}

async fn run<T, F>(mut rx: mpsc::UnboundedReceiver<T>, window: CoalesceWindow, mut flush: F)
where
    F: FnMut(Vec<T>),
{
    let mut last_flush: Option<Instant> = None;

    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        let ceiling = Instant::now() + window.throttle;
        let mut closed = false;

        // debounce, capped by the throttle ceiling
        loop {
            let quiet = (Instant::now() + window.debounce).min(ceiling);
            match collect_until(&mut rx, &mut batch, quiet).await {
                Ok(true) if Instant::now() < ceiling => continue,
                Ok(_) => break,
                Err(()) => {
                    closed = true;
                    break;
                }
            }
        }

        // keep flushes at least `throttle` apart
        if !closed && let Some(last) = last_flush {
            let earliest = last + window.throttle;
            while Instant::now() < earliest {
                match collect_until(&mut rx, &mut batch, earliest).await {
                    Ok(_) => {}
                    Err(()) => {
                        closed = true;
                        break;
                    }
                }
            }
        }

        flush(batch);
        last_flush = Some(Instant::now());

        if closed {
            break;
        }
    }
}
