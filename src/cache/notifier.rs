//! Per-entity FIFO queue for writes.
//!
//! Each enqueue takes a [`Ticket`] synchronously, so queue order is the order in
//! which callers asked, not the order in which their futures first get polled.
//! A ticket's turn comes once the previous ticket's [`Turn`] has been dropped.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{self, BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use super::lock;

type Signal = Shared<BoxFuture<'static, ()>>;

pub(crate) struct Notifier {
  /// Resolves once every ticket issued so far has finished.
  tail: Mutex<Signal>,
  pending: Arc<AtomicUsize>,
}

impl Notifier {
  pub fn new() -> Self {
    Self {
      tail: Mutex::new(future::ready(()).boxed().shared()),
      pending: Arc::new(AtomicUsize::new(0)),
    }
  }

  /// Reserve the next slot in the queue.
  pub fn enqueue(&self) -> Ticket {
    let (done, finished) = oneshot::channel::<()>();
    let mut tail = lock(&self.tail);
    let prev = tail.clone();

    // A ticket dropped before its turn still waits for its predecessor, so the
    // chain never lets a later write overtake an earlier one.
    let chained = prev.clone();
    *tail = async move {
      chained.await;
      let _ = finished.await;
    }
    .boxed()
    .shared();

    self.pending.fetch_add(1, Ordering::SeqCst);
    Ticket {
      prev,
      done,
      pending: PendingGuard(Arc::clone(&self.pending)),
    }
  }

  /// Number of queued or running operations.
  pub fn pending(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::SeqCst);
  }
}

/// A reserved queue slot.
pub(crate) struct Ticket {
  prev: Signal,
  done: oneshot::Sender<()>,
  pending: PendingGuard,
}

impl Ticket {
  /// Wait until every earlier ticket has finished.
  pub async fn turn(self) -> Turn {
    let Ticket {
      prev,
      done,
      pending,
    } = self;
    prev.await;
    Turn {
      _done: done,
      _pending: pending,
    }
  }
}

/// Exclusive right to run; the next ticket proceeds when this is dropped.
pub(crate) struct Turn {
  _done: oneshot::Sender<()>,
  _pending: PendingGuard,
}
