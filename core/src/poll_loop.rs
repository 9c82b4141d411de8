//! Single-task cooperative scheduler over substrate pollables.
//!
//! # Design
//! A `PollLoop` is created per exchange and borrows its substrate; nothing is
//! installed globally. Futures suspend by awaiting [`PollLoop::wait_for`],
//! which parks a pollable in the loop's registry together with the waker of
//! the task that wants it. When the root future is pending, `run` hands every
//! parked pollable to [`Substrate::poll`], wakes the tasks whose pollables are
//! ready and polls again.
//!
//! Dropping a pending wait removes its pollable from the registry, which is
//! how a branch of a join is cancelled once its sibling has failed.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use futures::task::{waker, ArcWake};

use crate::error::ExchangeError;
use crate::substrate::{Pollable, Substrate};

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

struct Parked<P> {
    pollable: P,
    waker: Option<Waker>,
}

/// Cooperative event loop for one exchange.
pub struct PollLoop<'s, S: Substrate> {
    substrate: &'s S,
    parked: RefCell<BTreeMap<u64, Parked<S::Pollable>>>,
    next_key: Cell<u64>,
}

impl<'s, S: Substrate> PollLoop<'s, S> {
    pub fn new(substrate: &'s S) -> Self {
        Self {
            substrate,
            parked: RefCell::new(BTreeMap::new()),
            next_key: Cell::new(0),
        }
    }

    pub fn substrate(&self) -> &'s S {
        self.substrate
    }

    /// Suspend until `pollable` is ready.
    pub fn wait_for(&self, pollable: S::Pollable) -> WaitFor<'_, 's, S> {
        let key = self.next_key.get();
        self.next_key.set(key.wrapping_add(1));
        self.parked.borrow_mut().insert(
            key,
            Parked {
                pollable,
                waker: None,
            },
        );
        WaitFor { lp: self, key }
    }

    /// Drive `future` to completion on this thread.
    ///
    /// Fails with `Reentered` when called from inside another `run` on the
    /// same thread, and with `Stalled` if the future stops making progress
    /// without leaving anything to poll.
    pub fn run<F: Future>(&self, future: F) -> Result<F::Output, ExchangeError> {
        let _guard = RunGuard::enter()?;

        let mut future = pin!(future);
        let signal = Arc::new(Signal::default());
        let root = waker(signal.clone());
        let mut cx = Context::from_waker(&root);

        loop {
            signal.woken.store(false, Ordering::SeqCst);
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if signal.woken.load(Ordering::SeqCst) {
                continue;
            }
            if !self.block_until_ready() {
                return Err(ExchangeError::Stalled);
            }
        }
    }

    /// Poll the substrate for every parked pollable and wake the ready ones.
    /// Returns `false` when nothing is parked.
    fn block_until_ready(&self) -> bool {
        let wakers: Vec<Waker> = {
            let parked = self.parked.borrow();
            if parked.is_empty() {
                return false;
            }
            let keys: Vec<u64> = parked.keys().copied().collect();
            let pollables: Vec<&S::Pollable> = parked.values().map(|p| &p.pollable).collect();
            let ready = self.substrate.poll(&pollables);
            tracing::trace!(parked = keys.len(), ready = ready.len(), "poll");
            ready
                .into_iter()
                .filter_map(|index| keys.get(index))
                .filter_map(|key| parked.get(key).and_then(|p| p.waker.clone()))
                .collect()
        };
        for w in wakers {
            w.wake();
        }
        true
    }
}

/// Future returned by [`PollLoop::wait_for`].
pub struct WaitFor<'l, 's, S: Substrate> {
    lp: &'l PollLoop<'s, S>,
    key: u64,
}

impl<S: Substrate> Future for WaitFor<'_, '_, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut parked = self.lp.parked.borrow_mut();
        let Some(entry) = parked.get_mut(&self.key) else {
            return Poll::Ready(());
        };
        if entry.pollable.ready() {
            parked.remove(&self.key);
            return Poll::Ready(());
        }
        entry.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<S: Substrate> Drop for WaitFor<'_, '_, S> {
    fn drop(&mut self) {
        // Releases the pollable if the wait was abandoned before it fired.
        self.lp.parked.borrow_mut().remove(&self.key);
    }
}

#[derive(Default)]
struct Signal {
    woken: AtomicBool,
}

impl ArcWake for Signal {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
    }
}

struct RunGuard;

impl RunGuard {
    fn enter() -> Result<Self, ExchangeError> {
        if RUNNING.with(|running| running.replace(true)) {
            return Err(ExchangeError::Reentered);
        }
        Ok(RunGuard)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(false));
    }
}
