//! Replaying state broadcast.
//!
//! A [`StateLog`] keeps every state an action emitted.  A
//! [`Subscription`] taken before the terminal state replays the log from the
//! first entry and then follows it live, so every subscriber sees every
//! state exactly once and in order.  A subscription taken after the terminal
//! state ends immediately.  Pushes after the terminal state are ignored.

use core::cell::RefCell;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures_lite::Stream;

use super::DeviceActionState;

/// Marks the last value a log accepts.
pub trait Terminal {
    fn is_terminal(&self) -> bool;
}

impl<O, E, I> Terminal for DeviceActionState<O, E, I> {
    fn is_terminal(&self) -> bool {
        DeviceActionState::is_terminal(self)
    }
}

struct Entries<S> {
    states: Vec<S>,
    finished: bool,
    wakers: Vec<Waker>,
}

pub struct StateLog<S> {
    inner: Arc<Mutex<CriticalSectionRawMutex, RefCell<Entries<S>>>>,
}

impl<S> Clone for StateLog<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Clone + Terminal> Default for StateLog<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Clone + Terminal> StateLog<S> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RefCell::new(Entries {
                states: Vec::new(),
                finished: false,
                wakers: Vec::new(),
            }))),
        }
    }

    /// Append `state`; `false` if the log already finished.
    pub fn push(&self, state: S) -> bool {
        let wakers = self.inner.lock(|e| {
            let mut e = e.borrow_mut();
            if e.finished {
                return None;
            }
            e.finished = state.is_terminal();
            e.states.push(state);
            Some(core::mem::take(&mut e.wakers))
        });
        match wakers {
            Some(wakers) => {
                wakers.into_iter().for_each(Waker::wake);
                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock(|e| e.borrow().finished)
    }

    pub fn latest(&self) -> Option<S> {
        self.inner.lock(|e| e.borrow().states.last().cloned())
    }

    pub fn len(&self) -> usize {
        self.inner.lock(|e| e.borrow().states.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> Subscription<S> {
        let ended = self.is_finished();
        Subscription {
            log: self.clone(),
            cursor: 0,
            ended,
        }
    }
}

/// Stream of the states of one run.
pub struct Subscription<S> {
    log: StateLog<S>,
    cursor: usize,
    ended: bool,
}

impl<S: Clone + Terminal> Stream for Subscription<S> {
    type Item = S;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S>> {
        let this = self.get_mut();
        if this.ended {
            return Poll::Ready(None);
        }
        let cursor = this.cursor;
        let polled = this.log.inner.lock(|e| {
            let mut e = e.borrow_mut();
            if let Some(state) = e.states.get(cursor) {
                return Poll::Ready(Some(state.clone()));
            }
            if e.finished {
                return Poll::Ready(None);
            }
            e.wakers.push(cx.waker().clone());
            Poll::Pending
        });
        match &polled {
            Poll::Ready(Some(_)) => this.cursor += 1,
            Poll::Ready(None) => this.ended = true,
            Poll::Pending => {}
        }
        polled
    }
}
