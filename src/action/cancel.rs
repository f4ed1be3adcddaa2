//! Hierarchical cancellation.
//!
//! Cancelling a token cancels every token derived from it with
//! [`CancelToken::child`], synchronously, and wakes every task parked in
//! [`CancelToken::cancelled`].  Cancelling a child leaves its parent alone.

use core::cell::RefCell;
use core::future::Future;
use core::task::{Poll, Waker};
use std::sync::{Arc, Weak};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures_lite::future;

#[derive(Default)]
struct Shared {
    cancelled: bool,
    wakers: Vec<Waker>,
    children: Vec<Weak<Inner>>,
}

struct Inner {
    shared: Mutex<CriticalSectionRawMutex, RefCell<Shared>>,
}

#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: Mutex::new(RefCell::new(Shared::default())),
            }),
        }
    }

    /// Token cancelled together with `self`.  Born cancelled if `self`
    /// already is.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let parent_cancelled = self.inner.shared.lock(|s| {
            let mut s = s.borrow_mut();
            s.children.retain(|c| c.strong_count() > 0);
            if !s.cancelled {
                s.children.push(Arc::downgrade(&child.inner));
            }
            s.cancelled
        });
        if parent_cancelled {
            child.cancel();
        }
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.shared.lock(|s| s.borrow().cancelled)
    }

    /// Idempotent.
    pub fn cancel(&self) {
        Self::cancel_inner(&self.inner);
    }

    fn cancel_inner(inner: &Inner) {
        let taken = inner.shared.lock(|s| {
            let mut s = s.borrow_mut();
            if s.cancelled {
                return None;
            }
            s.cancelled = true;
            Some((core::mem::take(&mut s.wakers), core::mem::take(&mut s.children)))
        });
        let Some((wakers, children)) = taken else {
            return;
        };
        for waker in wakers {
            waker.wake();
        }
        for child in children.iter().filter_map(Weak::upgrade) {
            Self::cancel_inner(&child);
        }
    }

    /// Resolves once the token is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        future::poll_fn(move |cx| {
            self.inner.shared.lock(|s| {
                let mut s = s.borrow_mut();
                if s.cancelled {
                    return Poll::Ready(());
                }
                if !s.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    s.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            })
        })
    }
}

impl core::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
