//! Reentrancy-safe handler registries
//!
//! Controllers keep their user callbacks in a `Handlers<A>`. Invocation
//! snapshots the entry list, so a handler may add or remove handlers (even
//! itself) while running. Removal of an unknown id is a no-op.
//!
//! A handler whose own action raises a new event on the same thread is
//! skipped for that nested event (the running invocation re-reads whatever
//! state it acts on); invocations from other threads serialize on the
//! handler's mutex instead, so no event is ever dropped across threads.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type HandlerId = u64;

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn thread_token() -> u64 {
    THREAD_TOKEN.with(|t| *t)
}

struct HandlerCell<A> {
    f: Mutex<Box<dyn FnMut(&A) + Send>>,
    /// Token of the thread currently running this handler; 0 when idle.
    running_on: AtomicU64,
}

struct Inner<A> {
    next_id: HandlerId,
    entries: Vec<(HandlerId, Arc<HandlerCell<A>>)>,
    removed: HashSet<HandlerId>,
}

pub struct Handlers<A> {
    inner: Mutex<Inner<A>>,
}

impl<A> Handlers<A> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { next_id: 1, entries: Vec::new(), removed: HashSet::new() }),
        }
    }

    pub fn add(&self, f: impl FnMut(&A) + Send + 'static) -> HandlerId {
        let mut inner = self.inner.lock().expect("handler lock");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((
            id,
            Arc::new(HandlerCell { f: Mutex::new(Box::new(f)), running_on: AtomicU64::new(0) }),
        ));
        id
    }

    /// Returns false when the id was unknown.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut inner = self.inner.lock().expect("handler lock");
        let before = inner.entries.len();
        inner.entries.retain(|(hid, _)| *hid != id);
        let found = inner.entries.len() != before;
        if found {
            // A running invocation consults this set so the handler does not
            // fire again within the same round.
            inner.removed.insert(id);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("handler lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invoke every handler with `arg`. The entry list is snapshotted first;
    /// handlers added during invocation run on the next event.
    pub fn invoke_all(&self, arg: &A) {
        let me = thread_token();
        let snapshot: Vec<(HandlerId, Arc<HandlerCell<A>>)> = {
            let mut inner = self.inner.lock().expect("handler lock");
            inner.removed.clear();
            inner.entries.clone()
        };
        for (id, cell) in snapshot {
            let skip = {
                let inner = self.inner.lock().expect("handler lock");
                inner.removed.contains(&id)
            };
            if skip {
                continue;
            }
            if cell.running_on.load(Ordering::Acquire) == me {
                // Reentrant: this handler's own action raised the event.
                continue;
            }
            let mut f = cell.f.lock().expect("handler cell lock");
            cell.running_on.store(me, Ordering::Release);
            f(arg);
            cell.running_on.store(0, Ordering::Release);
        }
    }
}

impl<A> Default for Handlers<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn add_and_invoke() {
        let handlers: Handlers<u32> = Handlers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        handlers.add(move |v| {
            assert_eq!(*v, 7);
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        handlers.invoke_all(&7);
        handlers.invoke_all(&7);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn remove_unknown_id_is_a_noop() {
        let handlers: Handlers<u32> = Handlers::new();
        assert!(!handlers.remove(1234));
        assert_eq!(handlers.len(), 0);
    }

    #[test]
    fn handler_count_is_monotone() {
        let handlers: Handlers<u32> = Handlers::new();
        let a = handlers.add(|_| {});
        let b = handlers.add(|_| {});
        assert_eq!(handlers.len(), 2);
        assert!(handlers.remove(a));
        assert_eq!(handlers.len(), 1);
        assert!(handlers.remove(b));
        assert!(handlers.is_empty());
    }

    #[test]
    fn handler_may_remove_itself() {
        let handlers: Arc<Handlers<u32>> = Arc::new(Handlers::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let handlers2 = handlers.clone();
        let hits2 = hits.clone();
        let id = Arc::new(Mutex::new(0u64));
        let id2 = id.clone();
        let assigned = handlers.add(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
            handlers2.remove(*id2.lock().unwrap());
        });
        *id.lock().unwrap() = assigned;

        handlers.invoke_all(&1);
        handlers.invoke_all(&1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reentrant_invocation_skips_the_running_handler() {
        let handlers: Arc<Handlers<u32>> = Arc::new(Handlers::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let handlers2 = handlers.clone();
        let hits2 = hits.clone();
        handlers.add(move |v| {
            hits2.fetch_add(1, Ordering::SeqCst);
            if *v == 1 {
                // The handler's own action raises a nested event.
                handlers2.invoke_all(&2);
            }
        });
        handlers.invoke_all(&1);
        // The nested event did not re-enter the handler.
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
