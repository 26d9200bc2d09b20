//! Task-scoped lookup chains
//!
//! Synchronous code uses the lookup chain of its OS thread. Futures that
//! run concurrently on one thread (joined, selected, or spawned on a local
//! executor) would share that chain and see each other's handles, so a
//! future that keeps a [`HandleGuard`](crate::HandleGuard) alive across an
//! `.await` must run inside a [`TaskScope`].
//!
//! A `TaskScope` carries its own chain and installs it as the thread's
//! current chain for the duration of every poll, then puts the previous
//! chain back. Scopes nest: a scoped future polling another scoped future
//! restores its own chain when the inner poll returns.
//!
//! ```rust,ignore
//! let a = task::scope(async {
//!     let handle = Handle::new();
//!     let guard = handle.enter()?;
//!     guard.on(|_: Who| "a")?;
//!     tokio::task::yield_now().await;
//!     perform(Who)
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::chain::{self, LookupChain};

/// Keeps `chain` installed as the thread's current chain while alive
struct Installed<'a> {
    chain: &'a mut LookupChain,
}

impl<'a> Installed<'a> {
    fn new(chain: &'a mut LookupChain) -> Self {
        chain::swap_current(chain);
        Self { chain }
    }
}

impl Drop for Installed<'_> {
    fn drop(&mut self) {
        chain::swap_current(self.chain);
    }
}

/// A future that runs against its own lookup chain
#[must_use = "futures do nothing unless polled"]
pub struct TaskScope<F> {
    chain: LookupChain,
    future: Option<Pin<Box<F>>>,
}

impl<F: Future> TaskScope<F> {
    fn with_chain(future: F, chain: LookupChain) -> Self {
        Self {
            chain,
            future: Some(Box::pin(future)),
        }
    }

    /// Number of handle frames opened by the wrapped future that are
    /// still open
    pub fn depth(&self) -> usize {
        self.chain.depth()
    }
}

impl<F: Future> Future for TaskScope<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let installed = Installed::new(&mut this.chain);
        let poll = match this.future.as_mut() {
            Some(future) => future.as_mut().poll(cx),
            None => panic!("TaskScope polled after completion"),
        };
        if poll.is_ready() {
            // Drop the finished future while its chain is still installed
            this.future = None;
        }
        drop(installed);
        poll
    }
}

impl<F> Drop for TaskScope<F> {
    fn drop(&mut self) {
        // A suspended future may still own guards; they must pop from this
        // scope's chain, not from whatever chain the thread has now
        if let Some(future) = self.future.take() {
            let _installed = Installed::new(&mut self.chain);
            drop(future);
        }
    }
}

impl<F> fmt::Debug for TaskScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScope")
            .field("depth", &self.chain.depth())
            .field("finished", &self.future.is_none())
            .finish()
    }
}

/// Run `future` against a fresh, empty lookup chain
pub fn scope<F: Future>(future: F) -> TaskScope<F> {
    TaskScope::with_chain(future, LookupChain::new())
}

/// Run `future` against a chain seeded with every binding visible at the
/// call site.
///
/// The snapshot is taken now; handles opened or closed by the caller later
/// do not affect the task, and the task's own handles never leak out.
pub fn inherit<F: Future>(future: F) -> TaskScope<F> {
    TaskScope::with_chain(future, chain::fork_current())
}

/// Method forms of [`scope`] and [`inherit`]
pub trait ScopedFutureExt: Future + Sized {
    /// See [`scope`]
    fn scoped(self) -> TaskScope<Self> {
        scope(self)
    }

    /// See [`inherit`]
    fn inherit_handlers(self) -> TaskScope<Self> {
        inherit(self)
    }
}

impl<F: Future> ScopedFutureExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::perform;
    use crate::handle::Handle;
    use crate::identity::Effect;
    use futures::FutureExt;

    struct Who;

    impl Effect for Who {
        type Output = &'static str;
    }

    #[test]
    fn test_scope_starts_empty_and_restores_thread_chain() {
        let outer = Handle::named("thread");
        let _guard = outer.enter().unwrap();
        outer.on(|_: Who| "thread").unwrap();

        let seen = scope(async { (chain::depth(), perform(Who).map_err(|e| e.is_escaped())) })
            .now_or_never()
            .unwrap();
        assert_eq!(seen, (0, Err(true)));
        assert_eq!(chain::depth(), 1);
        assert_eq!(perform(Who).unwrap(), "thread");
    }

    #[test]
    fn test_inherit_sees_call_site_bindings() {
        let outer = Handle::named("thread");
        let guard = outer.enter().unwrap();
        outer.on(|_: Who| "thread").unwrap();

        let task = async {
            let local = Handle::named("task");
            let inner = local.enter().unwrap();
            let before = perform(Who).unwrap();
            inner.replace_handler(|_: Who| "task").unwrap();
            (before, perform(Who).unwrap())
        }
        .inherit_handlers();
        drop(guard);

        assert_eq!(task.now_or_never().unwrap(), ("thread", "task"));
        assert_eq!(chain::depth(), 0);
    }

    #[test]
    fn test_dropping_unfinished_scope_pops_inside_its_own_chain() {
        let mut task = scope(async {
            let handle = Handle::named("parked");
            let _guard = handle.enter().unwrap();
            futures::future::pending::<()>().await;
        });
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        assert!(task.poll_unpin(&mut cx).is_pending());
        assert_eq!(task.depth(), 1);
        assert_eq!(chain::depth(), 0);
        drop(task);
        assert_eq!(chain::depth(), 0);
    }
}
