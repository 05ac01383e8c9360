use crate::error::{Error, Result};
use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Notify, time::Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    /// Manipulation and query tasks.
    Shared,
    /// DDL tasks.
    Exclusive,
}

#[derive(Debug, Default)]
struct Token {
    readers: usize,
    writer: bool,
    waiting_writers: usize,
}

impl Token {
    fn is_unused(&self) -> bool {
        self.readers == 0 && !self.writer && self.waiting_writers == 0
    }
}

/// Per-collection reader/writer tokens.
///
/// A waiting exclusive acquirer blocks new shared acquisitions on the same
/// collection so that a stream of writes cannot starve a schema change.
#[derive(Debug, Default)]
pub(crate) struct ExclusionTable {
    tokens: Mutex<HashMap<String, Token>>,
    released: Notify,
}

impl ExclusionTable {
    /// Waits up to `wait` for the token. `Ok(None)` means the wait timed out.
    pub(crate) async fn acquire(
        self: &Arc<Self>,
        target: &str,
        access: Access,
        wait: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<ExclusionGuard>> {
        let deadline = Instant::now() + wait;
        let mut registered = false;

        let outcome = loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if self.try_acquire(target, access, &mut registered) {
                break Ok(Some(ExclusionGuard {
                    table: Arc::clone(self),
                    target: target.to_string(),
                    access,
                }));
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => break Err(Error::ServiceShutdown),
                () = tokio::time::sleep_until(deadline) => break Ok(None),
                () = &mut released => {}
            }
        };

        if registered && !matches!(outcome, Ok(Some(_))) {
            self.withdraw_writer(target);
        }
        outcome
    }

    fn try_acquire(&self, target: &str, access: Access, registered: &mut bool) -> bool {
        let mut tokens = self.tokens.lock();
        let token = tokens.entry(target.to_string()).or_default();
        match access {
            Access::Shared => {
                if token.writer || token.waiting_writers > 0 {
                    return false;
                }
                token.readers += 1;
            }
            Access::Exclusive => {
                if token.writer || token.readers > 0 {
                    if !*registered {
                        token.waiting_writers += 1;
                        *registered = true;
                    }
                    return false;
                }
                if *registered {
                    token.waiting_writers -= 1;
                    *registered = false;
                }
                token.writer = true;
            }
        }
        true
    }

    fn withdraw_writer(&self, target: &str) {
        let mut tokens = self.tokens.lock();
        if let Some(token) = tokens.get_mut(target) {
            token.waiting_writers = token.waiting_writers.saturating_sub(1);
            if token.is_unused() {
                tokens.remove(target);
            }
        }
        drop(tokens);
        // Shared waiters held back by this writer may proceed.
        self.released.notify_waiters();
    }

    fn release(&self, target: &str, access: Access) {
        let mut tokens = self.tokens.lock();
        if let Some(token) = tokens.get_mut(target) {
            match access {
                Access::Shared => token.readers = token.readers.saturating_sub(1),
                Access::Exclusive => token.writer = false,
            }
            if token.is_unused() {
                tokens.remove(target);
            }
        }
        drop(tokens);
        self.released.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn held(&self) -> usize {
        self.tokens.lock().len()
    }
}

/// Releases its token on drop.
#[derive(Debug)]
pub(crate) struct ExclusionGuard {
    table: Arc<ExclusionTable>,
    target: String,
    access: Access,
}

impl Drop for ExclusionGuard {
    fn drop(&mut self) {
        self.table.release(&self.target, self.access);
    }
}
