//! Tickets
//!
//! A ticket tracks the page requests issued by one launch. Its task count is
//! only known once the requests have been pulled from the device, so a fresh
//! ticket is not done even if no task has been registered yet.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct TicketState {
    total: Option<usize>,
    completed: usize,
}

impl TicketState {
    fn is_done(&self) -> bool {
        self.total.is_some_and(|total| self.completed >= total)
    }
}

#[derive(Default)]
struct TicketInner {
    state: Mutex<TicketState>,
    done: Condvar,
}

/// Handle over a batch of in-flight requests. Cloning shares the same batch.
///
/// The default ticket tracks nothing and is already done.
#[derive(Clone, Default)]
pub struct Ticket {
    inner: Option<Arc<TicketInner>>,
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("num_tasks_total", &self.num_tasks_total())
            .field("num_tasks_remaining", &self.num_tasks_remaining())
            .finish()
    }
}

impl Ticket {
    /// Create a ticket whose task count is not known yet
    pub fn new() -> Self {
        Self {
            inner: Some(Arc::new(TicketInner::default())),
        }
    }

    /// Number of tasks in the batch, once known
    pub fn num_tasks_total(&self) -> Option<usize> {
        match &self.inner {
            Some(inner) => inner.state.lock().total,
            None => Some(0),
        }
    }

    /// Number of tasks not yet finished, once the total is known
    pub fn num_tasks_remaining(&self) -> Option<usize> {
        match &self.inner {
            Some(inner) => {
                let state = inner.state.lock();
                state.total.map(|total| total.saturating_sub(state.completed))
            }
            None => Some(0),
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|inner| inner.state.lock().is_done())
    }

    /// Block until every task of the batch has finished
    pub fn wait(&self) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock();
            while !state.is_done() {
                inner.done.wait(&mut state);
            }
        }
    }

    /// Block until done or until `timeout` elapses. Returns whether the batch is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(inner) = &self.inner else {
            return true;
        };
        let mut state = inner.state.lock();
        if !state.is_done() {
            inner.done.wait_while_for(&mut state, |state| !state.is_done(), timeout);
        }
        state.is_done()
    }

    /// Record the number of tasks in the batch
    pub(crate) fn set_total(&self, total: usize) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock();
            state.total = Some(total);
            if state.is_done() {
                inner.done.notify_all();
            }
        }
    }

    /// Record one finished task
    pub(crate) fn notify(&self) {
        if let Some(inner) = &self.inner {
            let mut state = inner.state.lock();
            state.completed += 1;
            if state.is_done() {
                inner.done.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_default_ticket_is_done() {
        let ticket = Ticket::default();
        assert!(ticket.is_done());
        assert_eq!(ticket.num_tasks_total(), Some(0));
        ticket.wait();
    }

    #[test]
    fn test_not_done_until_total_known() {
        let ticket = Ticket::new();
        assert!(!ticket.is_done());
        assert_eq!(ticket.num_tasks_remaining(), None);

        // Completions may arrive before the total
        ticket.notify();
        assert!(!ticket.is_done());

        ticket.set_total(2);
        assert_eq!(ticket.num_tasks_remaining(), Some(1));
        ticket.notify();
        assert!(ticket.is_done());
    }

    #[test]
    fn test_empty_batch() {
        let ticket = Ticket::new();
        ticket.set_total(0);
        assert!(ticket.is_done());
        assert!(ticket.wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn test_wait_blocks_until_done() {
        let ticket = Ticket::new();
        ticket.set_total(3);

        let worker = {
            let ticket = ticket.clone();
            thread::spawn(move || {
                for _ in 0..3 {
                    ticket.notify();
                }
            })
        };

        ticket.wait();
        assert!(ticket.is_done());
        assert_eq!(ticket.num_tasks_remaining(), Some(0));
        worker.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let ticket = Ticket::new();
        ticket.set_total(1);
        assert!(!ticket.wait_timeout(Duration::from_millis(10)));
    }
}
