use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use crate::error::InboundError;

pub type CompletionResult = std::result::Result<(), InboundError>;

/// Settles once every inbound stream of an instruction has ended, or with
/// the first failure.
///
/// Cloning yields another handle to the same cell. Waiting is possible from
/// blocking code ([`Completion::wait`]) and from async code, since the
/// handle is a [`Future`].
#[derive(Debug, Clone)]
pub struct Completion {
    cell: Arc<Cell>,
}

#[derive(Debug, Default)]
struct Cell {
    state: Mutex<State>,
    settled: Condvar,
}

#[derive(Debug, Default)]
struct State {
    outcome: Option<CompletionResult>,
    wakers: Vec<Waker>,
}

impl Cell {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Completion {
    pub(crate) fn new() -> Self {
        Self {
            cell: Arc::new(Cell::default()),
        }
    }

    /// Store the outcome. Returns `false` if it was already settled, in which
    /// case the earlier outcome stands.
    pub(crate) fn settle(&self, outcome: CompletionResult) -> bool {
        let wakers = {
            let mut state = self.cell.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        self.cell.settled.notify_all();
        for waker in wakers {
            waker.wake();
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.cell.lock().outcome.is_some()
    }

    /// The outcome if already settled.
    pub fn try_result(&self) -> Option<CompletionResult> {
        self.cell.lock().outcome.clone()
    }

    /// Block until settled.
    pub fn wait(&self) -> CompletionResult {
        let mut state = self.cell.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            state = self
                .cell
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until settled or `timeout` elapses; `None` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CompletionResult> {
        let state = self.cell.lock();
        let (state, _) = self
            .cell
            .settled
            .wait_timeout_while(state, timeout, |state| state.outcome.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        state.outcome.clone()
    }
}

impl Future for Completion {
    type Output = CompletionResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.cell.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
