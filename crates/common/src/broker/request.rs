//! Requests and the handles that complete them

use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::Broker;

/// Identifier handed to the helper when it reads the control channel
pub type RequestId = u64;

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Waiting in the control channel queue
    Queued,
    /// Handed to the helper, handle still open
    Delivered,
    /// Handle closed by the helper
    Completed,
    /// Not completed within the configured bound; waiters were failed
    TimedOut,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::TimedOut)
    }
}

/// A unit of work for one unresolved virtual path.
///
/// Shared by the broker's tables, every waiter on the path, and (once
/// delivered) the helper's [`RequestHandle`].
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    path: String,
    created: Instant,
    state: Mutex<RequestState>,
    done: Condvar,
}

impl Request {
    pub(crate) fn new(id: RequestId, path: String) -> Self {
        Self {
            id,
            path,
            created: Instant::now(),
            state: Mutex::new(RequestState::Queued),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn state(&self) -> RequestState {
        *self.state.lock()
    }

    pub(crate) fn mark_delivered(&self) {
        let mut state = self.state.lock();
        if *state == RequestState::Queued {
            *state = RequestState::Delivered;
        }
    }

    /// Move to a terminal state and wake every waiter. A request that is
    /// already terminal keeps its state. Returns the final state.
    pub(crate) fn finish(&self, outcome: RequestState) -> RequestState {
        let mut state = self.state.lock();
        if !state.is_terminal() {
            *state = outcome;
            self.done.notify_all();
        }
        *state
    }

    /// Block until the request is terminal or `deadline` passes. Returns the
    /// state observed on wake, which is not terminal on timeout.
    pub(crate) fn wait(&self, deadline: Option<Instant>) -> RequestState {
        let mut state = self.state.lock();
        while !state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.done.wait(&mut state),
            }
        }
        *state
    }
}

/// The helper's end of one delivered request.
///
/// Reading yields the request's virtual path once. Closing the handle (or
/// dropping it) is the only completion signal; it happens exactly once.
#[derive(Debug)]
pub struct RequestHandle {
    broker: Arc<Broker>,
    request: Arc<Request>,
    path_sent: bool,
}

impl RequestHandle {
    pub(crate) fn new(broker: Arc<Broker>, request: Arc<Request>) -> Self {
        Self {
            broker,
            request,
            path_sent: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.request.id()
    }

    /// The requested virtual path, without consuming the single-shot read
    pub fn path(&self) -> &str {
        self.request.path()
    }

    /// Single-shot read: the absolute virtual path followed by a NUL byte,
    /// then nothing on every later call
    pub fn read(&mut self) -> Vec<u8> {
        if self.path_sent {
            return Vec::new();
        }
        self.path_sent = true;
        let mut bytes = Vec::with_capacity(self.request.path().len() + 1);
        bytes.extend_from_slice(self.request.path().as_bytes());
        bytes.push(0);
        bytes
    }

    /// Signal completion. Equivalent to dropping the handle.
    pub fn close(self) {}
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.broker.complete(&self.request);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_finish_is_sticky() {
        let request = Request::new(1, "/a".into());
        assert_eq!(request.state(), RequestState::Queued);
        request.mark_delivered();
        assert_eq!(request.state(), RequestState::Delivered);

        assert_eq!(request.finish(RequestState::Completed), RequestState::Completed);
        assert_eq!(request.finish(RequestState::TimedOut), RequestState::Completed);
        request.mark_delivered();
        assert_eq!(request.state(), RequestState::Completed);
    }

    #[test]
    fn test_wait_deadline() {
        let request = Request::new(1, "/a".into());
        let state = request.wait(Some(Instant::now() + Duration::from_millis(20)));
        assert_eq!(state, RequestState::Queued);
    }

    #[test]
    fn test_wait_wakes_all_waiters() {
        let request = Arc::new(Request::new(1, "/a".into()));
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let request = request.clone();
                std::thread::spawn(move || request.wait(None))
            })
            .collect();

        std::thread::sleep(Duration::from_millis(20));
        request.finish(RequestState::Completed);

        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), RequestState::Completed);
        }
    }
}
