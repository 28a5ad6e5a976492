//! Request broker: bridges cache misses to the helper
//!
//! A resolver that misses the cache calls [`Broker::fetch`], which queues a
//! [`Request`] for the path (or joins the one already in flight) and blocks
//! until the helper closes the request's handle.
//!
//! The helper attaches with [`Broker::attach`], getting the single
//! [`ControlChannel`]. Reading the channel yields queued requests in
//! creation order as [`RequestHandle`]s. The helper reads the path from a
//! handle, populates the cache store (or decides the path does not exist)
//! and closes the handle. Closing is the only completion signal: waiters
//! never learn whether the helper succeeded, they re-check the cache.
//!
//! # Attachment
//!
//! - Only one helper may hold the control channel; a second attach fails
//!   with [`LazyFsError::AlreadyInUse`].
//! - The first attach of a mount queues a bootstrap request for `/` at the
//!   front of the queue.
//! - Dropping the channel detaches. Undelivered requests stay queued for
//!   the next helper and their waiters keep blocking.
//!
//! # Timeouts
//!
//! With a request timeout configured, a request that is still queued or
//! delivered when its deadline passes is withdrawn and its waiters fail with
//! [`LazyFsError::Timeout`]. Other requests are unaffected, and a late close
//! of the withdrawn request's handle does nothing.

mod request;

pub use request::{Request, RequestHandle, RequestId, RequestState};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{LazyFsError, Result};
use crate::path;

#[derive(Debug, Default)]
struct BrokerState {
    /// Attachment session of the current helper, if any
    session: Option<u64>,
    next_session: u64,
    /// Whether the first-attach bootstrap request has been issued
    bootstrapped: bool,
    next_id: RequestId,
    /// Requests not yet delivered, in creation order
    queue: VecDeque<Arc<Request>>,
    /// Queued or delivered requests by virtual path
    in_flight: HashMap<String, Arc<Request>>,
    stats: BrokerStats,
}

impl BrokerState {
    fn create(&mut self, path: String) -> Arc<Request> {
        self.next_id += 1;
        let request = Arc::new(Request::new(self.next_id, path.clone()));
        self.in_flight.insert(path, request.clone());
        self.stats.created += 1;
        request
    }

    /// Drop `request` from the tables if it is still the live request for
    /// its path
    fn withdraw(&mut self, request: &Arc<Request>) {
        let live = self
            .in_flight
            .get(request.path())
            .is_some_and(|current| Arc::ptr_eq(current, request));
        if live {
            self.in_flight.remove(request.path());
        }
        self.queue.retain(|queued| !Arc::ptr_eq(queued, request));
    }
}

/// Counters describing broker activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Requests created
    pub created: u64,
    /// Fetches that joined a request already in flight
    pub joined: u64,
    /// Requests handed to a helper
    pub delivered: u64,
    /// Handles closed
    pub completed: u64,
    /// Requests withdrawn by the timeout
    pub timed_out: u64,
}

/// Snapshot of the broker for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub attached: bool,
    pub queued: usize,
    pub in_flight: usize,
    pub stats: BrokerStats,
}

/// Turns cache misses into requests for the attached helper
#[derive(Debug)]
pub struct Broker {
    state: Mutex<BrokerState>,
    /// Signalled when a request is queued or the helper detaches
    readable: Condvar,
    timeout: Option<Duration>,
}

impl Broker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            readable: Condvar::new(),
            timeout,
        }
    }

    /// Register the caller as the sole helper
    pub fn attach(self: &Arc<Self>) -> Result<ControlChannel> {
        let mut state = self.state.lock();
        if state.session.is_some() {
            debug!("rejecting second helper");
            return Err(LazyFsError::AlreadyInUse);
        }

        state.next_session += 1;
        let session = state.next_session;
        state.session = Some(session);

        if !state.bootstrapped {
            state.bootstrapped = true;
            let root = match state.in_flight.get(path::ROOT).cloned() {
                Some(existing) => {
                    state.queue.retain(|queued| !Arc::ptr_eq(queued, &existing));
                    existing
                }
                None => state.create(path::ROOT.to_string()),
            };
            if root.state() == RequestState::Queued {
                state.queue.push_front(root);
            }
        }

        info!(session, queued = state.queue.len(), "helper attached");
        self.readable.notify_all();
        Ok(ControlChannel {
            broker: self.clone(),
            session,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().session.is_some()
    }

    /// Ask the helper for `path` and block until the request completes.
    ///
    /// Returning `Ok` only means the helper is done with the path; callers
    /// must re-read the cache store to find out what it published.
    pub fn fetch(&self, path: &str) -> Result<()> {
        let path = path::normalize(path);
        let request = {
            let mut state = self.state.lock();
            match state.in_flight.get(&path).cloned() {
                Some(existing) => {
                    debug!(path, id = existing.id(), "joining in-flight request");
                    state.stats.joined += 1;
                    existing
                }
                None => {
                    let request = state.create(path.clone());
                    state.queue.push_back(request.clone());
                    debug!(
                        path,
                        id = request.id(),
                        attached = state.session.is_some(),
                        "queued request"
                    );
                    self.readable.notify_all();
                    request
                }
            }
        };

        let deadline = self.timeout.map(|timeout| request.created() + timeout);
        match request.wait(deadline) {
            RequestState::Completed => Ok(()),
            RequestState::TimedOut => Err(LazyFsError::Timeout(path)),
            _ => self.expire(&request),
        }
    }

    /// Withdraw a request whose deadline passed
    fn expire(&self, request: &Arc<Request>) -> Result<()> {
        let mut state = self.state.lock();
        state.withdraw(request);
        match request.state() {
            // Completed between the wait timing out and taking the lock
            RequestState::Completed => Ok(()),
            // Another waiter on the same request already expired it
            RequestState::TimedOut => Err(LazyFsError::Timeout(request.path().to_string())),
            _ => {
                request.finish(RequestState::TimedOut);
                state.stats.timed_out += 1;
                warn!(path = request.path(), id = request.id(), "request timed out");
                Err(LazyFsError::Timeout(request.path().to_string()))
            }
        }
    }

    /// Called when a handle closes
    fn complete(&self, request: &Arc<Request>) {
        let mut state = self.state.lock();
        state.withdraw(request);
        if request.finish(RequestState::Completed) == RequestState::Completed {
            state.stats.completed += 1;
            debug!(path = request.path(), id = request.id(), "request completed");
        }
    }

    fn next(
        self: &Arc<Self>,
        session: u64,
        deadline: Option<Instant>,
    ) -> Result<Option<RequestHandle>> {
        let mut state = self.state.lock();
        loop {
            if state.session != Some(session) {
                return Err(LazyFsError::Detached);
            }
            if let Some(request) = state.queue.pop_front() {
                request.mark_delivered();
                state.stats.delivered += 1;
                debug!(path = request.path(), id = request.id(), "delivering request");
                return Ok(Some(RequestHandle::new(self.clone(), request)));
            }
            match deadline {
                Some(deadline) => {
                    if self.readable.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                    {
                        return Ok(None);
                    }
                }
                None => self.readable.wait(&mut state),
            }
        }
    }

    fn detach(&self, session: u64) {
        let mut state = self.state.lock();
        if state.session == Some(session) {
            state.session = None;
            info!(session, queued = state.queue.len(), "helper detached");
            self.readable.notify_all();
        }
    }

    pub fn status(&self) -> BrokerStatus {
        let state = self.state.lock();
        BrokerStatus {
            attached: state.session.is_some(),
            queued: state.queue.len(),
            in_flight: state.in_flight.len(),
            stats: state.stats,
        }
    }
}

/// The helper's end of the broker.
///
/// Held by at most one helper at a time; dropping it (or calling
/// [`ControlChannel::detach`]) returns the mount to the detached state.
#[derive(Debug)]
pub struct ControlChannel {
    broker: Arc<Broker>,
    session: u64,
}

impl ControlChannel {
    /// Block until a request is queued and take it
    pub fn next_request(&self) -> Result<RequestHandle> {
        self.broker
            .next(self.session, None)?
            .ok_or(LazyFsError::Detached)
    }

    /// Like [`next_request`](Self::next_request), giving up after `timeout`
    pub fn next_request_timeout(&self, timeout: Duration) -> Result<Option<RequestHandle>> {
        self.broker.next(self.session, Some(Instant::now() + timeout))
    }

    /// Take a queued request without blocking
    pub fn try_next_request(&self) -> Result<Option<RequestHandle>> {
        self.broker.next(self.session, Some(Instant::now()))
    }

    /// Release the channel. Blocked readers on this channel fail with
    /// [`LazyFsError::Detached`].
    pub fn detach(&self) {
        self.broker.detach(self.session);
    }

    pub fn is_attached(&self) -> bool {
        self.broker.state.lock().session == Some(self.session)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.broker.detach(self.session);
    }
}
