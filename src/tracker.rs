//! Resource tracker
//!
//! Every listener, connection and session the server owns is registered
//! here with its own cancellation token. [`Tracker::close`] cancels them in a
//! fixed order and waits until every registration has been dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("server is already closing")]
    AlreadyClosing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Listener,
    Conn,
    Session,
}

#[derive(Default)]
struct State {
    next_id: u64,
    listeners: HashMap<u64, CancellationToken>,
    conns: HashMap<u64, CancellationToken>,
    sessions: HashMap<u64, CancellationToken>,
    closing: bool,
}

impl State {
    fn entries(&mut self, kind: Kind) -> &mut HashMap<u64, CancellationToken> {
        match kind {
            Kind::Listener => &mut self.listeners,
            Kind::Conn => &mut self.conns,
            Kind::Session => &mut self.sessions,
        }
    }
}

/// Snapshot of what is currently registered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub listeners: usize,
    pub conns: usize,
    pub sessions: usize,
}

pub struct Tracker {
    state: Mutex<State>,
    closing: watch::Sender<bool>,
    tasks: TaskTracker,
}

impl Default for Tracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            closing: watch::Sender::new(false),
            tasks: TaskTracker::new(),
        }
    }
}

/// Keeps a resource registered. Dropping it deregisters the resource and
/// releases its hold on [`Tracker::close`].
pub struct Registration {
    tracker: Arc<Tracker>,
    kind: Kind,
    id: u64,
    cancel: CancellationToken,
    _task: TaskTrackerToken,
}

impl Registration {
    /// Cancelled when the tracker closes this resource.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Unique among everything this tracker has registered.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.tracker.lock().entries(self.kind).remove(&self.id);
    }
}

impl Tracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_register(self: &Arc<Self>, kind: Kind, cancel: CancellationToken) -> Option<Registration> {
        let mut state = self.lock();
        if state.closing {
            return None;
        }
        state.next_id += 1;
        let id = state.next_id;
        state.entries(kind).insert(id, cancel.clone());
        Some(Registration {
            tracker: Arc::clone(self),
            kind,
            id,
            cancel,
            _task: self.tasks.token(),
        })
    }

    /// Register a listener. While a close is in flight this waits for it to
    /// finish instead of failing.
    pub async fn track_listener(self: &Arc<Self>, cancel: CancellationToken) -> Registration {
        let mut closing = self.closing.subscribe();
        loop {
            if let Some(reg) = self.try_register(Kind::Listener, cancel.clone()) {
                return reg;
            }
            debug!("listener registration waiting for close to finish");
            // The sender lives in `self`, so this only returns once closing clears.
            let _ = closing.wait_for(|closing| !*closing).await;
        }
    }

    /// Register a listener, or `None` while closing. For listeners created
    /// from inside a connection, which must not wait on a close that is
    /// itself waiting for that connection.
    pub fn try_track_listener(self: &Arc<Self>, cancel: CancellationToken) -> Option<Registration> {
        self.try_register(Kind::Listener, cancel)
    }

    /// Register a connection accepted on `listener`. `None` while closing or
    /// once the listener itself is gone.
    pub fn track_conn(
        self: &Arc<Self>,
        listener: &Registration,
        cancel: CancellationToken,
    ) -> Option<Registration> {
        if listener.cancel.is_cancelled() || !self.lock().listeners.contains_key(&listener.id) {
            return None;
        }
        self.try_register(Kind::Conn, cancel)
    }

    /// Register a session. `None` while closing.
    pub fn track_session(self: &Arc<Self>, cancel: CancellationToken) -> Option<Registration> {
        self.try_register(Kind::Session, cancel)
    }

    pub fn is_closing(&self) -> bool {
        self.lock().closing
    }

    pub fn counts(&self) -> Counts {
        let state = self.lock();
        Counts {
            listeners: state.listeners.len(),
            conns: state.conns.len(),
            sessions: state.sessions.len(),
        }
    }

    /// Cancel sessions, then listeners, then connections, and wait for all
    /// of them to deregister. The tracker accepts registrations again
    /// afterwards.
    pub async fn close(&self) -> Result<(), TrackerError> {
        let (sessions, listeners, conns) = {
            let mut state = self.lock();
            if state.closing {
                return Err(TrackerError::AlreadyClosing);
            }
            state.closing = true;
            self.closing.send_replace(true);
            (
                state.sessions.values().cloned().collect::<Vec<_>>(),
                state.listeners.values().cloned().collect::<Vec<_>>(),
                state.conns.values().cloned().collect::<Vec<_>>(),
            )
        };

        debug!(
            sessions = sessions.len(),
            listeners = listeners.len(),
            conns = conns.len(),
            "closing tracked resources"
        );
        for token in sessions.iter().chain(&listeners).chain(&conns) {
            token.cancel();
        }

        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        self.lock().closing = false;
        self.closing.send_replace(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn registrations_are_removed_on_drop() {
        let tracker = Tracker::new();
        let listener = tracker.track_listener(CancellationToken::new()).await;
        let conn = tracker.track_conn(&listener, CancellationToken::new()).unwrap();
        let session = tracker.track_session(CancellationToken::new()).unwrap();
        assert_eq!(
            tracker.counts(),
            Counts {
                listeners: 1,
                conns: 1,
                sessions: 1
            }
        );
        drop((listener, conn, session));
        assert_eq!(tracker.counts(), Counts::default());
    }

    #[tokio::test]
    async fn close_cancels_everything_and_waits() {
        let tracker = Tracker::new();
        let listener = tracker.track_listener(CancellationToken::new()).await;
        let session = tracker.track_session(CancellationToken::new()).unwrap();
        let conn = tracker.track_conn(&listener, CancellationToken::new()).unwrap();

        // Holders let go only once cancelled.
        for reg in [session, conn, listener] {
            tokio::spawn(async move {
                reg.token().cancelled().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                drop(reg);
            });
        }

        tokio::time::timeout(Duration::from_secs(5), tracker.close())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.counts(), Counts::default());
        assert!(!tracker.is_closing());

        // Serving again is allowed.
        assert!(tracker.track_session(CancellationToken::new()).is_some());
    }

    #[tokio::test]
    async fn overlapping_close_is_rejected() {
        let tracker = Tracker::new();
        let conn = tracker.track_session(CancellationToken::new()).unwrap();

        let first = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.close().await })
        };
        // Wait until the first close has started.
        while !tracker.is_closing() {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            tracker.close().await,
            Err(TrackerError::AlreadyClosing)
        ));
        assert!(tracker.track_session(CancellationToken::new()).is_none());

        drop(conn);
        first.await.unwrap().unwrap();
        assert!(tracker.close().await.is_ok());
    }

    #[tokio::test]
    async fn listener_registration_waits_for_close() {
        let tracker = Tracker::new();
        let conn = tracker.track_session(CancellationToken::new()).unwrap();

        let closer = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.close().await })
        };
        while !tracker.is_closing() {
            tokio::task::yield_now().await;
        }

        let waiting = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.track_listener(CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(conn);
        closer.await.unwrap().unwrap();
        let listener = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tracker.counts().listeners, 1);
        drop(listener);
    }

    #[tokio::test]
    async fn nested_listeners_are_refused_while_closing() {
        let tracker = Tracker::new();
        let session = tracker.track_session(CancellationToken::new()).unwrap();
        let closer = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { tracker.close().await })
        };
        while !tracker.is_closing() {
            tokio::task::yield_now().await;
        }
        assert!(tracker.try_track_listener(CancellationToken::new()).is_none());
        drop(session);
        closer.await.unwrap().unwrap();
        assert!(tracker.try_track_listener(CancellationToken::new()).is_some());
    }

    #[tokio::test]
    async fn conns_need_a_live_listener() {
        let tracker = Tracker::new();
        let listener = tracker.track_listener(CancellationToken::new()).await;
        assert!(tracker
            .track_conn(&listener, CancellationToken::new())
            .is_some());
        listener.token().cancel();
        assert!(tracker
            .track_conn(&listener, CancellationToken::new())
            .is_none());
    }
}
