//! Live session table shared by every connection handler.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::datagram::{ErrorCode, SessionId};

/// Server-side record binding a connection to its session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub address: SocketAddr,
    pub alive: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("session id space exhausted")]
    Exhausted,
    #[error("live session limit of {0} reached")]
    LimitReached(usize),
    #[error("session {0} not found")]
    NotFound(SessionId),
}

impl SessionError {
    pub fn code(self) -> ErrorCode {
        match self {
            SessionError::Exhausted | SessionError::LimitReached(_) => {
                ErrorCode::MaxValueExceeded
            }
            SessionError::NotFound(_) => ErrorCode::SessionIdNotFound,
        }
    }
}

/// Thread-safe session table.
///
/// Cloning yields another handle to the same table.  Every operation takes
/// the single table lock, so an id handed out by [`allocate`] is visible to
/// every later [`lookup`] from any task.
///
/// [`allocate`]: SessionTable::allocate
/// [`lookup`]: SessionTable::lookup
#[derive(Clone, Default)]
pub struct SessionTable {
    inner: Arc<Mutex<TableInner>>,
}

#[derive(Default)]
struct TableInner {
    sessions: HashMap<SessionId, Session>,
    /// Last id handed out; ids are never reused.
    last_id: SessionId,
    max_live: Option<usize>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that refuses new sessions while `max_live` are registered.
    pub fn with_limit(max_live: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableInner {
                max_live: Some(max_live),
                ..TableInner::default()
            })),
        }
    }

    /// Register a new live session for `address` and return its id.
    ///
    /// Ids start at 1 and strictly increase for the lifetime of the table.
    pub fn allocate(&self, address: SocketAddr) -> Result<SessionId, SessionError> {
        let mut inner = self.lock();
        if let Some(max) = inner.max_live {
            if inner.sessions.len() >= max {
                return Err(SessionError::LimitReached(max));
            }
        }
        let id = inner.last_id.checked_add(1).ok_or(SessionError::Exhausted)?;
        inner.last_id = id;
        inner.sessions.insert(
            id,
            Session {
                id,
                address,
                alive: true,
            },
        );
        Ok(id)
    }

    pub fn lookup(&self, id: SessionId) -> Option<Session> {
        self.lock().sessions.get(&id).cloned()
    }

    pub fn is_alive(&self, id: SessionId) -> bool {
        self.lock().sessions.get(&id).is_some_and(|s| s.alive)
    }

    pub fn mark_dead(&self, id: SessionId) -> Result<(), SessionError> {
        let mut inner = self.lock();
        let session = inner.sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        session.alive = false;
        Ok(())
    }

    pub fn remove(&self, id: SessionId) -> Option<Session> {
        self.lock().sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All registered sessions, ordered by id.
    pub fn snapshot(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        // Every mutation is a single insert, remove or field store.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn ids_start_at_one_and_increase() {
        let table = SessionTable::new();
        assert_eq!(table.allocate(addr()), Ok(1));
        assert_eq!(table.allocate(addr()), Ok(2));
        table.remove(2);
        assert_eq!(table.allocate(addr()), Ok(3), "removed ids are not reused");
    }

    #[test]
    fn new_session_is_alive_until_marked_dead() {
        let table = SessionTable::new();
        let id = table.allocate(addr()).unwrap();
        assert!(table.is_alive(id));
        table.mark_dead(id).unwrap();
        assert!(!table.is_alive(id));
        assert_eq!(table.lookup(id).map(|s| s.alive), Some(false));
    }

    #[test]
    fn unknown_session_operations() {
        let table = SessionTable::new();
        assert_eq!(table.lookup(5), None);
        assert!(!table.is_alive(5));
        assert_eq!(table.mark_dead(5), Err(SessionError::NotFound(5)));
        assert_eq!(table.remove(5), None);
    }

    #[test]
    fn lookup_reports_address() {
        let table = SessionTable::new();
        let peer: SocketAddr = "10.0.0.9:5555".parse().unwrap();
        let id = table.allocate(peer).unwrap();
        assert_eq!(table.lookup(id).unwrap().address, peer);
    }

    #[test]
    fn limit_refuses_until_a_session_leaves() {
        let table = SessionTable::with_limit(1);
        let id = table.allocate(addr()).unwrap();
        assert_eq!(table.allocate(addr()), Err(SessionError::LimitReached(1)));
        table.remove(id);
        assert_eq!(table.allocate(addr()), Ok(2));
    }

    #[test]
    fn id_space_exhaustion() {
        let table = SessionTable::new();
        table.lock().last_id = SessionId::MAX;
        assert_eq!(table.allocate(addr()), Err(SessionError::Exhausted));
    }

    #[test]
    fn concurrent_allocation_never_duplicates() {
        let table = SessionTable::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| table.allocate(addr()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: Vec<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let unique: HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 800);
        assert_eq!(unique, (1..=800).collect());
    }

    #[test]
    fn snapshot_is_sorted() {
        let table = SessionTable::new();
        for _ in 0..5 {
            table.allocate(addr()).unwrap();
        }
        let ids: Vec<_> = table.snapshot().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }
}
