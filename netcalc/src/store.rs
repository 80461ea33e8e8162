//! In-memory result store, partitioned by session.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;

use crate::datagram::{ErrorCode, Operation, ResultId, ResultRecord, SessionId};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("no stored results")]
    NotExistingData,
    #[error("result does not belong to the requesting session")]
    Unauthorised,
    #[error("result id space exhausted")]
    MaxValueExceeded,
}

impl StoreError {
    pub fn code(self) -> ErrorCode {
        match self {
            StoreError::NotExistingData => ErrorCode::NotExistingData,
            StoreError::Unauthorised => ErrorCode::Unauthorised,
            StoreError::MaxValueExceeded => ErrorCode::MaxValueExceeded,
        }
    }
}

/// Thread-safe result store.
///
/// Result ids come from one counter shared by all sessions.  Records are
/// kept per session in id order, which is also insertion order.
#[derive(Clone, Default)]
pub struct ResultStore {
    inner: Arc<Mutex<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    partitions: HashMap<SessionId, BTreeMap<ResultId, ResultRecord>>,
    owners: HashMap<ResultId, SessionId>,
    last_result_id: ResultId,
    /// Oldest records of a session are dropped beyond this many.
    max_per_session: Option<usize>,
    evictions: u64,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `max_per_session` records for each session.
    pub fn with_capacity_per_session(max_per_session: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                max_per_session: Some(max_per_session.max(1)),
                ..StoreInner::default()
            })),
        }
    }

    /// Reserve the next result id.
    pub fn next_result_id(&self) -> Result<ResultId, StoreError> {
        self.lock().next_id()
    }

    /// Create the (empty) partition for a freshly connected session.
    pub fn open(&self, session_id: SessionId) {
        self.lock().partitions.entry(session_id).or_default();
    }

    /// Store `record` under its owning session.
    pub fn record(&self, record: ResultRecord) {
        self.lock().insert(record);
    }

    /// Allocate an id and store the computation as one step.
    pub fn insert(
        &self,
        session_id: SessionId,
        operation: Operation,
        a: f64,
        b: f64,
        value: f64,
    ) -> Result<ResultRecord, StoreError> {
        let mut inner = self.lock();
        let record = ResultRecord {
            result_id: inner.next_id()?,
            session_id,
            operation,
            a,
            b,
            value,
        };
        inner.insert(record);
        Ok(record)
    }

    /// Look up `result_id` on behalf of `session_id`.
    ///
    /// A result held by another session is reported exactly like one that
    /// never existed.
    pub fn get(&self, session_id: SessionId, result_id: ResultId) -> Result<ResultRecord, StoreError> {
        let inner = self.lock();
        let partition = inner
            .partitions
            .get(&session_id)
            .filter(|p| !p.is_empty())
            .ok_or(StoreError::NotExistingData)?;
        partition
            .get(&result_id)
            .copied()
            .ok_or(StoreError::Unauthorised)
    }

    /// Every record of `session_id`, oldest first.
    pub fn list(&self, session_id: SessionId) -> Result<Vec<ResultRecord>, StoreError> {
        let inner = self.lock();
        match inner.partitions.get(&session_id) {
            Some(p) if !p.is_empty() => Ok(p.values().copied().collect()),
            _ => Err(StoreError::NotExistingData),
        }
    }

    /// Unscoped lookup for the operator console.
    pub fn find(&self, result_id: ResultId) -> Option<ResultRecord> {
        let inner = self.lock();
        let owner = inner.owners.get(&result_id)?;
        inner.partitions.get(owner)?.get(&result_id).copied()
    }

    /// Total records currently held.
    pub fn len(&self) -> usize {
        self.lock().owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evictions(&self) -> u64 {
        self.lock().evictions
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StoreInner {
    fn next_id(&mut self) -> Result<ResultId, StoreError> {
        let id = self
            .last_result_id
            .checked_add(1)
            .ok_or(StoreError::MaxValueExceeded)?;
        self.last_result_id = id;
        Ok(id)
    }

    fn insert(&mut self, record: ResultRecord) {
        let partition = self.partitions.entry(record.session_id).or_default();
        partition.insert(record.result_id, record);
        self.owners.insert(record.result_id, record.session_id);

        if let Some(max) = self.max_per_session {
            while partition.len() > max {
                if let Some((oldest, _)) = partition.pop_first() {
                    self.owners.remove(&oldest);
                    self.evictions += 1;
                }
            }
        }
    }
}
