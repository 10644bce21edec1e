//! # Session Storage
//!
//! Where live sessions and per-user transition history are kept.
//!
//! Two backends implement [`SessionStore`]:
//! - [`InMemoryStore`]: `BTreeMap`-backed, volatile
//! - [`RedbStore`]: redb-backed, survives restarts

mod redb_store;

pub use redb_store::RedbStore;

use crate::session::{PersonalOracleSession, StageTransition};
use crate::{OracleError, SessionId, UserId};
use std::collections::BTreeMap;

/// Persistence interface for sessions and transition history.
///
/// Transition history is keyed by user, not by session, so it outlives the
/// sessions that produced it.
pub trait SessionStore: Send + Sync {
    /// Fetch a live session.
    fn get(&self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError>;

    /// Insert or replace a session.
    fn put(&mut self, session: PersonalOracleSession) -> Result<(), OracleError>;

    /// All live sessions, ordered by session id.
    fn list(&self) -> Result<Vec<PersonalOracleSession>, OracleError>;

    /// Remove a session, returning it if it existed.
    fn remove(&mut self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError>;

    /// Append to a user's transition history.
    fn append_transition(
        &mut self,
        user: &UserId,
        transition: StageTransition,
    ) -> Result<(), OracleError>;

    /// Store a session together with the transition it just applied.
    ///
    /// Both writes land or neither does, so the stored session's stage always
    /// matches the last recorded `to_stage`.
    fn commit_transition(
        &mut self,
        session: PersonalOracleSession,
        transition: StageTransition,
    ) -> Result<(), OracleError>;

    /// A user's transition history, oldest first.
    fn transitions(&self, user: &UserId) -> Result<Vec<StageTransition>, OracleError>;

    /// Live sessions belonging to one user.
    fn sessions_for(&self, user: &UserId) -> Result<Vec<PersonalOracleSession>, OracleError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| &s.user_id == user)
            .collect())
    }
}

/// Volatile session store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: BTreeMap<SessionId, PersonalOracleSession>,
    history: BTreeMap<UserId, Vec<StageTransition>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemoryStore {
    fn get(&self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError> {
        Ok(self.sessions.get(id).cloned())
    }

    fn put(&mut self, session: PersonalOracleSession) -> Result<(), OracleError> {
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersonalOracleSession>, OracleError> {
        Ok(self.sessions.values().cloned().collect())
    }

    fn remove(&mut self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError> {
        Ok(self.sessions.remove(id))
    }

    fn append_transition(
        &mut self,
        user: &UserId,
        transition: StageTransition,
    ) -> Result<(), OracleError> {
        self.history
            .entry(user.clone())
            .or_default()
            .push(transition);
        Ok(())
    }

    fn commit_transition(
        &mut self,
        session: PersonalOracleSession,
        transition: StageTransition,
    ) -> Result<(), OracleError> {
        self.history
            .entry(session.user_id.clone())
            .or_default()
            .push(transition);
        self.sessions.insert(session.session_id.clone(), session);
        Ok(())
    }

    fn transitions(&self, user: &UserId) -> Result<Vec<StageTransition>, OracleError> {
        Ok(self.history.get(user).cloned().unwrap_or_default())
    }
}
