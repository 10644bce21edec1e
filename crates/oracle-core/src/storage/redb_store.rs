//! # redb-backed Session Storage
//!
//! Sessions and transition history stored in a redb embedded database.
//!
//! - ACID transactions: `commit_transition` writes the session and its
//!   transition in one write transaction
//! - Crash safety (copy-on-write B-trees)
//! - Values are postcard-encoded
//!
//! Transition keys are `(user_id, sequence)` so one user's history is a
//! single contiguous range.

use super::SessionStore;
use crate::session::{PersonalOracleSession, StageTransition};
use crate::{OracleError, SessionId, UserId};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition};
use std::path::Path;

/// Table for sessions: session id -> serialized session bytes
const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Table for transitions: (user id, sequence) -> serialized transition bytes
const TRANSITIONS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("transitions");

fn storage_err(e: impl std::fmt::Display) -> OracleError {
    OracleError::Storage(e.to_string())
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, OracleError> {
    postcard::to_allocvec(value).map_err(|e| OracleError::Serialization(e.to_string()))
}

/// Insert at the next free sequence number of `user`.
fn push_transition(
    table: &mut Table<'_, (&'static str, u64), &'static [u8]>,
    user: &UserId,
    bytes: &[u8],
) -> Result<(), OracleError> {
    let next_seq = {
        let mut range = table
            .range((user.as_str(), 0u64)..=(user.as_str(), u64::MAX))
            .map_err(storage_err)?;
        match range.next_back() {
            Some(entry) => {
                let (key, _) = entry.map_err(storage_err)?;
                key.value().1.saturating_add(1)
            }
            None => 0,
        }
    };
    table
        .insert((user.as_str(), next_seq), bytes)
        .map_err(storage_err)?;
    Ok(())
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, OracleError> {
    postcard::from_bytes(bytes).map_err(|e| OracleError::Serialization(e.to_string()))
}

/// A disk-backed session store.
pub struct RedbStore {
    db: Database,
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

impl RedbStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, OracleError> {
        let db = Database::create(path.as_ref()).map_err(storage_err)?;

        // Initialize tables if they don't exist
        {
            let write_txn = db.begin_write().map_err(storage_err)?;
            let _ = write_txn.open_table(SESSIONS).map_err(storage_err)?;
            let _ = write_txn.open_table(TRANSITIONS).map_err(storage_err)?;
            write_txn.commit().map_err(storage_err)?;
        }

        tracing::debug!(event = "store_opened", path = %path.as_ref().display());
        Ok(Self { db })
    }
}

impl SessionStore for RedbStore {
    fn get(&self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(SESSIONS).map_err(storage_err)?;

        match table.get(id.as_str()).map_err(storage_err)? {
            Some(data) => Ok(Some(decode(data.value())?)),
            None => Ok(None),
        }
    }

    fn put(&mut self, session: PersonalOracleSession) -> Result<(), OracleError> {
        let bytes = encode(&session)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(SESSIONS).map_err(storage_err)?;
            table
                .insert(session.session_id.as_str(), bytes.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<PersonalOracleSession>, OracleError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(SESSIONS).map_err(storage_err)?;

        let mut sessions = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            sessions.push(decode(value.value())?);
        }
        Ok(sessions)
    }

    fn remove(&mut self, id: &SessionId) -> Result<Option<PersonalOracleSession>, OracleError> {
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS).map_err(storage_err)?;
            let previous = table.remove(id.as_str()).map_err(storage_err)?;
            match previous {
                Some(data) => Some(decode::<PersonalOracleSession>(data.value())?),
                None => None,
            }
        };
        write_txn.commit().map_err(storage_err)?;
        Ok(removed)
    }

    fn append_transition(
        &mut self,
        user: &UserId,
        transition: StageTransition,
    ) -> Result<(), OracleError> {
        let bytes = encode(&transition)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = write_txn.open_table(TRANSITIONS).map_err(storage_err)?;
            push_transition(&mut table, user, &bytes)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn commit_transition(
        &mut self,
        session: PersonalOracleSession,
        transition: StageTransition,
    ) -> Result<(), OracleError> {
        let session_bytes = encode(&session)?;
        let transition_bytes = encode(&transition)?;
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut transitions = write_txn.open_table(TRANSITIONS).map_err(storage_err)?;
            push_transition(&mut transitions, &session.user_id, &transition_bytes)?;
            let mut sessions = write_txn.open_table(SESSIONS).map_err(storage_err)?;
            sessions
                .insert(session.session_id.as_str(), session_bytes.as_slice())
                .map_err(storage_err)?;
        }
        write_txn.commit().map_err(storage_err)?;
        Ok(())
    }

    fn transitions(&self, user: &UserId) -> Result<Vec<StageTransition>, OracleError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(TRANSITIONS).map_err(storage_err)?;

        let mut history = Vec::new();
        for entry in table
            .range((user.as_str(), 0u64)..=(user.as_str(), u64::MAX))
            .map_err(storage_err)?
        {
            let (_, value) = entry.map_err(storage_err)?;
            history.push(decode(value.value())?);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tests::{exercise_store, session, transition};
    use crate::system::Stage;
    use tempfile::tempdir;

    #[test]
    fn redb_store_contract() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("oracle.redb")).expect("open db");
        exercise_store(&mut store);
    }

    #[test]
    fn persistence() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("oracle.redb");
        let user = UserId::new("u1");

        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            store.put(session("u1", "s1")).expect("put");
            store
                .append_transition(&user, transition(Stage::DialogicalCompanion))
                .expect("append");
        }

        let store = RedbStore::open(&db_path).expect("reopen db");
        let restored = store.get(&SessionId::new("s1")).expect("get").expect("some");
        assert_eq!(restored, session("u1", "s1"));
        let history = store.transitions(&user).expect("history");
        assert_eq!(history, vec![transition(Stage::DialogicalCompanion)]);
    }

    #[test]
    fn committed_transition_survives_reopen() {
        let temp = tempdir().expect("temp dir");
        let db_path = temp.path().join("oracle.redb");

        {
            let mut store = RedbStore::open(&db_path).expect("open db");
            store.put(session("u1", "s1")).expect("put");
            let mut upgraded = session("u1", "s1");
            upgraded.apply_transition(transition(Stage::DialogicalCompanion));
            store
                .commit_transition(upgraded, transition(Stage::DialogicalCompanion))
                .expect("commit");
        }

        let store = RedbStore::open(&db_path).expect("reopen db");
        let restored = store.get(&SessionId::new("s1")).expect("get").expect("some");
        assert_eq!(restored.current_stage(), Stage::DialogicalCompanion);
        let history = store.transitions(&UserId::new("u1")).expect("history");
        assert_eq!(history, vec![transition(Stage::DialogicalCompanion)]);
    }

    #[test]
    fn histories_do_not_bleed_between_prefixed_users() {
        let temp = tempdir().expect("temp dir");
        let mut store = RedbStore::open(temp.path().join("oracle.redb")).expect("open db");

        store
            .append_transition(&UserId::new("ab"), transition(Stage::DialogicalCompanion))
            .expect("append");
        store
            .append_transition(&UserId::new("a"), transition(Stage::CoCreativePartner))
            .expect("append");

        assert_eq!(store.transitions(&UserId::new("a")).expect("a").len(), 1);
        assert_eq!(store.transitions(&UserId::new("ab")).expect("ab").len(), 1);
    }
}
