use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use rusqlite::{Connection, OptionalExtension as _, params};

use crate::errors::StoreError;
use crate::swap::{Contract, SwapEvent, SwapHash, SwapOutcome, SwapState};

/// One persisted state advance.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: u64,
    pub event: SwapEvent,
    pub state: SwapState,
    pub recorded_at_unix: u64,
}

/// A non-terminal swap with its full ordered history.
#[derive(Debug, Clone)]
pub struct StoredSwap {
    pub contract: Contract,
    pub events: Vec<StoredEvent>,
}

impl StoredSwap {
    /// Latest persisted snapshot, or the initial state for a fresh swap.
    pub fn last_state(&self) -> SwapState {
        self.events
            .last()
            .map(|e| e.state.clone())
            .unwrap_or_else(SwapState::initial)
    }
}

/// Durable, append-only swap log.
///
/// `append_event` is all-or-nothing and totally ordered per swap; the call
/// does not return success before the record is on disk. Once a swap is
/// marked terminal further appends are rejected. Terminal swaps may be
/// garbage collected after a retention window, but their outcome record is
/// preserved.
pub trait SwapStore: Send + Sync {
    /// Append-once: fails with [`StoreError::DuplicateContract`] if the
    /// swap hash already exists.
    fn put_contract(&self, contract: &Contract) -> Result<(), StoreError>;

    /// Returns the sequence number assigned to the event.
    fn append_event(
        &self,
        swap_hash: SwapHash,
        event: &SwapEvent,
        state: &SwapState,
    ) -> Result<u64, StoreError>;

    /// Every non-terminal swap with its full event history.
    fn load_all(&self) -> Result<Vec<StoredSwap>, StoreError>;

    /// Idempotent; the first recorded outcome wins.
    fn mark_terminal(&self, swap_hash: SwapHash, outcome: SwapOutcome) -> Result<(), StoreError>;

    fn outcome(&self, swap_hash: SwapHash) -> Result<Option<SwapOutcome>, StoreError>;

    /// Drop contract and event rows of terminal swaps older than the
    /// retention window. Returns the number of swaps collected.
    fn gc_terminal(&self, now_unix: u64, retention_secs: u64) -> Result<usize, StoreError>;
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteStore {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        // synchronous=FULL: an append has hit the platters before it returns
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;",
        )?;

        migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SwapStore for SqliteStore {
    fn put_contract(&self, contract: &Contract) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");

        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM swap_contracts WHERE swap_hash = ?1",
                params![contract.swap_hash.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(StoreError::DuplicateContract(contract.swap_hash));
        }

        conn.execute(
            r#"
INSERT INTO swap_contracts (swap_hash, direction, amount_sat, created_at, contract_json)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                contract.swap_hash.to_string(),
                contract.direction.to_string(),
                i64::try_from(contract.amount_sat).unwrap_or(i64::MAX),
                i64::try_from(contract.created_at_unix).unwrap_or(i64::MAX),
                serde_json::to_string(contract)?,
            ],
        )?;
        Ok(())
    }

    fn append_event(
        &self,
        swap_hash: SwapHash,
        event: &SwapEvent,
        state: &SwapState,
    ) -> Result<u64, StoreError> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let hash = swap_hash.to_string();

        let terminal: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM swap_outcomes WHERE swap_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if terminal.is_some() {
            return Err(StoreError::Terminal(swap_hash));
        }

        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM swap_contracts WHERE swap_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(StoreError::UnknownSwap(swap_hash));
        }

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM swap_events WHERE swap_hash = ?1",
            params![hash],
            |row| row.get(0),
        )?;

        tx.execute(
            r#"
INSERT INTO swap_events (swap_hash, seq, event_json, state_json, recorded_at)
VALUES (?1, ?2, ?3, ?4, ?5)
"#,
            params![
                hash,
                seq,
                serde_json::to_string(event)?,
                serde_json::to_string(state)?,
                now_unix_i64(),
            ],
        )?;
        tx.commit()?;

        Ok(seq as u64)
    }

    fn load_all(&self) -> Result<Vec<StoredSwap>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");

        let mut contracts = conn.prepare(
            r#"
SELECT c.contract_json
FROM swap_contracts c
LEFT JOIN swap_outcomes o ON o.swap_hash = c.swap_hash
WHERE o.swap_hash IS NULL
ORDER BY c.created_at, c.swap_hash
"#,
        )?;

        let mut out = Vec::new();
        let rows = contracts.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            let contract: Contract = serde_json::from_str(&row?)?;

            let mut events_stmt = conn.prepare(
                r#"
SELECT seq, event_json, state_json, recorded_at
FROM swap_events
WHERE swap_hash = ?1
ORDER BY seq
"#,
            )?;
            let event_rows = events_stmt.query_map(
                params![contract.swap_hash.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )?;

            let mut events = Vec::new();
            for event_row in event_rows {
                let (seq, event_json, state_json, recorded_at) = event_row?;
                events.push(StoredEvent {
                    seq: seq as u64,
                    event: serde_json::from_str(&event_json)?,
                    state: serde_json::from_str(&state_json)?,
                    recorded_at_unix: recorded_at as u64,
                });
            }

            out.push(StoredSwap { contract, events });
        }

        Ok(out)
    }

    fn mark_terminal(&self, swap_hash: SwapHash, outcome: SwapOutcome) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute(
            r#"
INSERT INTO swap_outcomes (swap_hash, outcome, recorded_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(swap_hash) DO NOTHING
"#,
            params![swap_hash.to_string(), outcome.as_str(), now_unix_i64()],
        )?;
        Ok(())
    }

    fn outcome(&self, swap_hash: SwapHash) -> Result<Option<SwapOutcome>, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let tag: Option<String> = conn
            .query_row(
                "SELECT outcome FROM swap_outcomes WHERE swap_hash = ?1",
                params![swap_hash.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tag.and_then(|t| SwapOutcome::parse(&t)))
    }

    fn gc_terminal(&self, now_unix: u64, retention_secs: u64) -> Result<usize, StoreError> {
        let cutoff = now_unix.saturating_sub(retention_secs);
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;

        let collected = tx.execute(
            r#"
DELETE FROM swap_contracts
WHERE swap_hash IN (SELECT swap_hash FROM swap_outcomes WHERE recorded_at < ?1)
"#,
            params![i64::try_from(cutoff).unwrap_or(i64::MAX)],
        )?;
        tx.execute(
            r#"
DELETE FROM swap_events
WHERE swap_hash IN (SELECT swap_hash FROM swap_outcomes WHERE recorded_at < ?1)
"#,
            params![i64::try_from(cutoff).unwrap_or(i64::MAX)],
        )?;
        tx.commit()?;

        Ok(collected)
    }
}

fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS swap_contracts (
  swap_hash TEXT PRIMARY KEY,
  direction TEXT NOT NULL,
  amount_sat INTEGER NOT NULL,
  created_at INTEGER NOT NULL,
  contract_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS swap_events (
  swap_hash TEXT NOT NULL,
  seq INTEGER NOT NULL,
  event_json TEXT NOT NULL,
  state_json TEXT NOT NULL,
  recorded_at INTEGER NOT NULL,
  PRIMARY KEY (swap_hash, seq)
);

CREATE TABLE IF NOT EXISTS swap_outcomes (
  swap_hash TEXT PRIMARY KEY,
  outcome TEXT NOT NULL,
  recorded_at INTEGER NOT NULL
);
"#,
    )
}

fn now_unix_i64() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs() as i64
}
