use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use streamverse_core::voucher::unix_now;

// ---------------------------------------------------------------------------
// Console event type
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize)]
pub struct ConsoleEvent {
    pub id: u64,
    /// Unix seconds.
    pub timestamp: u64,
    pub role: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

/// Append-only event log on disk (SQLite). Backs the history API.
pub struct EventLog {
    conn: Mutex<Connection>,
}

impl EventLog {
    pub fn open(storage_dir: &Path) -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open(storage_dir.join("events.db"))?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp  INTEGER NOT NULL,
                role       TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data       TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn append(&self, event: &ConsoleEvent) -> Result<u64, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO events (timestamp, role, event_type, data) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                event.timestamp as i64,
                event.role,
                event.event_type,
                serde_json::to_string(&event.data).unwrap_or_default(),
            ],
        )?;
        Ok(conn.last_insert_rowid() as u64)
    }

    /// Events after `since_id`, oldest first, optionally for one role.
    pub fn query(
        &self,
        since_id: u64,
        limit: u32,
        role: Option<&str>,
    ) -> Result<Vec<ConsoleEvent>, rusqlite::Error> {
        let limit = limit.min(1000);
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, role, event_type, data FROM events
             WHERE id > ?1 AND (?2 IS NULL OR role = ?2)
             ORDER BY id ASC LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![since_id as i64, role, limit as i64],
            |row| {
                let data: String = row.get(4)?;
                Ok(ConsoleEvent {
                    id: row.get::<_, i64>(0)? as u64,
                    timestamp: row.get::<_, i64>(1)? as u64,
                    role: row.get(2)?,
                    event_type: row.get(3)?,
                    data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                })
            },
        )?;
        rows.collect()
    }
}

/// Single path for emitting console events: persist to the log (if any),
/// trace, then broadcast to live subscribers.
#[derive(Clone)]
pub struct ConsoleEmitter {
    tx: broadcast::Sender<ConsoleEvent>,
    log: Option<Arc<EventLog>>,
}

impl ConsoleEmitter {
    pub fn new(tx: broadcast::Sender<ConsoleEvent>, log: Option<Arc<EventLog>>) -> Self {
        Self { tx, log }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.tx.subscribe()
    }

    pub fn event_log(&self) -> Option<Arc<EventLog>> {
        self.log.clone()
    }

    pub fn emit(&self, role: &str, event_type: &str, data: serde_json::Value) {
        let mut event = ConsoleEvent {
            id: 0,
            timestamp: unix_now(),
            role: role.into(),
            event_type: event_type.into(),
            data,
        };
        if let Some(ref log) = self.log {
            match log.append(&event) {
                Ok(id) => event.id = id,
                Err(e) => warn!("event log append failed: {e}"),
            }
        }
        info!(role = %event.role, event = %event.event_type, data = %event.data);
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_filters_and_pages() {
        let log = Arc::new(EventLog::in_memory().unwrap());
        let (tx, _) = broadcast::channel(16);
        let emitter = ConsoleEmitter::new(tx, Some(log.clone()));

        emitter.emit("gate", "PAYMENT_ACCEPTED", serde_json::json!({"index": 0}));
        emitter.emit("catalog", "ASSET_REGISTERED", serde_json::json!({}));
        emitter.emit("gate", "PAYMENT_ACCEPTED", serde_json::json!({"index": 1}));

        let all = log.query(0, 100, None).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, 1);

        let gate = log.query(0, 100, Some("gate")).unwrap();
        assert_eq!(gate.len(), 2);
        assert_eq!(gate[1].data["index"], 1);

        let after = log.query(2, 100, None).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, 3);

        assert_eq!(log.query(0, 1, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_emit_broadcasts_with_log_id() {
        let log = Arc::new(EventLog::in_memory().unwrap());
        let (tx, _) = broadcast::channel(16);
        let emitter = ConsoleEmitter::new(tx, Some(log));
        let mut rx = emitter.subscribe();
        emitter.emit("gate", "CHUNK_SERVED", serde_json::json!({"bytes": 10}));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, 1);
        assert_eq!(event.event_type, "CHUNK_SERVED");
    }
}
