// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable local record of every session (local or remote-observed),
//! registered people, remote-command dedup, and stream checkpoints.
//!
//! Backed by an embedded SQLite file under the daemon state directory.
//! Schema migrations are versioned and check-and-apply: the stored
//! `user_version` names the number of applied migrations and re-running
//! the list is a no-op.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::Fault;
use crate::wire::now_ms;

/// Longest retained output summary, in bytes.
const SUMMARY_CAP: usize = 4096;

/// Ordered migration list. `user_version` records how many have been
/// applied; each step must be safe to re-execute.
const MIGRATIONS: &[&str] = &[
    // 1: base schema
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        computer TEXT NOT NULL,
        project_path TEXT NOT NULL,
        agent TEXT NOT NULL,
        thinking_mode TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        role TEXT NOT NULL,
        initiator_session_id TEXT,
        human_identity TEXT,
        origin_adapter TEXT NOT NULL,
        title TEXT NOT NULL DEFAULT '',
        adapter_meta TEXT NOT NULL DEFAULT '{}',
        last_output_summary TEXT,
        created_at INTEGER NOT NULL,
        last_activity_at INTEGER NOT NULL,
        terminated_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_sessions_computer ON sessions(computer);
    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
    "#,
    // 2: people registry for identity routing
    r#"
    CREATE TABLE IF NOT EXISTS people (
        email TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        adapter_user_ids TEXT NOT NULL DEFAULT '{}',
        home TEXT NOT NULL,
        profile TEXT NOT NULL DEFAULT 'default'
    );
    "#,
    // 3: cross-node command dedup and observer checkpoints
    r#"
    CREATE TABLE IF NOT EXISTS commands_seen (
        correlation_id TEXT PRIMARY KEY,
        reply TEXT NOT NULL,
        applied_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS checkpoints (
        stream_key TEXT PRIMARY KEY,
        position INTEGER NOT NULL
    );
    "#,
];

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Headless,
    Terminated,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Headless => "headless",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "headless" => Some(Self::Headless),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

/// Who drives the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Human,
    AiOrigin,
    AiWorker,
}

impl SessionRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::AiOrigin => "ai_origin",
            Self::AiWorker => "ai_worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "ai_origin" => Some(Self::AiOrigin),
            "ai_worker" => Some(Self::AiWorker),
            _ => None,
        }
    }
}

/// Whether a status transition is allowed. Transitions are monotone
/// through starting → running → (headless ↔ running) → terminated;
/// `terminated` is absorbing.
pub fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    match (from, to) {
        (a, b) if a == b => true,
        (Starting, Running) | (Starting, Terminated) => true,
        (Running, Headless) | (Running, Terminated) => true,
        (Headless, Running) | (Headless, Terminated) => true,
        _ => false,
    }
}

/// One row of the sessions table.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub computer: String,
    pub project_path: String,
    pub agent: String,
    pub thinking_mode: String,
    pub status: SessionStatus,
    pub role: SessionRole,
    pub initiator_session_id: Option<String>,
    pub human_identity: Option<String>,
    pub origin_adapter: String,
    pub title: String,
    /// Opaque blobs keyed by adapter name.
    pub adapter_meta: serde_json::Value,
    pub last_output_summary: Option<String>,
    pub created_at: u64,
    pub last_activity_at: u64,
    pub terminated_at: Option<u64>,
}

/// Reduced view served to adapters and the tool surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub computer: String,
    pub project_path: String,
    pub agent: String,
    pub thinking_mode: String,
    pub status: SessionStatus,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_output_summary: Option<String>,
    pub last_activity_at: u64,
}

impl From<&SessionRecord> for SessionSummary {
    fn from(r: &SessionRecord) -> Self {
        Self {
            session_id: r.session_id.clone(),
            computer: r.computer.clone(),
            project_path: r.project_path.clone(),
            agent: r.agent.clone(),
            thinking_mode: r.thinking_mode.clone(),
            status: r.status,
            title: r.title.clone(),
            last_output_summary: r.last_output_summary.clone(),
            last_activity_at: r.last_activity_at,
        }
    }
}

/// Query filter for session listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

/// A registered person bound to a home path and an agent profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub email: String,
    pub name: String,
    /// Per-adapter user ids, keyed by adapter name.
    pub adapter_user_ids: serde_json::Value,
    pub home: String,
    pub profile: String,
}

fn db_err(e: rusqlite::Error) -> Fault {
    Fault::invariant(format!("session store: {e}"))
}

fn parse_err(what: &str, value: &str) -> Fault {
    Fault::invariant(format!("session store: bad {what} value '{value}'"))
}

/// The store. All writes are atomic per row; cross-row invariants (the
/// lifecycle transition check) run inside one locked call.
pub struct SessionStore {
    conn: Mutex<Connection>,
    local_computer: String,
}

impl SessionStore {
    pub fn open(path: &Path, local_computer: &str) -> Result<Self, Fault> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::from_conn(conn, local_computer)
    }

    pub fn open_in_memory(local_computer: &str) -> Result<Self, Fault> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::from_conn(conn, local_computer)
    }

    fn from_conn(conn: Connection, local_computer: &str) -> Result<Self, Fault> {
        apply_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn), local_computer: local_computer.to_owned() })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, Fault> {
        self.conn.lock().map_err(|_| Fault::invariant("session store lock poisoned"))
    }

    pub fn local_computer(&self) -> &str {
        &self.local_computer
    }

    // -- sessions -----------------------------------------------------------

    pub fn insert_session(&self, record: &SessionRecord) -> Result<(), Fault> {
        let conn = self.lock()?;
        let meta = record.adapter_meta.to_string();
        let inserted = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO sessions (
                    session_id, computer, project_path, agent, thinking_mode,
                    status, role, initiator_session_id, human_identity,
                    origin_adapter, title, adapter_meta, last_output_summary,
                    created_at, last_activity_at, terminated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                "#,
                params![
                    record.session_id,
                    record.computer,
                    record.project_path,
                    record.agent,
                    record.thinking_mode,
                    record.status.as_str(),
                    record.role.as_str(),
                    record.initiator_session_id,
                    record.human_identity,
                    record.origin_adapter,
                    record.title,
                    meta,
                    record.last_output_summary,
                    record.created_at,
                    record.last_activity_at,
                    record.terminated_at,
                ],
            )
            .map_err(db_err)?;
        if inserted == 0 {
            return Err(Fault::conflict(format!("session {} already exists", record.session_id)));
        }
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<SessionRecord, Fault> {
        let conn = self.lock()?;
        get_locked(&conn, session_id)
    }

    /// Sessions owned by this node.
    pub fn list_local(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, Fault> {
        let mut f = filter.clone();
        f.computer = Some(self.local_computer.clone());
        self.list(&f)
    }

    /// Local sessions plus cached remote mirrors.
    pub fn list_all(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, Fault> {
        self.list(filter)
    }

    fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>, Fault> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT session_id, computer, project_path, agent, thinking_mode, status, role, \
             initiator_session_id, human_identity, origin_adapter, title, adapter_meta, \
             last_output_summary, created_at, last_activity_at, terminated_at FROM sessions",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(ref computer) = filter.computer {
            clauses.push("computer = ?");
            binds.push(computer.clone());
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            binds.push(status.as_str().to_owned());
        }
        if let Some(ref project) = filter.project_path {
            clauses.push("project_path = ?");
            binds.push(project.clone());
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(binds.iter()), row_to_session)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter().collect()
    }

    /// Apply a lifecycle transition. `Conflict` when the move is not
    /// allowed from the current status; sets `terminated_at` on the way
    /// into `terminated`.
    pub fn update_status(&self, session_id: &str, to: SessionStatus) -> Result<(), Fault> {
        let conn = self.lock()?;
        let current = get_locked(&conn, session_id)?;
        if !transition_allowed(current.status, to) {
            return Err(Fault::conflict(format!(
                "session {session_id}: {} -> {} not allowed",
                current.status.as_str(),
                to.as_str()
            )));
        }
        if current.status == to {
            return Ok(());
        }
        let terminated_at = (to == SessionStatus::Terminated).then(now_ms);
        conn.execute(
            "UPDATE sessions SET status = ?1, terminated_at = COALESCE(?2, terminated_at) \
             WHERE session_id = ?3",
            params![to.as_str(), terminated_at, session_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn update_activity(&self, session_id: &str, at: u64) -> Result<(), Fault> {
        let conn = self.lock()?;
        let current = get_locked(&conn, session_id)?;
        if current.status == SessionStatus::Terminated {
            return Ok(());
        }
        conn.execute(
            "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?1) WHERE session_id = ?2",
            params![at, session_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Merge one adapter's metadata blob into the session record.
    pub fn update_metadata(
        &self,
        session_id: &str,
        adapter: &str,
        value: serde_json::Value,
    ) -> Result<(), Fault> {
        let conn = self.lock()?;
        let current = get_locked(&conn, session_id)?;
        if current.status == SessionStatus::Terminated {
            return Err(Fault::conflict(format!("session {session_id} is terminated")));
        }
        let mut meta = current.adapter_meta;
        if !meta.is_object() {
            meta = serde_json::json!({});
        }
        if let Some(map) = meta.as_object_mut() {
            map.insert(adapter.to_owned(), value);
        }
        conn.execute(
            "UPDATE sessions SET adapter_meta = ?1 WHERE session_id = ?2",
            params![meta.to_string(), session_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Retain only the latest output summary, bounded in size.
    pub fn append_output_summary(
        &self,
        session_id: &str,
        text: &str,
        at: u64,
    ) -> Result<(), Fault> {
        let conn = self.lock()?;
        let current = get_locked(&conn, session_id)?;
        if current.status == SessionStatus::Terminated {
            return Ok(());
        }
        let mut text = text.to_owned();
        if text.len() > SUMMARY_CAP {
            let cut = text
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= SUMMARY_CAP)
                .last()
                .unwrap_or(0);
            text.truncate(cut);
        }
        conn.execute(
            "UPDATE sessions SET last_output_summary = ?1, \
             last_activity_at = MAX(last_activity_at, ?2) WHERE session_id = ?3",
            params![text, at, session_id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Create or refresh a mirror record for a session observed on a
    /// remote node.
    pub fn upsert_remote_session(&self, summary: &SessionSummary) -> Result<(), Fault> {
        if summary.computer == self.local_computer {
            return Err(Fault::invariant("remote upsert for a local session"));
        }
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO sessions (
                session_id, computer, project_path, agent, thinking_mode, status,
                role, origin_adapter, title, last_output_summary,
                created_at, last_activity_at
            ) VALUES (?1,?2,?3,?4,?5,?6,'ai_worker','stream',?7,?8,?9,?9)
            ON CONFLICT(session_id) DO UPDATE SET
                status = ?6,
                title = ?7,
                last_output_summary = COALESCE(?8, last_output_summary),
                last_activity_at = MAX(last_activity_at, ?9)
            "#,
            params![
                summary.session_id,
                summary.computer,
                summary.project_path,
                summary.agent,
                summary.thinking_mode,
                summary.status.as_str(),
                summary.title,
                summary.last_output_summary,
                summary.last_activity_at,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    // -- people -------------------------------------------------------------

    pub fn upsert_person(&self, person: &Person) -> Result<(), Fault> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO people (email, name, adapter_user_ids, home, profile)
            VALUES (?1,?2,?3,?4,?5)
            ON CONFLICT(email) DO UPDATE SET
                name = ?2, adapter_user_ids = ?3, home = ?4, profile = ?5
            "#,
            params![
                person.email,
                person.name,
                person.adapter_user_ids.to_string(),
                person.home,
                person.profile,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn person_by_email(&self, email: &str) -> Result<Option<Person>, Fault> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT email, name, adapter_user_ids, home, profile FROM people WHERE email = ?1",
            [email],
            row_to_person,
        )
        .optional()
        .map_err(db_err)?
        .transpose()
    }

    /// Look up the person bound to an adapter-scoped user id.
    pub fn person_by_adapter_id(
        &self,
        adapter: &str,
        user_id: &str,
    ) -> Result<Option<Person>, Fault> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT email, name, adapter_user_ids, home, profile FROM people")
            .map_err(db_err)?;
        let people = stmt
            .query_map([], row_to_person)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        for person in people {
            let person = person?;
            if person.adapter_user_ids.get(adapter).and_then(|v| v.as_str()) == Some(user_id) {
                return Ok(Some(person));
            }
        }
        Ok(None)
    }

    // -- command dedup ------------------------------------------------------

    /// The recorded reply for an already-applied command, if any.
    pub fn seen_command(&self, correlation_id: &str) -> Result<Option<String>, Fault> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT reply FROM commands_seen WHERE correlation_id = ?1",
            [correlation_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Record a command's reply so a replay is a no-op with the same result.
    pub fn record_command(&self, correlation_id: &str, reply: &str) -> Result<(), Fault> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO commands_seen (correlation_id, reply, applied_at) \
             VALUES (?1, ?2, ?3)",
            params![correlation_id, reply, now_ms()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Drop dedup entries older than `max_age_ms`.
    pub fn prune_commands(&self, max_age_ms: u64) -> Result<usize, Fault> {
        let conn = self.lock()?;
        let cutoff = now_ms().saturating_sub(max_age_ms);
        conn.execute("DELETE FROM commands_seen WHERE applied_at < ?1", [cutoff]).map_err(db_err)
    }

    // -- checkpoints --------------------------------------------------------

    pub fn checkpoint(&self, stream_key: &str) -> Result<u64, Fault> {
        let conn = self.lock()?;
        let pos: Option<u64> = conn
            .query_row("SELECT position FROM checkpoints WHERE stream_key = ?1", [stream_key], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        Ok(pos.unwrap_or(0))
    }

    pub fn set_checkpoint(&self, stream_key: &str, position: u64) -> Result<(), Fault> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO checkpoints (stream_key, position) VALUES (?1, ?2) \
             ON CONFLICT(stream_key) DO UPDATE SET position = ?2",
            params![stream_key, position],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

fn get_locked(conn: &Connection, session_id: &str) -> Result<SessionRecord, Fault> {
    conn.query_row(
        "SELECT session_id, computer, project_path, agent, thinking_mode, status, role, \
         initiator_session_id, human_identity, origin_adapter, title, adapter_meta, \
         last_output_summary, created_at, last_activity_at, terminated_at \
         FROM sessions WHERE session_id = ?1",
        [session_id],
        row_to_session,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Fault::not_found(format!("no session {session_id}")))?
}

type SessionRow = Result<SessionRecord, Fault>;

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let status_raw: String = row.get(5)?;
    let role_raw: String = row.get(6)?;
    let meta_raw: String = row.get(11)?;
    Ok((|| {
        Ok(SessionRecord {
            session_id: row.get(0).map_err(db_err)?,
            computer: row.get(1).map_err(db_err)?,
            project_path: row.get(2).map_err(db_err)?,
            agent: row.get(3).map_err(db_err)?,
            thinking_mode: row.get(4).map_err(db_err)?,
            status: SessionStatus::parse(&status_raw)
                .ok_or_else(|| parse_err("status", &status_raw))?,
            role: SessionRole::parse(&role_raw).ok_or_else(|| parse_err("role", &role_raw))?,
            initiator_session_id: row.get(7).map_err(db_err)?,
            human_identity: row.get(8).map_err(db_err)?,
            origin_adapter: row.get(9).map_err(db_err)?,
            title: row.get(10).map_err(db_err)?,
            adapter_meta: serde_json::from_str(&meta_raw)
                .map_err(|_| parse_err("adapter_meta", &meta_raw))?,
            last_output_summary: row.get(12).map_err(db_err)?,
            created_at: row.get(13).map_err(db_err)?,
            last_activity_at: row.get(14).map_err(db_err)?,
            terminated_at: row.get(15).map_err(db_err)?,
        })
    })())
}

type PersonRow = Result<Person, Fault>;

fn row_to_person(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersonRow> {
    let ids_raw: String = row.get(2)?;
    Ok((|| {
        Ok(Person {
            email: row.get(0).map_err(db_err)?,
            name: row.get(1).map_err(db_err)?,
            adapter_user_ids: serde_json::from_str(&ids_raw)
                .map_err(|_| parse_err("adapter_user_ids", &ids_raw))?,
            home: row.get(3).map_err(db_err)?,
            profile: row.get(4).map_err(db_err)?,
        })
    })())
}

fn apply_migrations(conn: &Connection) -> Result<(), Fault> {
    let current: i64 =
        conn.query_row("PRAGMA user_version", [], |row| row.get(0)).map_err(db_err)?;
    let current = current.max(0) as usize;
    for (i, sql) in MIGRATIONS.iter().enumerate().skip(current) {
        conn.execute_batch(sql).map_err(db_err)?;
        // SQLite does not support bound params in PRAGMA.
        conn.execute_batch(&format!("PRAGMA user_version = {}", i + 1)).map_err(db_err)?;
    }
    Ok(())
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
