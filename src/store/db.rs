use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::errors::{BridgeError, Result};

use super::models::{AuditEntry, Direction, Friend, Permission, RateLimitDecision, Session};

/// Async-safe handle to the metadata store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads. Each closure runs under the mutex, which gives every
/// operation serializable semantics.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store
                .lock()
                .map_err(|e| BridgeError::Other(anyhow!("store lock poisoned: {}", e)))?;
            f(&guard)
        })
        .await
        .map_err(|e| BridgeError::Other(anyhow!("store task panicked: {}", e)))?
    }
}

/// The embedded metadata store: friends, sessions, audit log, rate counters.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path` and run the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BridgeError::Other(anyhow!("cannot create db directory {:?}: {}", parent, e))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::from_conn(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    /// Default on-disk location.
    pub fn default_path() -> PathBuf {
        PathBuf::from("data/bridge.db")
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS friends (
                wxid           TEXT PRIMARY KEY,
                nickname       TEXT,
                remark_name    TEXT,
                permission     TEXT NOT NULL DEFAULT 'normal'
                               CHECK(permission IN ('admin','trusted','normal','blocked')),
                added_at       DATETIME DEFAULT CURRENT_TIMESTAMP,
                added_by       TEXT,
                notes          TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id             TEXT PRIMARY KEY,
                wxid           TEXT NOT NULL,
                claude_session TEXT,
                created_at     DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_active    DATETIME DEFAULT CURRENT_TIMESTAMP,
                message_count  INTEGER DEFAULT 0,
                FOREIGN KEY (wxid) REFERENCES friends(wxid)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                wxid           TEXT NOT NULL,
                nickname       TEXT,
                direction      TEXT NOT NULL CHECK(direction IN ('in','out')),
                message        TEXT,
                claude_session TEXT,
                timestamp      DATETIME DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS rate_limits (
                wxid           TEXT NOT NULL,
                window_start   DATETIME NOT NULL,
                request_count  INTEGER DEFAULT 1,
                PRIMARY KEY (wxid, window_start)
            );

            CREATE INDEX IF NOT EXISTS idx_audit_wxid ON audit_log(wxid);
            CREATE INDEX IF NOT EXISTS idx_audit_ts   ON audit_log(timestamp);
            CREATE INDEX IF NOT EXISTS idx_sessions_wxid ON sessions(wxid);
            CREATE INDEX IF NOT EXISTS idx_rate_wxid  ON rate_limits(wxid);
            ",
        )?;
        Ok(())
    }

    fn row_to_friend(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friend> {
        let permission: String = row.get(3)?;
        Ok(Friend {
            wxid: row.get(0)?,
            nickname: row.get(1)?,
            remark_name: row.get(2)?,
            permission: Permission::parse_lenient(&permission),
            added_at: row.get(4)?,
            added_by: row.get(5)?,
            notes: row.get(6)?,
        })
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
        Ok(Session {
            id: row.get(0)?,
            wxid: row.get(1)?,
            claude_session: row.get(2)?,
            created_at: row.get(3)?,
            last_active: row.get(4)?,
            message_count: row.get(5)?,
        })
    }

    fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
        Ok(AuditEntry {
            id: row.get(0)?,
            wxid: row.get(1)?,
            nickname: row.get(2)?,
            direction: row.get(3)?,
            message: row.get(4)?,
            claude_session: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    // ---- friends ----

    pub fn friend_get(&self, wxid: &str) -> Result<Option<Friend>> {
        let mut stmt = self.conn.prepare(
            "SELECT wxid, nickname, remark_name, permission, added_at, added_by, notes
             FROM friends WHERE wxid = ?",
        )?;
        Ok(stmt
            .query_row(params![wxid], Self::row_to_friend)
            .optional()?)
    }

    /// Insert or update a friend. Absent fields never clobber existing
    /// values; on first insert a missing permission defaults to `normal`.
    pub fn friend_upsert(
        &self,
        wxid: &str,
        nickname: Option<&str>,
        remark_name: Option<&str>,
        permission: Option<Permission>,
        added_by: Option<&str>,
        notes: Option<&str>,
    ) -> Result<()> {
        let insert_perm = permission.unwrap_or(Permission::Normal).as_str();
        let update_perm = permission.map(|p| p.as_str());
        self.conn.execute(
            "INSERT INTO friends (wxid, nickname, remark_name, permission, added_by, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(wxid) DO UPDATE SET
               nickname    = COALESCE(excluded.nickname, friends.nickname),
               remark_name = COALESCE(excluded.remark_name, friends.remark_name),
               permission  = COALESCE(?7, friends.permission),
               notes       = COALESCE(excluded.notes, friends.notes)",
            params![wxid, nickname, remark_name, insert_perm, added_by, notes, update_perm],
        )?;
        Ok(())
    }

    pub fn friend_get_permission(&self, wxid: &str) -> Result<Option<Permission>> {
        let mut stmt = self
            .conn
            .prepare("SELECT permission FROM friends WHERE wxid = ?")?;
        let perm: Option<String> = stmt
            .query_row(params![wxid], |row| row.get(0))
            .optional()?;
        Ok(perm.map(|p| Permission::parse_lenient(&p)))
    }

    pub fn friend_set_permission(&self, wxid: &str, permission: Permission) -> Result<()> {
        self.conn.execute(
            "UPDATE friends SET permission = ? WHERE wxid = ?",
            params![permission.as_str(), wxid],
        )?;
        Ok(())
    }

    pub fn friend_list_all(&self) -> Result<Vec<Friend>> {
        let mut stmt = self.conn.prepare(
            "SELECT wxid, nickname, remark_name, permission, added_at, added_by, notes
             FROM friends ORDER BY added_at DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_friend)?;
        let mut friends = Vec::new();
        for r in rows {
            friends.push(r?);
        }
        Ok(friends)
    }

    pub fn friend_list_by_permission(&self, permission: Permission) -> Result<Vec<Friend>> {
        let mut stmt = self.conn.prepare(
            "SELECT wxid, nickname, remark_name, permission, added_at, added_by, notes
             FROM friends WHERE permission = ?",
        )?;
        let rows = stmt.query_map(params![permission.as_str()], Self::row_to_friend)?;
        let mut friends = Vec::new();
        for r in rows {
            friends.push(r?);
        }
        Ok(friends)
    }

    pub fn friend_remove(&self, wxid: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM friends WHERE wxid = ?", params![wxid])?;
        Ok(())
    }

    /// Substring search against nickname or remark name. The query is
    /// treated as a literal: LIKE wildcards in it are escaped.
    pub fn friend_find_by_nickname(&self, query: &str) -> Result<Vec<Friend>> {
        let pattern = format!("%{}%", escape_like(query));
        let mut stmt = self.conn.prepare(
            "SELECT wxid, nickname, remark_name, permission, added_at, added_by, notes
             FROM friends
             WHERE nickname LIKE ?1 ESCAPE '\\' OR remark_name LIKE ?1 ESCAPE '\\'",
        )?;
        let rows = stmt.query_map(params![pattern], Self::row_to_friend)?;
        let mut friends = Vec::new();
        for r in rows {
            friends.push(r?);
        }
        Ok(friends)
    }

    // ---- sessions ----

    /// The row with the latest `last_active` for this wxid.
    pub fn session_get_active(&self, wxid: &str) -> Result<Option<Session>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, wxid, claude_session, created_at, last_active, message_count
             FROM sessions WHERE wxid = ?
             ORDER BY last_active DESC, rowid DESC LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![wxid], Self::row_to_session)
            .optional()?)
    }

    pub fn session_create(
        &self,
        id: &str,
        wxid: &str,
        claude_session: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (id, wxid, claude_session) VALUES (?, ?, ?)",
            params![id, wxid, claude_session],
        )?;
        Ok(())
    }

    /// Refresh `last_active` and bump `message_count` in one statement.
    pub fn session_touch(&self, id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions
             SET last_active = CURRENT_TIMESTAMP, message_count = message_count + 1
             WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    pub fn session_set_claude_session(&self, id: &str, claude_session: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions SET claude_session = ? WHERE id = ?",
            params![claude_session, id],
        )?;
        Ok(())
    }

    pub fn session_clear_user(&self, wxid: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sessions WHERE wxid = ?", params![wxid])?;
        Ok(())
    }

    /// Delete sessions idle for longer than `expire_minutes`. Returns the
    /// number of rows removed.
    pub fn session_clean_expired(&self, expire_minutes: i64) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM sessions
             WHERE last_active <= datetime('now', '-' || ? || ' minutes')",
            params![expire_minutes],
        )?;
        Ok(deleted)
    }

    // ---- audit log ----

    pub fn audit_log(
        &self,
        wxid: &str,
        nickname: Option<&str>,
        direction: Direction,
        message: Option<&str>,
        claude_session: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log (wxid, nickname, direction, message, claude_session)
             VALUES (?, ?, ?, ?, ?)",
            params![wxid, nickname, direction.as_str(), message, claude_session],
        )?;
        Ok(())
    }

    pub fn audit_get_by_user(&self, wxid: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, wxid, nickname, direction, message, claude_session, timestamp
             FROM audit_log WHERE wxid = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![wxid, limit], Self::row_to_audit)?;
        let mut entries = Vec::new();
        for r in rows {
            entries.push(r?);
        }
        Ok(entries)
    }

    pub fn audit_get_recent(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, wxid, nickname, direction, message, claude_session, timestamp
             FROM audit_log ORDER BY timestamp DESC, id DESC LIMIT ?",
        )?;
        let rows = stmt.query_map(params![limit], Self::row_to_audit)?;
        let mut entries = Vec::new();
        for r in rows {
            entries.push(r?);
        }
        Ok(entries)
    }

    // ---- rate limiting ----

    /// Check the minute and day windows for `wxid` and, if both admit the
    /// request, record it. The pre-increment count is compared with `>=`, so
    /// a limit of zero denies every request.
    pub fn rate_check_and_increment(
        &self,
        wxid: &str,
        max_per_minute: i64,
        max_per_day: i64,
    ) -> Result<RateLimitDecision> {
        let now = Utc::now();
        let minute_key = now.format("%Y-%m-%dT%H:%M:00").to_string();
        let day_key = now.format("%Y-%m-%d").to_string();

        let minute_count: i64 = self
            .conn
            .query_row(
                "SELECT request_count FROM rate_limits WHERE wxid = ? AND window_start = ?",
                params![wxid, minute_key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if minute_count >= max_per_minute {
            return Ok(RateLimitDecision {
                allowed: false,
                reason: Some("Too many requests this minute, please slow down".into()),
            });
        }

        let day_total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(request_count), 0) FROM rate_limits
             WHERE wxid = ? AND window_start >= ?",
            params![wxid, day_key],
            |row| row.get(0),
        )?;

        if day_total >= max_per_day {
            return Ok(RateLimitDecision {
                allowed: false,
                reason: Some("Daily request quota exhausted, try again tomorrow".into()),
            });
        }

        self.conn.execute(
            "INSERT INTO rate_limits (wxid, window_start, request_count)
             VALUES (?, ?, 1)
             ON CONFLICT(wxid, window_start) DO UPDATE SET
               request_count = request_count + 1",
            params![wxid, minute_key],
        )?;

        Ok(RateLimitDecision {
            allowed: true,
            reason: None,
        })
    }

    /// Drop counters older than one day. Returns the number removed.
    pub fn rate_cleanup(&self) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM rate_limits WHERE window_start < datetime('now', '-1 day')",
            [],
        )?;
        Ok(deleted)
    }
}

/// Escape LIKE wildcards so user-supplied search text matches literally.
fn escape_like(q: &str) -> String {
    let mut out = String::with_capacity(q.len());
    for c in q.chars() {
        if c == '\\' || c == '%' || c == '_' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        Store::open_in_memory().expect("failed to open in-memory store")
    }

    #[test]
    fn friend_upsert_and_get() {
        let store = test_store();
        store
            .friend_upsert("wx_001", Some("Alice"), None, Some(Permission::Admin), None, None)
            .unwrap();
        let f = store.friend_get("wx_001").unwrap().unwrap();
        assert_eq!(f.wxid, "wx_001");
        assert_eq!(f.nickname.as_deref(), Some("Alice"));
        assert_eq!(f.permission, Permission::Admin);
    }

    #[test]
    fn friend_insert_defaults_to_normal() {
        let store = test_store();
        store
            .friend_upsert("wx_002", Some("Bob"), None, None, None, None)
            .unwrap();
        assert_eq!(
            store.friend_get_permission("wx_002").unwrap(),
            Some(Permission::Normal)
        );
    }

    #[test]
    fn friend_set_permission_updates() {
        let store = test_store();
        store
            .friend_upsert("wx_003", Some("Carol"), None, None, None, None)
            .unwrap();
        store
            .friend_set_permission("wx_003", Permission::Blocked)
            .unwrap();
        assert_eq!(
            store.friend_get_permission("wx_003").unwrap(),
            Some(Permission::Blocked)
        );
    }

    #[test]
    fn friend_permission_missing_row_is_none() {
        let store = test_store();
        assert!(store.friend_get_permission("ghost").unwrap().is_none());
    }

    #[test]
    fn friend_upsert_absent_fields_do_not_clobber() {
        let store = test_store();
        store
            .friend_upsert(
                "wx_up",
                Some("Original"),
                Some("Remark"),
                Some(Permission::Trusted),
                Some("admin_wx"),
                Some("notes"),
            )
            .unwrap();
        // Second upsert supplies only a nickname.
        store
            .friend_upsert("wx_up", Some("Updated"), None, None, None, None)
            .unwrap();

        let f = store.friend_get("wx_up").unwrap().unwrap();
        assert_eq!(f.nickname.as_deref(), Some("Updated"));
        assert_eq!(f.remark_name.as_deref(), Some("Remark"));
        assert_eq!(f.permission, Permission::Trusted);
        assert_eq!(f.notes.as_deref(), Some("notes"));
    }

    #[test]
    fn friend_upsert_field_by_field_accumulates() {
        let store = test_store();
        store
            .friend_upsert("wx_acc", Some("N1"), None, None, None, None)
            .unwrap();
        store
            .friend_upsert("wx_acc", None, Some("R1"), None, None, None)
            .unwrap();
        let f = store.friend_get("wx_acc").unwrap().unwrap();
        assert_eq!(f.nickname.as_deref(), Some("N1"));
        assert_eq!(f.remark_name.as_deref(), Some("R1"));
    }

    #[test]
    fn friend_list_and_remove() {
        let store = test_store();
        store
            .friend_upsert("wx_a", Some("A"), None, Some(Permission::Admin), None, None)
            .unwrap();
        store
            .friend_upsert("wx_b", Some("B"), None, None, None, None)
            .unwrap();
        assert_eq!(store.friend_list_all().unwrap().len(), 2);
        assert_eq!(
            store
                .friend_list_by_permission(Permission::Admin)
                .unwrap()
                .len(),
            1
        );
        store.friend_remove("wx_a").unwrap();
        assert_eq!(store.friend_list_all().unwrap().len(), 1);
    }

    #[test]
    fn friend_search_matches_nickname_and_remark() {
        let store = test_store();
        store
            .friend_upsert("wx_c", Some("Charlie"), Some("Chuck"), None, None, None)
            .unwrap();
        assert_eq!(store.friend_find_by_nickname("harl").unwrap().len(), 1);
        assert_eq!(store.friend_find_by_nickname("Chuck").unwrap().len(), 1);
        assert_eq!(store.friend_find_by_nickname("zzz").unwrap().len(), 0);
    }

    #[test]
    fn friend_search_wildcards_are_literal() {
        let store = test_store();
        store
            .friend_upsert("wx_pct", Some("100%_done"), None, None, None, None)
            .unwrap();
        store
            .friend_upsert("wx_other", Some("100x_done"), None, None, None, None)
            .unwrap();

        // "%" must only match the friend whose name really contains it.
        let matches = store.friend_find_by_nickname("100%").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].wxid, "wx_pct");

        // "_" likewise must not act as a single-char wildcard.
        let matches = store.friend_find_by_nickname("%_d").unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].wxid, "wx_pct");
    }

    #[test]
    fn friend_search_empty_query_matches_all() {
        let store = test_store();
        store
            .friend_upsert("wx_e1", Some("Alice"), None, None, None, None)
            .unwrap();
        store
            .friend_upsert("wx_e2", Some("Bob"), None, None, None, None)
            .unwrap();
        assert_eq!(store.friend_find_by_nickname("").unwrap().len(), 2);
    }

    #[test]
    fn friend_unicode_names_roundtrip() {
        let store = test_store();
        store
            .friend_upsert("wxid_中文", Some("中文用户"), None, None, None, None)
            .unwrap();
        let f = store.friend_get("wxid_中文").unwrap().unwrap();
        assert_eq!(f.nickname.as_deref(), Some("中文用户"));
    }

    #[test]
    fn session_lifecycle() {
        let store = test_store();
        store
            .friend_upsert("wx_s", Some("Sess"), None, None, None, None)
            .unwrap();
        store.session_create("sess_1", "wx_s", None).unwrap();
        let s = store.session_get_active("wx_s").unwrap().unwrap();
        assert_eq!(s.id, "sess_1");
        assert_eq!(s.message_count, 0);

        store.session_touch("sess_1").unwrap();
        let s = store.session_get_active("wx_s").unwrap().unwrap();
        assert_eq!(s.message_count, 1);

        store
            .session_set_claude_session("sess_1", "claude_abc")
            .unwrap();
        let s = store.session_get_active("wx_s").unwrap().unwrap();
        assert_eq!(s.claude_session.as_deref(), Some("claude_abc"));

        store.session_clear_user("wx_s").unwrap();
        assert!(store.session_get_active("wx_s").unwrap().is_none());
    }

    #[test]
    fn session_active_is_latest() {
        let store = test_store();
        store
            .friend_upsert("wx_multi", Some("Multi"), None, None, None, None)
            .unwrap();
        store.session_create("sess_old", "wx_multi", None).unwrap();
        store
            .session_create("sess_new", "wx_multi", Some("claude_xyz"))
            .unwrap();

        // Same CURRENT_TIMESTAMP second; rowid breaks the tie.
        let s = store.session_get_active("wx_multi").unwrap().unwrap();
        assert_eq!(s.id, "sess_new");
    }

    #[test]
    fn session_requires_registered_friend() {
        let store = test_store();
        let err = store.session_create("sess_fk", "wx_unregistered", None);
        assert!(err.is_err());
    }

    #[test]
    fn session_clean_expired_zero_window_removes_all() {
        let store = test_store();
        store
            .friend_upsert("wx_exp", Some("Exp"), None, None, None, None)
            .unwrap();
        store.session_create("sess_exp", "wx_exp", None).unwrap();
        assert_eq!(store.session_clean_expired(0).unwrap(), 1);
        assert!(store.session_get_active("wx_exp").unwrap().is_none());
    }

    #[test]
    fn session_clean_expired_large_window_keeps() {
        let store = test_store();
        store
            .friend_upsert("wx_keep", Some("Keep"), None, None, None, None)
            .unwrap();
        store.session_create("sess_keep", "wx_keep", None).unwrap();
        assert_eq!(store.session_clean_expired(999_999).unwrap(), 0);
    }

    #[test]
    fn audit_log_and_query() {
        let store = test_store();
        store
            .audit_log("wx_a1", Some("Alice"), Direction::In, Some("hello"), None)
            .unwrap();
        store
            .audit_log("wx_a1", Some("Alice"), Direction::Out, Some("hi"), Some("cs_1"))
            .unwrap();
        store
            .audit_log("wx_b1", Some("Bob"), Direction::In, Some("hey"), None)
            .unwrap();

        assert_eq!(store.audit_get_by_user("wx_a1", 50).unwrap().len(), 2);
        assert_eq!(store.audit_get_recent(10).unwrap().len(), 3);
        assert_eq!(store.audit_get_recent(2).unwrap().len(), 2);
    }

    #[test]
    fn audit_message_may_be_absent() {
        let store = test_store();
        store
            .audit_log("wx_null", Some("Test"), Direction::In, None, None)
            .unwrap();
        let logs = store.audit_get_by_user("wx_null", 10).unwrap();
        assert!(logs[0].message.is_none());
    }

    #[test]
    fn rate_limit_per_minute_boundary() {
        let store = test_store();
        for _ in 0..3 {
            assert!(store.rate_check_and_increment("wx_r", 3, 100).unwrap().allowed);
        }
        let r = store.rate_check_and_increment("wx_r", 3, 100).unwrap();
        assert!(!r.allowed);
        assert!(r.reason.as_deref().unwrap().contains("minute"));
    }

    #[test]
    fn rate_limit_daily_boundary() {
        let store = test_store();
        for _ in 0..3 {
            assert!(store.rate_check_and_increment("wx_day", 100, 3).unwrap().allowed);
        }
        let r = store.rate_check_and_increment("wx_day", 100, 3).unwrap();
        assert!(!r.allowed);
        assert!(r.reason.as_deref().unwrap().contains("Daily"));
    }

    #[test]
    fn rate_limit_zero_denies_first_request() {
        let store = test_store();
        let r = store.rate_check_and_increment("wx_zero", 0, 100).unwrap();
        assert!(!r.allowed);
        let r = store.rate_check_and_increment("wx_zero2", 100, 0).unwrap();
        assert!(!r.allowed);
    }

    #[test]
    fn rate_limit_users_are_independent() {
        let store = test_store();
        assert!(store.rate_check_and_increment("wx_aa", 1, 100).unwrap().allowed);
        assert!(!store.rate_check_and_increment("wx_aa", 1, 100).unwrap().allowed);
        assert!(store.rate_check_and_increment("wx_bb", 1, 100).unwrap().allowed);
    }

    #[test]
    fn rate_limit_denied_request_not_counted() {
        let store = test_store();
        assert!(store.rate_check_and_increment("wx_nc", 2, 10).unwrap().allowed);
        assert!(store.rate_check_and_increment("wx_nc", 2, 10).unwrap().allowed);
        // Denied attempts must not inflate the daily total.
        for _ in 0..5 {
            assert!(!store.rate_check_and_increment("wx_nc", 2, 10).unwrap().allowed);
        }
        let day_total: i64 = store
            .conn
            .query_row(
                "SELECT COALESCE(SUM(request_count), 0) FROM rate_limits WHERE wxid = ?",
                params!["wx_nc"],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(day_total, 2);
    }

    #[test]
    fn rate_cleanup_keeps_fresh_entries() {
        let store = test_store();
        store.rate_check_and_increment("wx_cl", 10, 100).unwrap();
        assert_eq!(store.rate_cleanup().unwrap(), 0);
    }

    #[test]
    fn rate_cleanup_drops_old_entries() {
        let store = test_store();
        store
            .conn
            .execute(
                "INSERT INTO rate_limits (wxid, window_start, request_count)
                 VALUES ('wx_old', datetime('now', '-2 days'), 5)",
                [],
            )
            .unwrap();
        assert_eq!(store.rate_cleanup().unwrap(), 1);
    }

    #[test]
    fn escape_like_escapes_wildcards() {
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
        assert_eq!(escape_like("plain"), "plain");
    }
}
