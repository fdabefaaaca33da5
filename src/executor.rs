//! The message-execution pipeline: per-user concurrency guard, session
//! lifecycle, system-prompt composition, dispatch into the sandbox, and
//! output shaping.
//!
//! Every path out of `execute` returns a user-visible string; engine and
//! store failures are logged and collapsed into generic replies.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use regex::Regex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::{BridgeError, Result};
use crate::sandbox::{ContainerStats, ExecOptions, SandboxEngine};
use crate::store::{DbHandle, Friend, Permission, Session};
use crate::util::truncate_at_boundary;

/// Maximum reply size before truncation, bytes.
const MAX_RESPONSE_BYTES: usize = 4000;

const TRUNCATION_SUFFIX: &str = "\n\n... (truncated)";

const BUSY_REPLY: &str = "Still working on your previous message, please wait...";

/// Claude Code executor backed by per-user sandbox containers.
pub struct ClaudeExecutor {
    engine: Arc<dyn SandboxEngine>,
    db: DbHandle,
    /// wxids with a request in flight. Guards per-user serialization.
    in_flight: Arc<Mutex<HashSet<String>>>,
    session_expire_minutes: u64,
    timeout: u64,
}

/// Removes its wxid from the in-flight set on drop, so the guard is released
/// on every exit path, early returns and panics included.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    wxid: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.wxid);
        }
    }
}

/// Container status summary for `/status`.
#[derive(Debug)]
pub struct ContainerStatus {
    pub name: String,
    pub running: bool,
    pub stats: Option<ContainerStats>,
    pub disk: Option<String>,
}

impl ClaudeExecutor {
    pub fn new(
        engine: Arc<dyn SandboxEngine>,
        db: DbHandle,
        session_expire_minutes: u64,
        timeout: u64,
    ) -> Self {
        Self {
            engine,
            db,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            session_expire_minutes,
            timeout,
        }
    }

    /// Run one message through Claude in the user's container.
    ///
    /// If the user already has a request in flight, returns a busy reply
    /// without touching the engine.
    pub async fn execute(&self, wxid: &str, friend: &Friend, message: &str) -> String {
        let _guard = {
            let mut set = match self.in_flight.lock() {
                Ok(set) => set,
                Err(e) => {
                    error!("in-flight set poisoned: {}", e);
                    return "Something went wrong, please try again later".to_string();
                }
            };
            if set.contains(wxid) {
                return BUSY_REPLY.to_string();
            }
            set.insert(wxid.to_string());
            InFlightGuard {
                set: Arc::clone(&self.in_flight),
                wxid: wxid.to_string(),
            }
        };

        self.execute_inner(wxid, friend, message).await
    }

    async fn execute_inner(&self, wxid: &str, friend: &Friend, message: &str) -> String {
        let permission = friend.permission;

        if let Err(e) = self.engine.ensure_container(wxid, permission).await {
            error!("Failed to ensure container for {}: {}", wxid, e);
            return "The sandbox could not be started, please try again later".to_string();
        }

        let session = match self.get_or_create_session(wxid).await {
            Ok(s) => s,
            Err(e) => {
                error!("Session error for {}: {}", wxid, e);
                return "Session error, please try again".to_string();
            }
        };

        {
            let id = session.id.clone();
            if let Err(e) = self.db.call(move |db| db.session_touch(&id)).await {
                warn!("Failed to touch session {}: {}", session.id, e);
            }
        }

        let system_prompt = build_system_prompt(friend);

        debug!(
            "Dispatching to Claude [{}]: {}...",
            wxid,
            truncate_at_boundary(message, 80)
        );

        let options = ExecOptions {
            timeout_s: self.timeout,
            claude_session: session.claude_session.clone(),
            permission,
        };

        let output = match self
            .engine
            .exec_claude(wxid, &system_prompt, message, options)
            .await
        {
            Ok(output) => output,
            Err(BridgeError::ExecTimeout { seconds }) => {
                warn!("Claude timed out for {} after {}s", wxid, seconds);
                return "Request timed out, please try again".to_string();
            }
            Err(e) => {
                error!("Claude execution failed for {}: {}", wxid, e);
                return "Something went wrong while talking to Claude, please try again later"
                    .to_string();
            }
        };

        if !output.stderr.is_empty() {
            self.capture_claude_session(&session.id, &output.stderr)
                .await;
        }

        shape_response(&output.stdout)
    }

    // ---- sessions ----

    /// Active session for the user, replacing it when expired.
    async fn get_or_create_session(&self, wxid: &str) -> Result<Session> {
        let owned = wxid.to_string();
        let session = self
            .db
            .call(move |db| db.session_get_active(&owned))
            .await?;

        if let Some(s) = session {
            let expired = s
                .last_active
                .as_deref()
                .map(|ts| is_session_expired(ts, self.session_expire_minutes))
                .unwrap_or(true);
            if !expired {
                return Ok(s);
            }
            info!("Session expired for {}, starting fresh", wxid);
            let owned = wxid.to_string();
            self.db.call(move |db| db.session_clear_user(&owned)).await?;
        }

        self.create_session(wxid).await
    }

    async fn create_session(&self, wxid: &str) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let owned_id = id.clone();
        let owned_wxid = wxid.to_string();
        self.db
            .call(move |db| db.session_create(&owned_id, &owned_wxid, None))
            .await?;
        info!("Created session {} for {}", id, wxid);

        let owned = wxid.to_string();
        self.db
            .call(move |db| db.session_get_active(&owned))
            .await?
            .ok_or_else(|| BridgeError::Other(anyhow::anyhow!("freshly created session missing")))
    }

    /// Persist Claude's own resumption id when it shows up on stderr.
    async fn capture_claude_session(&self, session_id: &str, stderr: &str) {
        let Some(claude_session) = extract_claude_session(stderr) else {
            return;
        };
        debug!("Captured Claude session id {}", claude_session);
        let id = session_id.to_string();
        if let Err(e) = self
            .db
            .call(move |db| db.session_set_claude_session(&id, &claude_session))
            .await
        {
            warn!("Failed to persist Claude session id: {}", e);
        }
    }

    // ---- container management proxies for the router ----

    /// Clear the user's session; the next message starts a new context.
    pub async fn clear_session(&self, wxid: &str) -> Result<()> {
        let owned = wxid.to_string();
        self.db.call(move |db| db.session_clear_user(&owned)).await?;
        info!("Cleared session for {}", wxid);
        Ok(())
    }

    /// Kill any running Claude process in the user's container and release
    /// the in-flight guard.
    pub async fn kill_process(&self, wxid: &str) -> bool {
        let killed = match self.engine.kill_claude(wxid).await {
            Ok(killed) => killed,
            Err(e) => {
                warn!("kill_claude failed for {}: {}", wxid, e);
                false
            }
        };
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(wxid);
        }
        killed
    }

    pub async fn get_container_status(&self, wxid: &str) -> ContainerStatus {
        let name = self.engine.container_name(wxid);
        let running = self.engine.is_running(&name).await;
        let (stats, disk) = if running {
            (
                self.engine.stats(wxid).await.ok().flatten(),
                self.engine.disk_usage(wxid).await.ok(),
            )
        } else {
            (None, None)
        };

        ContainerStatus {
            name,
            running,
            stats,
            disk,
        }
    }

    pub async fn stop_container(&self, wxid: &str) -> Result<bool> {
        self.engine.stop_container(wxid).await
    }

    /// Remove the container (host volumes survive) and forget the session
    /// and any in-flight state.
    pub async fn destroy_container(&self, wxid: &str) -> Result<bool> {
        self.clear_session(wxid).await?;
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(wxid);
        }
        self.engine.destroy_container(wxid).await
    }

    pub async fn rebuild_container(&self, wxid: &str, permission: Permission) -> Result<()> {
        self.clear_session(wxid).await?;
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(wxid);
        }
        self.engine.rebuild(wxid, permission).await
    }

    pub async fn list_containers(&self) -> Result<Vec<crate::sandbox::ContainerInfo>> {
        self.engine.list_containers().await
    }

    pub async fn stop_all(&self) -> Result<usize> {
        self.engine.stop_all().await
    }
}

/// System prompt carrying user identity and tier restrictions.
fn build_system_prompt(friend: &Friend) -> String {
    let display_name = friend.display_name();

    let perm_desc = match friend.permission {
        Permission::Admin => "full privileges, may run any code or system operation",
        Permission::Trusted => "may run code and file operations inside the sandbox",
        Permission::Normal => "Q&A only, no code execution or filesystem access",
        Permission::Blocked => "no access",
    };

    let tool_note = if friend.permission == Permission::Normal {
        "- IMPORTANT: this user is limited to Q&A. Do not execute code, shell commands, or file operations"
    } else {
        "- This user may request code execution and file operations"
    };

    format!(
        "Current user:\n\
         - ID: {wxid}\n\
         - Name: {name}\n\
         - Permission tier: {perm} ({perm_desc})\n\
         \n\
         Environment:\n\
         - You run inside this user's dedicated sandbox container\n\
         - Working directory: /home/sandbox/workspace (persistent)\n\
         - The container is isolated from the host and from other users\n\
         {tool_note}\n\
         - Keep replies concise; they are read in a chat client",
        wxid = friend.wxid,
        name = display_name,
        perm = friend.permission,
        perm_desc = perm_desc,
        tool_note = tool_note,
    )
}

/// Empty output becomes a placeholder; oversized output is truncated at a
/// char boundary with a visible suffix.
fn shape_response(stdout: &str) -> String {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return "(no content)".to_string();
    }
    if trimmed.len() <= MAX_RESPONSE_BYTES {
        return trimmed.to_string();
    }
    let mut out = truncate_at_boundary(trimmed, MAX_RESPONSE_BYTES).to_string();
    out.push_str(TRUNCATION_SUFFIX);
    out
}

/// Find Claude's resumption id in CLI stderr: a UUID preceded by "session".
fn extract_claude_session(stderr: &str) -> Option<String> {
    let re = Regex::new(
        r"(?i)session[^0-9a-f]*([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
    )
    .expect("session id regex");
    re.captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether a session's last_active timestamp is stale.
///
/// Only `YYYY-MM-DD HH:MM:SS` (what the store writes) is recognized;
/// anything else is treated as expired. A timestamp in the future is not
/// expired; the sign is checked before any unsigned conversion.
fn is_session_expired(last_active: &str, expire_minutes: u64) -> bool {
    match NaiveDateTime::parse_from_str(last_active, "%Y-%m-%d %H:%M:%S") {
        Ok(dt) => {
            let elapsed = Utc::now().naive_utc().signed_duration_since(dt);
            let minutes = elapsed.num_minutes();
            if minutes < 0 {
                return false;
            }
            minutes as u64 > expire_minutes
        }
        Err(_) => {
            warn!("Unparseable last_active timestamp: {}", last_active);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn friend(permission: Permission) -> Friend {
        Friend {
            wxid: "wx_test".into(),
            nickname: Some("Tester".into()),
            remark_name: None,
            permission,
            added_at: None,
            added_by: None,
            notes: None,
        }
    }

    #[test]
    fn expired_for_old_timestamp() {
        assert!(is_session_expired("2020-01-01 00:00:00", 60));
    }

    #[test]
    fn not_expired_for_recent_timestamp() {
        let ts = Utc::now().naive_utc().format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(!is_session_expired(&ts, 60));
    }

    #[test]
    fn not_expired_for_future_timestamp() {
        let ts = (Utc::now().naive_utc() + chrono::Duration::minutes(5))
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert!(!is_session_expired(&ts, 60));
        assert!(is_session_expired("2020-01-01 00:00:00", 60));
        assert!(!is_session_expired("2099-01-01 00:00:00", 60));
    }

    #[test]
    fn expired_for_unparseable_timestamp() {
        assert!(is_session_expired("not-a-date", 60));
        assert!(is_session_expired("", 60));
        assert!(is_session_expired("2024-13-01 00:00:00", 60));
    }

    #[test]
    fn iso8601_with_t_separator_is_not_widened() {
        assert!(is_session_expired("2099-01-01T00:00:00", 60));
    }

    #[test]
    fn boundary_is_strictly_greater() {
        // Exactly now with a zero-minute window: 0 > 0 is false.
        let ts = Utc::now().naive_utc().format("%Y-%m-%d %H:%M:%S").to_string();
        assert!(!is_session_expired(&ts, 0));
    }

    #[test]
    fn huge_window_never_expires() {
        assert!(!is_session_expired("2020-01-01 00:00:00", u64::MAX));
    }

    #[test]
    fn shape_response_empty_gets_placeholder() {
        assert_eq!(shape_response(""), "(no content)");
        assert_eq!(shape_response("   \n  "), "(no content)");
    }

    #[test]
    fn shape_response_passes_short_output() {
        assert_eq!(shape_response("  hello  "), "hello");
    }

    #[test]
    fn shape_response_truncates_long_output() {
        let long = "x".repeat(10_000);
        let out = shape_response(&long);
        assert!(out.len() <= MAX_RESPONSE_BYTES + TRUNCATION_SUFFIX.len());
        assert!(out.ends_with(TRUNCATION_SUFFIX));
    }

    #[test]
    fn shape_response_truncates_multibyte_safely() {
        // Mixed Chinese and emoji, far over the budget.
        let long: String = "中文🎉好".repeat(1000);
        let out = shape_response(&long);
        assert!(out.ends_with(TRUNCATION_SUFFIX));
        let body = &out[..out.len() - TRUNCATION_SUFFIX.len()];
        assert!(body.len() <= MAX_RESPONSE_BYTES);
        assert!(long.starts_with(body));
    }

    #[test]
    fn extract_session_id_variants() {
        assert_eq!(
            extract_claude_session("Session: 123e4567-e89b-12d3-a456-426614174000"),
            Some("123e4567-e89b-12d3-a456-426614174000".to_string())
        );
        assert_eq!(
            extract_claude_session("resumed session 123e4567-e89b-12d3-a456-426614174000 ok"),
            Some("123e4567-e89b-12d3-a456-426614174000".to_string())
        );
        assert_eq!(extract_claude_session("no id here"), None);
        // A bare UUID without the "session" marker is not captured.
        assert_eq!(
            extract_claude_session("123e4567-e89b-12d3-a456-426614174000"),
            None
        );
    }

    #[test]
    fn system_prompt_includes_identity() {
        let prompt = build_system_prompt(&friend(Permission::Trusted));
        assert!(prompt.contains("wx_test"));
        assert!(prompt.contains("Tester"));
        assert!(prompt.contains("trusted"));
    }

    #[test]
    fn system_prompt_restricts_normal_users() {
        let prompt = build_system_prompt(&friend(Permission::Normal));
        assert!(prompt.contains("Do not execute code"));

        let prompt = build_system_prompt(&friend(Permission::Admin));
        assert!(!prompt.contains("Do not execute code"));
    }
}
