//! Admission control and command dispatch for inbound messages.
//!
//! Every message passes through: audit, friend registration, permission
//! resolution, rate limiting, command lookup, the security filter, and
//! finally the executor. Blocked users get silence; every other path
//! produces a user-visible reply.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use tracing::{error, info, warn};

use crate::bot::Contact;
use crate::config::Config;
use crate::errors::{BridgeError, Result};
use crate::executor::ClaudeExecutor;
use crate::store::{AuditEntry, DbHandle, Direction, Friend, Permission};
use crate::util::truncate_at_boundary;

/// Bytes of a reply recorded in the egress audit row.
const AUDIT_REPLY_PREFIX: usize = 500;

/// Bytes of a command reply recorded in the egress audit row.
const AUDIT_COMMAND_PREFIX: usize = 200;

struct CommandSpec {
    /// Minimum tier required to invoke.
    tier: Permission,
    description: &'static str,
}

pub struct MessageRouter {
    db: DbHandle,
    executor: Arc<ClaudeExecutor>,
    config: Arc<Config>,
    commands: HashMap<&'static str, CommandSpec>,
}

impl MessageRouter {
    pub fn new(db: DbHandle, executor: Arc<ClaudeExecutor>, config: Arc<Config>) -> Self {
        let mut commands = HashMap::new();

        commands.insert(
            "/help",
            CommandSpec {
                tier: Permission::Normal,
                description: "List available commands",
            },
        );
        commands.insert(
            "/status",
            CommandSpec {
                tier: Permission::Normal,
                description: "Show your session and container status",
            },
        );
        commands.insert(
            "/clear",
            CommandSpec {
                tier: Permission::Normal,
                description: "Clear your session; the next message starts fresh",
            },
        );
        commands.insert(
            "/allow",
            CommandSpec {
                tier: Permission::Admin,
                description: "Grant access: /allow <name> [trusted|normal|admin]",
            },
        );
        commands.insert(
            "/block",
            CommandSpec {
                tier: Permission::Admin,
                description: "Block a friend and destroy their container: /block <name>",
            },
        );
        commands.insert(
            "/list",
            CommandSpec {
                tier: Permission::Admin,
                description: "List all friends by tier",
            },
        );
        commands.insert(
            "/logs",
            CommandSpec {
                tier: Permission::Admin,
                description: "Recent audit log: /logs [name]",
            },
        );
        commands.insert(
            "/kill",
            CommandSpec {
                tier: Permission::Admin,
                description: "Kill a friend's running Claude process: /kill <name>",
            },
        );
        commands.insert(
            "/containers",
            CommandSpec {
                tier: Permission::Admin,
                description: "List sandbox containers",
            },
        );
        commands.insert(
            "/restart",
            CommandSpec {
                tier: Permission::Admin,
                description: "Stop a container; next message restarts it: /restart <name>",
            },
        );
        commands.insert(
            "/destroy",
            CommandSpec {
                tier: Permission::Admin,
                description: "Remove a container, keeping data: /destroy <name>",
            },
        );
        commands.insert(
            "/rebuild",
            CommandSpec {
                tier: Permission::Admin,
                description: "Destroy and recreate a container: /rebuild <name>",
            },
        );
        commands.insert(
            "/stopall",
            CommandSpec {
                tier: Permission::Admin,
                description: "Stop every sandbox container",
            },
        );

        Self {
            db,
            executor,
            config,
            commands,
        }
    }

    /// Handle one inbound message. `None` means deliberate silence.
    pub async fn handle_message(&self, contact: &Contact, message: &str) -> Option<String> {
        if contact.wxid.is_empty() {
            warn!("Dropping message with empty wxid");
            return None;
        }

        match self.route(contact, message).await {
            Ok(reply) => reply,
            Err(e) => self.reply_for_error(e),
        }
    }

    async fn route(&self, contact: &Contact, message: &str) -> Result<Option<String>> {
        let dn = display_name(contact).to_string();

        info!(
            "Message from {}({}): {}",
            dn,
            contact.wxid,
            truncate_at_boundary(message, 100)
        );

        self.audit(
            &contact.wxid,
            &dn,
            Direction::In,
            if self.config.logging.log_message_content {
                message
            } else {
                "[elided]"
            },
        )
        .await;

        self.ensure_friend_registered(contact).await;

        let Some(permission) = self.effective_permission(&contact.wxid).await else {
            return Ok(if self.config.permissions.notify_unauthorized {
                Some(self.config.permissions.unauthorized_message.clone())
            } else {
                None
            });
        };

        if permission == Permission::Blocked {
            warn!("Ignoring blocked user {}({})", dn, contact.wxid);
            return Ok(None);
        }

        let decision = {
            let wxid = contact.wxid.clone();
            let per_minute = self.config.rate_limit.max_per_minute as i64;
            let per_day = self.config.rate_limit.max_per_day as i64;
            self.db
                .call(move |db| db.rate_check_and_increment(&wxid, per_minute, per_day))
                .await?
        };
        if !decision.allowed {
            return Err(BridgeError::RateLimited(
                decision.reason.unwrap_or_else(|| "Rate limited".to_string()),
            ));
        }

        if message.starts_with('/') {
            if let Some(result) = self.handle_command(&contact.wxid, permission, message).await {
                let reply = result?;
                self.audit(
                    &contact.wxid,
                    &dn,
                    Direction::Out,
                    truncate_at_boundary(&reply, AUDIT_COMMAND_PREFIX),
                )
                .await;
                return Ok(Some(reply));
            }
            // Unknown slash-word: not a command, goes to Claude like any text.
        }

        if permission != Permission::Admin {
            self.security_check(message)?;
        }

        let friend = {
            let wxid = contact.wxid.clone();
            self.db
                .call(move |db| db.friend_get(&wxid))
                .await?
                .ok_or_else(|| BridgeError::Other(anyhow::anyhow!("friend row vanished")))?
        };

        let reply = self.executor.execute(&contact.wxid, &friend, message).await;

        self.audit(
            &contact.wxid,
            &dn,
            Direction::Out,
            truncate_at_boundary(&reply, AUDIT_REPLY_PREFIX),
        )
        .await;
        info!("Reply to {}: {}...", dn, truncate_at_boundary(&reply, 100));

        Ok(Some(reply))
    }

    /// Map a pipeline error to the user-visible reply.
    fn reply_for_error(&self, err: BridgeError) -> Option<String> {
        match err {
            BridgeError::RateLimited(reason) => Some(reason),
            BridgeError::PermissionDenied
            | BridgeError::SecurityBlocked
            | BridgeError::NotFound(_)
            | BridgeError::Ambiguous { .. }
            | BridgeError::BadArgs(_) => Some(err.to_string()),
            other => {
                error!("Message handling failed: {}", other);
                Some("Something went wrong, please try again later".to_string())
            }
        }
    }

    async fn audit(&self, wxid: &str, nickname: &str, direction: Direction, message: &str) {
        let wxid = wxid.to_string();
        let nickname = nickname.to_string();
        let message = message.to_string();
        if let Err(e) = self
            .db
            .call(move |db| {
                db.audit_log(&wxid, Some(&nickname), direction, Some(&message), None)
            })
            .await
        {
            warn!("Audit write failed: {}", e);
        }
    }

    // ---- permissions ----

    /// Effective tier: the admin wxid is always admin; otherwise the stored
    /// tier; otherwise the configured default. `None` means the default
    /// itself is unusable (unknown token) and the user is unauthorized.
    async fn effective_permission(&self, wxid: &str) -> Option<Permission> {
        if wxid == self.config.admin_wxid && !self.config.admin_wxid.is_empty() {
            return Some(Permission::Admin);
        }
        let owned = wxid.to_string();
        if let Ok(Some(perm)) = self
            .db
            .call(move |db| db.friend_get_permission(&owned))
            .await
        {
            return Some(perm);
        }
        self.config.permissions.default_level.parse().ok()
    }

    /// Create the friend row on first contact; refresh the display fields
    /// when they change. Permission is never touched here.
    async fn ensure_friend_registered(&self, contact: &Contact) {
        let wxid = contact.wxid.clone();
        let existing = match self.db.call(move |db| db.friend_get(&wxid)).await {
            Ok(f) => f,
            Err(e) => {
                warn!("friend lookup failed for {}: {}", contact.wxid, e);
                return;
            }
        };

        let remark = (!contact.remark_name.is_empty()).then(|| contact.remark_name.clone());

        match existing {
            Some(f) => {
                let nick_changed = f.nickname.as_deref() != Some(contact.nickname.as_str());
                let remark_changed = f.remark_name.as_deref() != remark.as_deref();
                if nick_changed || remark_changed {
                    let wxid = contact.wxid.clone();
                    let nickname = contact.nickname.clone();
                    let _ = self
                        .db
                        .call(move |db| {
                            db.friend_upsert(
                                &wxid,
                                Some(&nickname),
                                remark.as_deref(),
                                None,
                                None,
                                None,
                            )
                        })
                        .await;
                }
            }
            None => {
                let permission = if contact.wxid == self.config.admin_wxid {
                    Permission::Admin
                } else {
                    Permission::parse_lenient(&self.config.permissions.default_level)
                };
                let wxid = contact.wxid.clone();
                let nickname = contact.nickname.clone();
                let result = self
                    .db
                    .call(move |db| {
                        db.friend_upsert(
                            &wxid,
                            Some(&nickname),
                            remark.as_deref(),
                            Some(permission),
                            None,
                            None,
                        )
                    })
                    .await;
                match result {
                    Ok(()) => info!(
                        "Registered new friend {}({}) as {}",
                        display_name(contact),
                        contact.wxid,
                        permission
                    ),
                    Err(e) => warn!("friend registration failed for {}: {}", contact.wxid, e),
                }
            }
        }
    }

    // ---- security filter ----

    fn security_check(&self, message: &str) -> Result<()> {
        for pattern in &self.config.security.blocked_patterns {
            match Regex::new(&format!("(?i){}", pattern)) {
                Ok(re) => {
                    if re.is_match(message) {
                        warn!(
                            "Security filter hit: {}",
                            truncate_at_boundary(message, 100)
                        );
                        return Err(BridgeError::SecurityBlocked);
                    }
                }
                Err(e) => warn!("Bad blocked_patterns regex {:?}: {}", pattern, e),
            }
        }
        Ok(())
    }

    // ---- command dispatch ----

    /// `None` when the word after `/` is not a registered command.
    async fn handle_command(
        &self,
        wxid: &str,
        permission: Permission,
        message: &str,
    ) -> Option<Result<String>> {
        let mut parts = message.trim().split_whitespace();
        let cmd = parts.next()?.to_lowercase();
        let args = parts.collect::<Vec<_>>().join(" ");

        let spec = self.commands.get(cmd.as_str())?;

        if permission.level() < spec.tier.level() {
            return Some(Err(BridgeError::PermissionDenied));
        }

        Some(match cmd.as_str() {
            "/help" => Ok(self.cmd_help(permission)),
            "/status" => Ok(self.cmd_status(wxid).await),
            "/clear" => self.cmd_clear(wxid).await,
            "/allow" => self.cmd_allow(&args).await,
            "/block" => self.cmd_block(&args).await,
            "/list" => self.cmd_list().await,
            "/logs" => self.cmd_logs(&args).await,
            "/kill" => self.cmd_kill(&args).await,
            "/containers" => self.cmd_containers().await,
            "/restart" => self.cmd_restart(&args).await,
            "/destroy" => self.cmd_destroy(&args).await,
            "/rebuild" => self.cmd_rebuild(&args).await,
            "/stopall" => self.cmd_stopall().await,
            _ => return None,
        })
    }

    /// Resolve a /command name argument to exactly one friend.
    async fn resolve_friend(&self, query: &str) -> Result<Friend> {
        let q = query.trim().to_string();
        let mut matches = {
            let q = q.clone();
            self.db
                .call(move |db| db.friend_find_by_nickname(&q))
                .await?
        };
        match matches.len() {
            0 => Err(BridgeError::NotFound(q)),
            1 => Ok(matches.remove(0)),
            n => Err(BridgeError::Ambiguous { query: q, count: n }),
        }
    }

    fn cmd_help(&self, permission: Permission) -> String {
        let mut lines = vec!["Available commands:".to_string()];

        let mut entries: Vec<_> = self.commands.iter().collect();
        entries.sort_by_key(|(name, _)| **name);

        for (name, spec) in entries {
            if permission.level() >= spec.tier.level() {
                lines.push(format!("{} - {}", name, spec.description));
            }
        }

        lines.push(String::new());
        lines.push("Anything else you send goes straight to Claude.".to_string());
        lines.join("\n")
    }

    async fn cmd_status(&self, wxid: &str) -> String {
        let owned = wxid.to_string();
        let friend = self
            .db
            .call(move |db| db.friend_get(&owned))
            .await
            .ok()
            .flatten();
        let owned = wxid.to_string();
        let session = self
            .db
            .call(move |db| db.session_get_active(&owned))
            .await
            .ok()
            .flatten();
        let container = self.executor.get_container_status(wxid).await;

        let name = friend
            .as_ref()
            .map(|f| f.display_name().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let tier = friend
            .as_ref()
            .map(|f| f.permission.as_str())
            .unwrap_or("none");
        let session_info = match session {
            Some(ref s) => format!("active ({} messages)", s.message_count),
            None => "none".to_string(),
        };

        let mut lines = vec![
            "Status:".to_string(),
            format!("  user: {}", name),
            format!("  tier: {}", tier),
            format!("  session: {}", session_info),
            format!("  container: {}", container.name),
            format!(
                "  state: {}",
                if container.running { "running" } else { "stopped" }
            ),
        ];

        if let Some(ref stats) = container.stats {
            lines.push(format!("  cpu: {:.1}%", stats.cpu_percent));
            lines.push(format!(
                "  memory: {} / {}",
                crate::util::format_bytes(stats.memory_usage),
                crate::util::format_bytes(stats.memory_limit)
            ));
            lines.push(format!("  pids: {}", stats.pids));
        }
        if let Some(ref disk) = container.disk {
            lines.push(format!("  disk: {}", disk));
        }

        lines.join("\n")
    }

    async fn cmd_clear(&self, wxid: &str) -> Result<String> {
        self.executor.clear_session(wxid).await?;
        Ok("Session cleared; your next message starts a new conversation".to_string())
    }

    async fn cmd_allow(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs(
                "Usage: /allow <name> [trusted|normal|admin]".into(),
            ));
        }

        let mut parts = args.split_whitespace();
        let query = parts.next().unwrap_or_default();
        let tier = match parts.next() {
            Some(t) => match t.parse::<Permission>() {
                Ok(p) if p != Permission::Blocked => p,
                _ => {
                    return Err(BridgeError::BadArgs(format!(
                        "Invalid tier \"{}\"; valid: trusted, normal, admin",
                        t
                    )))
                }
            },
            None => Permission::Trusted,
        };

        let friend = self.resolve_friend(query).await?;
        {
            let wxid = friend.wxid.clone();
            self.db
                .call(move |db| db.friend_set_permission(&wxid, tier))
                .await?;
        }
        info!("Permission change: {} -> {}", friend.display_name(), tier);
        Ok(format!("{} -> {}", friend.display_name(), tier))
    }

    async fn cmd_block(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs("Usage: /block <name>".into()));
        }

        let friend = self.resolve_friend(args).await?;
        {
            let wxid = friend.wxid.clone();
            self.db
                .call(move |db| db.friend_set_permission(&wxid, Permission::Blocked))
                .await?;
        }
        let _ = self.executor.destroy_container(&friend.wxid).await;
        info!("Blocked {} and destroyed their container", friend.wxid);
        Ok(format!(
            "Blocked {}; their container has been destroyed",
            friend.display_name()
        ))
    }

    async fn cmd_list(&self) -> Result<String> {
        let friends = self.db.call(|db| db.friend_list_all()).await?;

        if friends.is_empty() {
            return Ok("No friends registered yet".to_string());
        }

        let mut grouped: HashMap<Permission, Vec<&Friend>> = HashMap::new();
        for f in &friends {
            grouped.entry(f.permission).or_default().push(f);
        }

        let mut lines = vec!["Friends:".to_string()];
        for tier in [
            Permission::Admin,
            Permission::Trusted,
            Permission::Normal,
            Permission::Blocked,
        ] {
            if let Some(group) = grouped.get(&tier) {
                lines.push(format!("{}:", tier.as_str().to_uppercase()));
                for f in group {
                    lines.push(format!("  {}", f.display_name()));
                }
            }
        }

        Ok(lines.join("\n"))
    }

    async fn cmd_logs(&self, args: &str) -> Result<String> {
        let logs = if args.is_empty() {
            self.db.call(|db| db.audit_get_recent(20)).await?
        } else {
            let friend = self.resolve_friend(args).await?;
            let wxid = friend.wxid;
            self.db
                .call(move |db| db.audit_get_by_user(&wxid, 20))
                .await?
        };
        Ok(format_audit_logs(&logs))
    }

    async fn cmd_kill(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs("Usage: /kill <name>".into()));
        }

        let friend = self.resolve_friend(args).await?;
        if self.executor.kill_process(&friend.wxid).await {
            Ok(format!("Killed {}'s Claude process", friend.display_name()))
        } else {
            Ok("No running process found".to_string())
        }
    }

    async fn cmd_containers(&self) -> Result<String> {
        let containers = self.executor.list_containers().await?;

        if containers.is_empty() {
            return Ok("No sandbox containers".to_string());
        }

        let mut lines = vec!["Containers:".to_string()];
        for c in &containers {
            let friend = match c.wxid {
                Some(ref w) => {
                    let wxid = w.clone();
                    self.db
                        .call(move |db| db.friend_get(&wxid))
                        .await
                        .ok()
                        .flatten()
                }
                None => None,
            };
            let owner = friend
                .as_ref()
                .map(|f| f.display_name().to_string())
                .or_else(|| c.wxid.clone())
                .unwrap_or_else(|| "unknown".to_string());
            let tier = c.permission.as_deref().unwrap_or("?");
            lines.push(format!("{} [{}]", owner, tier));
            lines.push(format!("  {}: {}", c.name, c.status));
        }

        Ok(lines.join("\n"))
    }

    async fn cmd_restart(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs("Usage: /restart <name>".into()));
        }

        let friend = self.resolve_friend(args).await?;
        let _ = self.executor.stop_container(&friend.wxid).await;
        self.executor.clear_session(&friend.wxid).await?;
        Ok(format!(
            "Stopped {}'s container; it restarts on their next message",
            friend.display_name()
        ))
    }

    async fn cmd_destroy(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs("Usage: /destroy <name>".into()));
        }

        let friend = self.resolve_friend(args).await?;
        self.executor.destroy_container(&friend.wxid).await?;
        Ok(format!(
            "Destroyed {}'s container (data kept; it is recreated on their next message)",
            friend.display_name()
        ))
    }

    async fn cmd_rebuild(&self, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(BridgeError::BadArgs("Usage: /rebuild <name>".into()));
        }

        let friend = self.resolve_friend(args).await?;
        self.executor
            .rebuild_container(&friend.wxid, friend.permission)
            .await?;
        Ok(format!("Rebuilt {}'s container", friend.display_name()))
    }

    async fn cmd_stopall(&self) -> Result<String> {
        let count = self.executor.stop_all().await?;
        Ok(format!("Stopped {} containers", count))
    }
}

/// Display name for a contact: remark > nickname > wxid.
fn display_name(contact: &Contact) -> &str {
    if !contact.remark_name.is_empty() {
        &contact.remark_name
    } else if !contact.nickname.is_empty() {
        &contact.nickname
    } else {
        &contact.wxid
    }
}

fn format_audit_logs(logs: &[AuditEntry]) -> String {
    if logs.is_empty() {
        return "No log entries".to_string();
    }

    logs.iter()
        .map(|l| {
            let dir = if l.direction == "in" { "<-" } else { "->" };
            let time = l
                .timestamp
                .as_deref()
                .and_then(|t| t.split(' ').nth(1))
                .or(l.timestamp.as_deref())
                .unwrap_or("");
            let nickname = l.nickname.as_deref().unwrap_or("");
            let msg = l
                .message
                .as_deref()
                .map(|m| truncate_at_boundary(m, 60))
                .unwrap_or("");
            format!("{} [{}] {}: {}", dir, time, nickname, msg)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_prefers_remark() {
        let contact = Contact {
            wxid: "wx1".into(),
            nickname: "Nick".into(),
            remark_name: "Remark".into(),
        };
        assert_eq!(display_name(&contact), "Remark");
    }

    #[test]
    fn display_name_falls_back_to_wxid() {
        let contact = Contact {
            wxid: "wx1".into(),
            nickname: String::new(),
            remark_name: String::new(),
        };
        assert_eq!(display_name(&contact), "wx1");
    }

    #[test]
    fn audit_log_formatting() {
        let logs = vec![AuditEntry {
            id: 1,
            wxid: "wx1".into(),
            nickname: Some("Alice".into()),
            direction: "in".into(),
            message: Some("hello there".into()),
            claude_session: None,
            timestamp: Some("2026-08-02 10:30:00".into()),
        }];
        let out = format_audit_logs(&logs);
        assert!(out.contains("<-"));
        assert!(out.contains("10:30:00"));
        assert!(out.contains("Alice"));
        assert!(out.contains("hello there"));
    }

    #[test]
    fn audit_log_formatting_empty() {
        assert_eq!(format_audit_logs(&[]), "No log entries");
    }

    #[test]
    fn audit_log_truncates_multibyte_safely() {
        let logs = vec![AuditEntry {
            id: 1,
            wxid: "wx1".into(),
            nickname: None,
            direction: "out".into(),
            message: Some("中".repeat(100)),
            claude_session: None,
            timestamp: None,
        }];
        // Must not panic on the 60-byte prefix cut.
        let out = format_audit_logs(&logs);
        assert!(out.contains("->"));
    }
}
