use std::str::FromStr;

/// Permission tier for a friend. Ordered: admin > trusted > normal > blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Admin,
    Trusted,
    Normal,
    Blocked,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Trusted => "trusted",
            Self::Normal => "normal",
            Self::Blocked => "blocked",
        }
    }

    /// Numeric rank for access checks.
    pub fn level(&self) -> u8 {
        match self {
            Self::Admin => 3,
            Self::Trusted => 2,
            Self::Normal => 1,
            Self::Blocked => 0,
        }
    }

    /// Parse an externally-supplied tier token, defaulting unknown values to
    /// `normal` (the behavior config parsing requires).
    pub fn parse_lenient(s: &str) -> Self {
        s.parse().unwrap_or(Self::Normal)
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "trusted" => Ok(Self::Trusted),
            "normal" => Ok(Self::Normal),
            "blocked" => Ok(Self::Blocked),
            _ => Err(format!("Invalid permission tier: {}", s)),
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of an audited message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::In => "in",
            Self::Out => "out",
        }
    }
}

/// A registered chat contact and their authorization state.
#[derive(Debug, Clone)]
pub struct Friend {
    pub wxid: String,
    pub nickname: Option<String>,
    pub remark_name: Option<String>,
    pub permission: Permission,
    pub added_at: Option<String>,
    pub added_by: Option<String>,
    pub notes: Option<String>,
}

impl Friend {
    /// Preferred display name: remark > nickname > wxid.
    pub fn display_name(&self) -> &str {
        self.remark_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.nickname.as_deref().filter(|s| !s.is_empty()))
            .unwrap_or(&self.wxid)
    }
}

/// A conversation session. `claude_session` is Claude's own resumption id,
/// learned from CLI stderr after the first exchange.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub wxid: String,
    pub claude_session: Option<String>,
    pub created_at: Option<String>,
    pub last_active: Option<String>,
    pub message_count: i64,
}

/// One append-only audit row.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub id: i64,
    pub wxid: String,
    pub nickname: Option<String>,
    pub direction: String,
    pub message: Option<String>,
    pub claude_session: Option<String>,
    pub timestamp: Option<String>,
}

/// Outcome of a rate-limit admission check.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_roundtrip() {
        for p in [
            Permission::Admin,
            Permission::Trusted,
            Permission::Normal,
            Permission::Blocked,
        ] {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
    }

    #[test]
    fn permission_ordering() {
        assert!(Permission::Admin.level() > Permission::Trusted.level());
        assert!(Permission::Trusted.level() > Permission::Normal.level());
        assert!(Permission::Normal.level() > Permission::Blocked.level());
        assert_eq!(Permission::Blocked.level(), 0);
    }

    #[test]
    fn permission_parse_strict_rejects_unknown() {
        assert!("superuser".parse::<Permission>().is_err());
        assert!("ADMIN".parse::<Permission>().is_err());
        assert!("".parse::<Permission>().is_err());
    }

    #[test]
    fn permission_parse_lenient_defaults_to_normal() {
        assert_eq!(Permission::parse_lenient("superuser"), Permission::Normal);
        assert_eq!(Permission::parse_lenient(""), Permission::Normal);
        assert_eq!(Permission::parse_lenient("blocked"), Permission::Blocked);
    }

    #[test]
    fn display_name_preference_order() {
        let mut f = Friend {
            wxid: "wx1".into(),
            nickname: Some("Nick".into()),
            remark_name: Some("Remark".into()),
            permission: Permission::Normal,
            added_at: None,
            added_by: None,
            notes: None,
        };
        assert_eq!(f.display_name(), "Remark");
        f.remark_name = Some(String::new());
        assert_eq!(f.display_name(), "Nick");
        f.nickname = None;
        assert_eq!(f.display_name(), "wx1");
    }
}
