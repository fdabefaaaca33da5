//! Shared text helpers: UTF-8-safe truncation and chunking, container name
//! sanitizing, byte formatting.

/// Truncate `s` to at most `max_bytes` bytes, never cutting inside a UTF-8
/// code point. Returns a prefix of `s`.
pub fn truncate_at_boundary(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Sanitize a wxid into a Docker-safe name fragment: every character outside
/// `[A-Za-z0-9_.-]` becomes `_`. An empty wxid maps to the sentinel
/// `_empty` so it can never collide with a real user's name.
pub fn sanitize_wxid(wxid: &str) -> String {
    if wxid.is_empty() {
        return "_empty".to_string();
    }
    wxid.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Split an outbound reply into chunks of at most `max_bytes` bytes each.
///
/// Prefers to cut at the latest newline within the budget, but only when it
/// falls at or past the midpoint (a newline near the start would produce a
/// tiny fragment); otherwise hard-cuts at the largest char boundary that
/// fits. Every split point is a valid UTF-8 boundary.
pub fn split_chunks(text: &str, max_bytes: usize) -> Vec<String> {
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining.to_string());
            break;
        }

        let mut cut = max_bytes;
        while cut > 0 && !remaining.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            // Single char wider than the budget: emit it whole.
            cut = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }

        let split_at = match remaining[..cut].rfind('\n') {
            Some(idx) if idx >= max_bytes / 2 => idx,
            _ => cut,
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// Human-readable byte count for status replies.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_untouched() {
        assert_eq!(truncate_at_boundary("hello", 10), "hello");
        assert_eq!(truncate_at_boundary("hello", 5), "hello");
    }

    #[test]
    fn truncate_ascii_exact() {
        assert_eq!(truncate_at_boundary("hello world", 5), "hello");
    }

    #[test]
    fn truncate_zero_budget() {
        assert_eq!(truncate_at_boundary("hello", 0), "");
    }

    #[test]
    fn truncate_never_splits_chinese() {
        // Each char is 3 bytes; a budget of 4 must back off to 3.
        let s = "你好世界";
        let t = truncate_at_boundary(s, 4);
        assert_eq!(t, "你");
        assert!(t.len() <= 4);
    }

    #[test]
    fn truncate_never_splits_emoji() {
        // Each emoji is 4 bytes; budgets 5..7 must all back off to 4.
        let s = "🎉🎊🎈";
        for budget in 5..8 {
            let t = truncate_at_boundary(s, budget);
            assert_eq!(t, "🎉");
        }
    }

    #[test]
    fn truncate_is_always_a_prefix() {
        let s = "mixed 中文 and 🎉 text";
        for budget in 0..=s.len() {
            let t = truncate_at_boundary(s, budget);
            assert!(s.starts_with(t));
            assert!(t.len() <= budget);
        }
    }

    #[test]
    fn sanitize_passes_safe_chars() {
        assert_eq!(sanitize_wxid("wxid_abc123"), "wxid_abc123");
        assert_eq!(sanitize_wxid("a.b-c_d"), "a.b-c_d");
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_wxid("user@foo/bar"), "user_foo_bar");
        assert_eq!(sanitize_wxid("中文id"), "__id");
    }

    #[test]
    fn sanitize_empty_uses_sentinel() {
        assert_eq!(sanitize_wxid(""), "_empty");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for wxid in ["user@foo", "", "wxid_ok", "空 space"] {
            let once = sanitize_wxid(wxid);
            assert_eq!(sanitize_wxid(&once), once);
        }
    }

    #[test]
    fn sanitize_output_charset() {
        let out = sanitize_wxid("weird!#$%^&*()id");
        assert!(out
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'));
    }

    #[test]
    fn split_short_message_single_chunk() {
        let chunks = split_chunks("Hello world", 2000);
        assert_eq!(chunks, vec!["Hello world"]);
    }

    #[test]
    fn split_at_newline_past_midpoint() {
        let a = "a".repeat(1200);
        let b = "b".repeat(1200);
        let msg = format!("{}\n{}", a, b);
        let chunks = split_chunks(&msg, 2000);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], a);
        assert_eq!(chunks[1], b);
    }

    #[test]
    fn split_ignores_newline_before_midpoint() {
        let mut msg = String::from("short\n");
        msg.push_str(&"x".repeat(2500));
        let chunks = split_chunks(&msg, 2000);
        assert_eq!(chunks[0].len(), 2000);
    }

    #[test]
    fn split_hard_cut_without_newlines() {
        let msg = "a".repeat(6001);
        let chunks = split_chunks(&msg, 2000);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 2000);
        assert_eq!(chunks[3].len(), 1);
    }

    #[test]
    fn split_exact_limit_single_chunk() {
        let msg = "x".repeat(2000);
        assert_eq!(split_chunks(&msg, 2000).len(), 1);
    }

    #[test]
    fn split_chinese_respects_boundaries() {
        let msg: String = std::iter::repeat('中').take(700).collect();
        let chunks = split_chunks(&msg, 2000);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= 2000);
            // Every chunk must be whole characters.
            assert_eq!(chunk.len() % 3, 0);
        }
        assert_eq!(chunks.concat(), msg);
    }

    #[test]
    fn split_emoji_respects_boundaries() {
        let msg: String = std::iter::repeat("🎉").take(600).collect();
        let chunks = split_chunks(&msg, 2000);
        for chunk in &chunks {
            assert!(chunk.len() <= 2000);
            assert_eq!(chunk.len() % 4, 0);
        }
        assert_eq!(chunks.concat(), msg);
    }

    #[test]
    fn split_tiny_budget_still_terminates() {
        let chunks = split_chunks("abc", 1);
        assert_eq!(chunks, vec!["a", "b", "c"]);
        // Budget smaller than one char: take the char whole rather than loop.
        let chunks = split_chunks("中中", 1);
        assert_eq!(chunks, vec!["中", "中"]);
    }

    #[test]
    fn format_bytes_scales() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.0KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0GB");
    }
}
