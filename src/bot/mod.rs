//! Frontend contract: a frontend produces inbound private text messages and
//! accepts outbound replies. The supervisor treats every implementation
//! interchangeably.

pub mod stdin;
pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;

pub use stdin::StdinBot;
pub use telegram::TelegramBot;

/// The sender of an inbound message.
#[derive(Debug, Clone)]
pub struct Contact {
    pub wxid: String,
    pub nickname: String,
    pub remark_name: String,
}

/// A chat frontend. `recv` and `send` take `&self` so the supervisor can
/// share one frontend across concurrent per-message tasks; implementations
/// keep their polling state behind interior mutability.
#[async_trait]
pub trait Frontend: Send + Sync {
    /// Perform any startup/login sequence.
    async fn start(&self) -> Result<()>;

    /// Wait for and return the next inbound message. `None` means the
    /// stream is exhausted and the bridge should shut down.
    async fn recv(&self) -> Result<Option<(Contact, String)>>;

    /// Deliver a reply chunk to a user.
    async fn send(&self, wxid: &str, text: &str) -> Result<()>;
}
