//! Line-oriented stdin frontend for local testing.
//!
//! Input format, one message per line:
//!
//! ```text
//! wxid|nickname|message text
//! ```
//!
//! With a single `|` the nickname defaults to the wxid. Replies go to
//! stdout.

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{self, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Contact, Frontend};

pub struct StdinBot {
    reader: Mutex<BufReader<Stdin>>,
}

impl StdinBot {
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(io::stdin())),
        }
    }
}

impl Default for StdinBot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Frontend for StdinBot {
    async fn start(&self) -> Result<()> {
        info!("Stdin frontend ready -- enter messages as: wxid|nickname|message");
        Ok(())
    }

    async fn recv(&self) -> Result<Option<(Contact, String)>> {
        loop {
            let mut line = String::new();
            let n = self.reader.lock().await.read_line(&mut line).await?;
            if n == 0 {
                // EOF
                return Ok(None);
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let parts: Vec<&str> = line.splitn(3, '|').collect();
            let (wxid, nickname, message) = match parts.len() {
                3 => (parts[0], parts[1], parts[2]),
                2 => (parts[0], parts[0], parts[1]),
                _ => {
                    warn!("Bad input, expected wxid|nickname|message: {}", line);
                    continue;
                }
            };

            let contact = Contact {
                wxid: wxid.to_string(),
                nickname: nickname.to_string(),
                remark_name: String::new(),
            };

            return Ok(Some((contact, message.to_string())));
        }
    }

    async fn send(&self, wxid: &str, text: &str) -> Result<()> {
        println!("[{}] {}", wxid, text);
        Ok(())
    }
}
