//! Admin chat commands.
//!
//! Every operation answers with a short status line. Only `enable` posts
//! an extra notice: a reply to the first message that would be deleted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::Destroyer;
use crate::rooms::expiry::{self, MS_PER_MINUTE};
use crate::rooms::Room;

/// A parsed command, prefix already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help(Option<String>),
    Enable,
    Confirm,
    Disable,
    Delay(Vec<String>),
    Unknown(String),
}

impl Command {
    pub fn parse(text: &str) -> Self {
        let mut words = text.split_whitespace();
        let Some(name) = words.next() else {
            return Command::Unknown(String::new());
        };
        let args: Vec<String> = words.map(str::to_string).collect();
        match name {
            "help" => Command::Help(args.into_iter().next()),
            "enable" => Command::Enable,
            "confirm" => Command::Confirm,
            "disable" => Command::Disable,
            "delay" => Command::Delay(args),
            _ => Command::Unknown(text.trim().to_string()),
        }
    }
}

pub struct CommandHandler {
    destroyer: Arc<Destroyer>,
    prefix: String,
}

impl CommandHandler {
    pub fn new(destroyer: Arc<Destroyer>, prefix: impl Into<String>) -> Self {
        Self {
            destroyer,
            prefix: prefix.into(),
        }
    }

    /// Run one command in a room and post the answer there.
    pub async fn process(&self, room_id: &str, text: &str) -> Result<()> {
        let (room, created) = self.destroyer.rooms().get_or_create(room_id)?;
        if created {
            self.say(room_id, "Room not initialized, initializing...").await?;
        }

        let command = Command::parse(text);
        tracing::debug!(room_id, command = ?command, "processing command");
        let reply = match command {
            Command::Help(topic) => self.help(topic.as_deref()),
            Command::Enable => self.enable(&room).await,
            Command::Confirm => self.confirm(&room),
            Command::Disable => self.disable(&room),
            Command::Delay(args) => match args.as_slice() {
                [] => self.get_delay(&room),
                [value] => self.set_delay(&room, value),
                _ => self.delay_usage(),
            },
            Command::Unknown(text) => format!(
                "Unknown command '{text}'. Try the 'help' command for more information."
            ),
        };
        self.say(room_id, &reply).await
    }

    async fn say(&self, room_id: &str, body: &str) -> Result<()> {
        self.destroyer
            .transport()
            .send_notice(room_id, body, None)
            .await?;
        Ok(())
    }

    /// Preview what would be deleted and ask for confirmation.
    pub async fn enable(&self, room: &Arc<Room>) -> String {
        if room.is_enabled() {
            return "Deletion already enabled.".to_string();
        }
        if room.policy().delete_after_ms.is_none() {
            return format!(
                "Message timeout not set. Set using `{} delay <delay in minutes>`",
                self.prefix
            );
        }

        let first = match room.cursor() {
            Some(cursor) => Some(cursor),
            None => {
                let scanner = self
                    .destroyer
                    .scheduler_for(room.clone(), CancellationToken::new());
                match scanner.locate_first_expiring().await {
                    Ok(found) => found,
                    Err(e) => {
                        tracing::warn!(room_id = %room.room_id(), error = %e, "enable preview failed");
                        return format!("Failed to read room history: {e}");
                    }
                }
            }
        };

        let transport = self.destroyer.transport();
        let preview = match &first {
            Some(cursor) => {
                transport
                    .send_notice(
                        room.room_id(),
                        "All messages above this message will be deleted.",
                        Some(&cursor.event_id),
                    )
                    .await
            }
            None => {
                transport
                    .send_notice(room.room_id(), "No messages will be deleted currently.", None)
                    .await
            }
        };
        if let Err(e) = preview {
            tracing::warn!(room_id = %room.room_id(), error = %e, "failed to post enable preview");
        }

        room.request_accept();
        format!(
            "To enable message deletion, please confirm with `{} confirm`",
            self.prefix
        )
    }

    pub fn confirm(&self, room: &Arc<Room>) -> String {
        match room.confirm_accept() {
            Ok(false) => "Nothing to confirm.".to_string(),
            Ok(true) => {
                if self.destroyer.start(room.room_id()) {
                    "Deleting old messages.".to_string()
                } else {
                    "Failed to start deletion process.".to_string()
                }
            }
            Err(e) => {
                tracing::warn!(room_id = %room.room_id(), error = %e, "failed to persist confirm");
                "Failed to start deletion process.".to_string()
            }
        }
    }

    pub fn disable(&self, room: &Arc<Room>) -> String {
        match room.disable() {
            Ok(false) => {
                self.destroyer.stop(room.room_id());
                "Deletion already disabled.".to_string()
            }
            Ok(true) => {
                if self.destroyer.stop(room.room_id()) {
                    "Deletion disabled.".to_string()
                } else {
                    "Failed to disable room deletion.".to_string()
                }
            }
            Err(e) => {
                tracing::warn!(room_id = %room.room_id(), error = %e, "failed to persist disable");
                "Failed to disable room deletion.".to_string()
            }
        }
    }

    pub fn get_delay(&self, room: &Room) -> String {
        match room.policy().delete_after_ms {
            None => format!(
                "Delay not set. Set using `{} delay <delay in minutes>`",
                self.prefix
            ),
            Some(ms) => format!("Messages are deleted after {} minutes", ms / MS_PER_MINUTE),
        }
    }

    /// Set the delay from user text. Invalid input leaves the policy untouched.
    pub fn set_delay(&self, room: &Room, value: &str) -> String {
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit()) {
            return "Please enter a numeric delay value in minutes".to_string();
        }
        let Ok(minutes) = value.parse::<u64>() else {
            return "Delay is too large".to_string();
        };
        if minutes == 0 {
            return "Delay must be positive".to_string();
        }
        let Some(ms) = expiry::minutes_to_ms(minutes) else {
            return "Delay is too large".to_string();
        };
        match room.set_delete_after(ms) {
            Ok(()) => {
                tracing::info!(room_id = %room.room_id(), minutes, "delay updated");
                format!("Messages will be deleted after {minutes} minutes")
            }
            Err(e) => {
                tracing::warn!(room_id = %room.room_id(), error = %e, "failed to persist delay");
                format!("Failed to set delay: {e}")
            }
        }
    }

    pub fn help(&self, topic: Option<&str>) -> String {
        let p = &self.prefix;
        match topic {
            None => "Hello, I am bot destroyer. Use `help commands` to view available commands."
                .to_string(),
            Some("commands") => "enable, disable, delay".to_string(),
            Some("enable") => format!(
                "Replies to first message that will be deleted. After confirmation enables \
                 message deletion in a room after message expires in `delay` time. Usage:\n\n\
                 `{p} enable`\n`{p} confirm`"
            ),
            Some("disable") => format!(
                "Disables message deletion after `delay` in a room. Usage:\n\n`{p} disable`"
            ),
            Some("delay") => self.delay_usage(),
            Some(_) => "Unknown help topic!".to_string(),
        }
    }

    fn delay_usage(&self) -> String {
        let p = &self.prefix;
        format!(
            "Show/Set delay in minutes after which messages will be deleted in a room. Usage:\n\n\
             Show delay:\n`{p} delay`\n\n\
             Set delay:\n`{p} delay <delay in minutes>`"
        )
    }
}
