//! Chat front end: admin commands, the sync listener, and its reconnect backoff.

pub mod backoff;
pub mod commands;
pub mod listener;

pub use commands::{Command, CommandHandler};
pub use listener::{Listener, ListenerSettings};
