pub mod bot;
pub mod config;
pub mod error;
pub mod registry;
pub mod rooms;
pub mod store;
pub mod transport;
