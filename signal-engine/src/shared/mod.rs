/// Shared modules for the signal engine
pub mod connection;
pub mod error;
pub mod history;
pub mod regime;
pub mod scoring;
pub mod setups;
pub mod state;
pub mod types;
pub mod websocket;
