// Public API for clients, the relay binary and integration tests

pub mod aggregate;
pub mod channel;
pub mod config;
pub mod identity;
pub mod presence;
pub mod session;
pub mod types;

// Presence substrate and the relay exposing it
pub mod abuse;
pub mod api;
pub mod app;
pub mod hub;
pub mod protocol;
pub mod state;
pub mod sweeper;
pub mod ws;
