// Shared infrastructure
pub mod config;
pub mod error;

// Core hub (registry, rooms, event dispatch)
pub mod events;
pub mod hub;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Client side
pub mod client;

// Supporting modules
pub mod shutdown;
pub mod tasks;
