// Access-token handling
pub mod auth;

// Configuration loading
pub mod config;

// Reconnection backoff policy
pub mod reconnect;

// Connection lifecycle state
pub mod state;

// Broker transport contract
pub mod transport;

// Connection and subscription management
pub mod subscription;
