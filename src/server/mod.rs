pub mod config;
pub mod database;
pub mod directory;
pub mod events;
pub mod messages;
pub mod presence;
pub mod push;
pub mod rate_limiter;
pub mod redis_relay;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod websocket;
