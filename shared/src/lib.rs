pub mod channel;
pub mod config;
pub mod database;
pub mod entity;
pub mod memory;
pub mod message;
pub mod redis;
pub mod store;
pub mod worker_env;

pub use channel::{
    command_queue, consume_from, publish_to, status_queue, topic_hash, ChannelError, ChannelRetry,
    Deduplicator, MessageBus, MessageChannel, MessageStream, StatusView,
};
pub use config::Config;
pub use database::get_db_connection;
pub use memory::MemoryBus;
pub use message::{ControlMessage, MessageType};
pub use self::redis::{get_redis_client, Redis, RedisBus};
pub use store::SessionStore;
pub use worker_env::{WorkerEnv, EXIT_OK, EXIT_REPORTED};
