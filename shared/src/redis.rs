//! Redis-backed message bus: `LPUSH` to publish, `BRPOP` to consume.
//!
//! Lists persist on the server while a consumer is away, which gives the channel its
//! durability. Blocking pops run on a dedicated connection so a long `BRPOP` never
//! stalls publishes issued by the same process.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::channel::{ChannelError, MessageBus};

pub type Redis = Client;

pub fn get_redis_client(redis_url: &str) -> Result<Redis, ChannelError> {
    Client::open(redis_url).map_err(delivery)
}

fn delivery(e: redis::RedisError) -> ChannelError {
    ChannelError::Delivery(e.to_string())
}

pub struct RedisBus {
    client: Client,
    publisher: AsyncMutex<Option<MultiplexedConnection>>,
    consumer: Arc<Mutex<Option<redis::Connection>>>,
}

impl RedisBus {
    pub fn open(redis_url: &str) -> Result<Self, ChannelError> {
        let client = get_redis_client(redis_url)?;
        info!(url = %redis_url, "Redis bus configured");
        Ok(Self {
            client,
            publisher: AsyncMutex::new(None),
            consumer: Arc::new(Mutex::new(None)),
        })
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, ChannelError> {
        let mut cached = self.publisher.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(delivery)?;
        debug!("Redis publisher connected");
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_publisher(&self) {
        *self.publisher.lock().await = None;
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn push(&self, queue: &str, payload: String) -> Result<(), ChannelError> {
        let mut conn = self.publisher().await?;
        let pushed: Result<i64, _> = redis::cmd("LPUSH")
            .arg(queue)
            .arg(payload)
            .query_async(&mut conn)
            .await;
        if let Err(e) = pushed {
            // drop the connection so the next publish reconnects
            self.reset_publisher().await;
            return Err(delivery(e));
        }
        Ok(())
    }

    async fn clear(&self, queue: &str) -> Result<usize, ChannelError> {
        let mut conn = self.publisher().await?;
        let cleared: Result<(usize, i64), _> = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(queue)
            .cmd("DEL")
            .arg(queue)
            .query_async(&mut conn)
            .await;
        match cleared {
            Ok((discarded, _)) => Ok(discarded),
            Err(e) => {
                self.reset_publisher().await;
                Err(delivery(e))
            }
        }
    }

    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, ChannelError> {
        let client = self.client.clone();
        let slot = self.consumer.clone();
        let queue = queue.to_string();
        let timeout_secs = timeout.as_secs().max(1);

        tokio::task::spawn_blocking(move || {
            let mut slot = slot
                .lock()
                .map_err(|_| ChannelError::Delivery("consumer connection poisoned".to_string()))?;
            if slot.is_none() {
                *slot = Some(client.get_connection().map_err(delivery)?);
                debug!(queue = %queue, "Redis consumer connected");
            }
            let Some(conn) = slot.as_mut() else {
                return Err(ChannelError::Delivery("consumer connection unavailable".to_string()));
            };
            let reply: Result<Option<(String, String)>, _> = redis::cmd("BRPOP")
                .arg(&queue)
                .arg(timeout_secs)
                .query(conn);
            match reply {
                Ok(popped) => Ok(popped.map(|(_, payload)| payload)),
                Err(e) => {
                    *slot = None;
                    Err(delivery(e))
                }
            }
        })
        .await
        .map_err(|e| ChannelError::Delivery(format!("consumer task failed: {}", e)))?
    }
}
