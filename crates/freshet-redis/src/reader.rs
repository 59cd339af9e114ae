//! Blocking multi-stream reads over Redis Streams.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use tracing::{trace, warn};

use freshet_core::{ReadError, StreamBatch, StreamEntry, StreamReader};

/// [`StreamReader`] backed by a Redis server.
///
/// Owns a dedicated multiplexed connection: a blocking `XREAD` parks the
/// connection for up to the block timeout, so it must not be shared with
/// other commands.
pub struct RedisStreamReader {
    conn: MultiplexedConnection,
}

impl RedisStreamReader {
    /// Connect to `url` (e.g. `"redis://127.0.0.1:6379"`).
    ///
    /// # Errors
    ///
    /// Returns the underlying [`RedisError`] when the URL does not parse or
    /// the connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        Self::from_client(&client).await
    }

    /// Open a dedicated connection from an existing client.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`RedisError`] when the connection cannot be
    /// established.
    pub async fn from_client(client: &Client) -> Result<Self, RedisError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }

    /// Wrap an already-open connection.
    #[must_use]
    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl StreamReader for RedisStreamReader {
    async fn read(
        &self,
        cursors: &[(String, String)],
        block: Duration,
        count: Option<usize>,
    ) -> Result<Option<Vec<StreamBatch>>, ReadError> {
        let keys: Vec<&str> = cursors.iter().map(|(name, _)| name.as_str()).collect();
        let ids: Vec<&str> = cursors.iter().map(|(_, cursor)| cursor.as_str()).collect();

        let mut options = StreamReadOptions::default().block(block.as_millis() as usize);
        if let Some(count) = count {
            options = options.count(count);
        }

        trace!(streams = keys.len(), block = ?block, "Issuing XREAD");
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&keys, &ids, &options)
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .filter(|reply| !reply.keys.is_empty())
            .map(convert_reply))
    }
}

/// A dropped connection mid-read is the loop's transient retry case;
/// everything else stops it.
fn map_redis_error(err: RedisError) -> ReadError {
    if err.is_connection_dropped() {
        ReadError::ConnectionClosed
    } else {
        ReadError::Source(err.to_string())
    }
}

/// Walk `XREAD`'s reply shape into [`StreamBatch`]es, keeping the server's
/// per-stream entry order.
///
/// The client parses each entry's flat field list into a map, so duplicate
/// fields are already collapsed (last occurrence wins) before this runs.
fn convert_reply(reply: StreamReadReply) -> Vec<StreamBatch> {
    reply
        .keys
        .into_iter()
        .map(|stream_key| {
            let entries = stream_key
                .ids
                .into_iter()
                .map(|entry| {
                    let fields = entry
                        .map
                        .into_iter()
                        .map(|(field, value)| {
                            let value = redis::from_redis_value(value).unwrap_or_else(|err| {
                                warn!(field = %field, error = %err, "Non-string field value in stream entry");
                                String::new()
                            });
                            (field, value)
                        })
                        .collect();
                    StreamEntry::new(entry.id, fields)
                })
                .collect();
            StreamBatch::new(stream_key.key, entries)
        })
        .collect()
}
