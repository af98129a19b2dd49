//! A connection pool keyed by Flight `Location`, one idle-channel
//! queue per endpoint URI. The RAII return-on-drop idiom follows
//! `PooledConnection`/`Pool` in the pack's mssql driver
//! (`crates/mssql-pool/src/pool.rs`); the channel management itself is
//! `tonic::transport::Channel`-specific rather than that crate's SQL
//! Server connection lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_flight::Location;
use parking_lot::Mutex;
use thiserror::Error;
use tonic::transport::{Channel, Endpoint};

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("invalid location URI {uri}: {source}")]
    InvalidUri {
        uri: String,
        #[source]
        source: tonic::transport::Error,
    },
}

struct Inner {
    max_idle_per_location: usize,
    idle: Mutex<HashMap<String, Vec<Channel>>>,
}

/// A bounded pool of `tonic::transport::Channel`s, one idle queue per
/// `Location.uri`. Checking out a channel returns a [`PooledChannel`]
/// that puts it back on drop, up to `max_idle_per_location`; beyond
/// that the channel is simply dropped, since `Channel` itself is a
/// cheap multiplexed handle and does not need to be closed explicitly.
pub struct LocationPool {
    inner: Arc<Inner>,
}

impl LocationPool {
    pub fn new(max_idle_per_location: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_idle_per_location,
                idle: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Check out a channel for `location`, reusing an idle one if the
    /// pool has one, otherwise opening a fresh one. The fresh channel
    /// is lazy (`Endpoint::connect_lazy`): it dials on first RPC rather
    /// than here, so a location that is momentarily unreachable does
    /// not fail the checkout itself.
    pub async fn get(&self, location: &Location) -> Result<PooledChannel, PoolError> {
        let uri = location.uri.clone();
        if let Some(channel) = self.take_idle(&uri) {
            return Ok(PooledChannel {
                pool: self.inner.clone(),
                uri,
                channel: Some(channel),
            });
        }

        let endpoint = Endpoint::from_shared(uri.clone()).map_err(|source| PoolError::InvalidUri {
            uri: uri.clone(),
            source,
        })?;
        let channel = endpoint.connect_lazy();
        Ok(PooledChannel {
            pool: self.inner.clone(),
            uri,
            channel: Some(channel),
        })
    }

    fn take_idle(&self, uri: &str) -> Option<Channel> {
        self.inner.idle.lock().get_mut(uri).and_then(Vec::pop)
    }

    /// Number of idle channels currently held for `uri`.
    pub fn idle_count(&self, uri: &str) -> usize {
        self.inner.idle.lock().get(uri).map_or(0, Vec::len)
    }
}

/// A checked-out channel. Returned to its pool's idle queue on drop,
/// unless the queue is already at `max_idle_per_location`.
pub struct PooledChannel {
    pool: Arc<Inner>,
    uri: String,
    channel: Option<Channel>,
}

impl PooledChannel {
    pub fn channel(&self) -> &Channel {
        self.channel.as_ref().expect("channel taken only on drop")
    }

    /// Remove the channel from the pool permanently: it will not be
    /// returned to the idle queue on drop.
    pub fn detach(mut self) -> Channel {
        self.channel.take().expect("channel taken only on drop")
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let mut idle = self.pool.idle.lock();
        let queue = idle.entry(self.uri.clone()).or_default();
        if queue.len() < self.pool.max_idle_per_location {
            queue.push(channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `connect_lazy` builds a channel without dialing, so these tests
    /// exercise the pool's own bookkeeping without a live listener.
    fn location(uri: &str) -> Location {
        Location { uri: uri.to_string() }
    }

    #[tokio::test]
    async fn checked_out_channel_returns_to_idle_queue_on_drop() {
        let pool = LocationPool::new(2);
        let loc = location("http://127.0.0.1:50999");
        assert_eq!(pool.idle_count(&loc.uri), 0);

        let pooled = pool.get(&loc).await.unwrap();
        assert_eq!(pool.idle_count(&loc.uri), 0, "checked-out channel is not idle");
        drop(pooled);
        assert_eq!(pool.idle_count(&loc.uri), 1);
    }

    #[tokio::test]
    async fn second_checkout_reuses_the_idle_channel() {
        let pool = LocationPool::new(2);
        let loc = location("http://127.0.0.1:50999");

        drop(pool.get(&loc).await.unwrap());
        assert_eq!(pool.idle_count(&loc.uri), 1);

        let second = pool.get(&loc).await.unwrap();
        assert_eq!(pool.idle_count(&loc.uri), 0, "reused checkout should drain the idle queue");
        drop(second);
        assert_eq!(pool.idle_count(&loc.uri), 1);
    }

    #[tokio::test]
    async fn idle_queue_is_bounded_by_max_idle_per_location() {
        let pool = LocationPool::new(1);
        let loc = location("http://127.0.0.1:50999");

        let a = pool.get(&loc).await.unwrap();
        let b = pool.get(&loc).await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle_count(&loc.uri), 1);
    }

    #[tokio::test]
    async fn detach_removes_the_channel_from_the_pool_permanently() {
        let pool = LocationPool::new(2);
        let loc = location("http://127.0.0.1:50999");

        let pooled = pool.get(&loc).await.unwrap();
        let _channel = pooled.detach();
        assert_eq!(pool.idle_count(&loc.uri), 0);
    }

    #[tokio::test]
    async fn distinct_locations_get_independent_idle_queues() {
        let pool = LocationPool::new(2);
        let a = location("http://127.0.0.1:50999");
        let b = location("http://127.0.0.1:51000");

        drop(pool.get(&a).await.unwrap());
        assert_eq!(pool.idle_count(&a.uri), 1);
        assert_eq!(pool.idle_count(&b.uri), 0);
    }
}
