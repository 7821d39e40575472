//! # Redis
//!
//! RAM database shared by every server replica.
//!
//! Core purpose is to store and lookup visitor votes and page vote counts. All mutation
//! happens server side in one Lua script so concurrent replicas never lose an update.
//!
//! ## Keys
//!
//! ```text
//! upvotes:counts              → hash, slug → count
//! upvotes:voters:{slug}       → hash, identity → "<0|1>|<last request id>"
//! upvotes:throttle:{identity} → "1", expires after the minimum interval
//! upvotes:cookie_secret       → signing secret when none is configured
//! upvotes:popular             → RankingSnapshot JSON
//! ```
//!
//! ## Implementation
//!
//! - Redis hash: 1 big key for counters, compact pairs and fast lookups
//! - One voters hash per page so a toggle touches exactly two keys
//! - Toggled-off voters keep their field with flag 0
//! - Every call is bounded by the configured store timeout
use std::{collections::HashMap, future::Future, time::Duration};

use async_trait::async_trait;
use redis::{
    AsyncCommands, Client, RedisResult, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::time::timeout;
use tracing::debug;

use crate::{
    error::StoreError,
    identity::VisitorIdentity,
    ranking::RankingSnapshot,
    store::{CountStore, SnapshotStore, Toggled},
};

pub const COUNTS_KEY: &str = "upvotes:counts";
pub const VOTERS_PREFIX: &str = "upvotes:voters:";
pub const THROTTLE_PREFIX: &str = "upvotes:throttle:";
pub const SECRET_KEY: &str = "upvotes:cookie_secret";
pub const SNAPSHOT_KEY: &str = "upvotes:popular";

// KEYS[1] voters hash, KEYS[2] counts hash
// ARGV[1] identity, ARGV[2] slug, ARGV[3] request id or ''
const TOGGLE_SCRIPT: &str = r"
local record = redis.call('HGET', KEYS[1], ARGV[1])
local voted = 0
local last = ''
if record then
    voted = tonumber(string.sub(record, 1, 1)) or 0
    last = string.sub(record, 3)
end

if ARGV[3] ~= '' and ARGV[3] == last then
    local current = tonumber(redis.call('HGET', KEYS[2], ARGV[2]) or '0') or 0
    return {current, voted}
end

local now = 1 - voted
redis.call('HSET', KEYS[1], ARGV[1], now .. '|' .. ARGV[3])

local count
if now == 1 then
    count = redis.call('HINCRBY', KEYS[2], ARGV[2], 1)
else
    count = redis.call('HINCRBY', KEYS[2], ARGV[2], -1)
    if count < 0 then
        redis.call('HSET', KEYS[2], ARGV[2], 0)
        count = 0
    end
end

return {count, now}
";

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    toggle_script: Script,
    timeout: Duration,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let connection = init_redis(redis_url).await?;

        Ok(Self::new(connection, timeout))
    }

    pub fn new(connection: ConnectionManager, timeout: Duration) -> Self {
        Self {
            connection,
            toggle_script: Script::new(TOGGLE_SCRIPT),
            timeout,
        }
    }

    async fn bounded<T>(&self, future: impl Future<Output = RedisResult<T>>) -> Result<T, StoreError> {
        timeout(self.timeout, future)
            .await
            .map_err(|_| StoreError::Timeout)?
            .map_err(StoreError::from)
    }
}

fn voters_key(slug: &str) -> String {
    format!("{VOTERS_PREFIX}{slug}")
}

fn is_voted(record: Option<&str>) -> bool {
    record.is_some_and(|record| record.starts_with('1'))
}

fn non_negative(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl CountStore for RedisStore {
    async fn get(&self, slug: &str) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let count: Option<i64> = self.bounded(connection.hget(COUNTS_KEY, slug)).await?;

        Ok(count.map(non_negative).unwrap_or(0))
    }

    async fn has_voted(&self, slug: &str, identity: &VisitorIdentity) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let record: Option<String> = self
            .bounded(connection.hget(voters_key(slug), identity.as_str()))
            .await?;

        Ok(is_voted(record.as_deref()))
    }

    async fn toggle(
        &self,
        slug: &str,
        identity: &VisitorIdentity,
        request_id: Option<&str>,
    ) -> Result<Toggled, StoreError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.toggle_script.prepare_invoke();
        invocation
            .key(voters_key(slug))
            .key(COUNTS_KEY)
            .arg(identity.as_str())
            .arg(slug)
            .arg(request_id.unwrap_or(""));

        let (count, now): (i64, i64) = self.bounded(invocation.invoke_async(&mut connection)).await?;

        debug!("Toggled {slug} for {}: count {count}, voted {now}", identity.as_str());

        Ok(Toggled {
            count: non_negative(count),
            upvoted: now == 1,
        })
    }

    async fn counts(&self) -> Result<Vec<(String, u64)>, StoreError> {
        let mut connection = self.connection.clone();
        let counts: HashMap<String, i64> = self.bounded(connection.hgetall(COUNTS_KEY)).await?;

        Ok(counts
            .into_iter()
            .map(|(slug, count)| (slug, non_negative(count)))
            .collect())
    }

    async fn throttle(
        &self,
        identity: &VisitorIdentity,
        interval: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let key = format!("{THROTTLE_PREFIX}{}", identity.as_str());
        let millis = interval.as_millis().max(1) as u64;

        let acquired: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(&key)
                    .arg(1)
                    .arg("PX")
                    .arg(millis)
                    .arg("NX")
                    .query_async(&mut connection),
            )
            .await?;

        Ok(acquired.is_some())
    }

    async fn release_throttle(&self, identity: &VisitorIdentity) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let key = format!("{THROTTLE_PREFIX}{}", identity.as_str());
        let _: i64 = self.bounded(connection.del(key)).await?;

        Ok(())
    }

    async fn cookie_secret(&self, candidate: &str) -> Result<String, StoreError> {
        let mut connection = self.connection.clone();
        let _: bool = self
            .bounded(connection.set_nx(SECRET_KEY, candidate))
            .await?;

        let stored: Option<String> = self.bounded(connection.get(SECRET_KEY)).await?;

        stored.ok_or_else(|| StoreError::Corrupt(format!("{SECRET_KEY} vanished after SETNX")))
    }
}

#[async_trait]
impl SnapshotStore for RedisStore {
    async fn load_snapshot(&self) -> Result<Option<RankingSnapshot>, StoreError> {
        let mut connection = self.connection.clone();
        let raw: Option<String> = self.bounded(connection.get(SNAPSHOT_KEY)).await?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt(format!("{SNAPSHOT_KEY}: {e}")))
        })
        .transpose()
    }

    async fn save_snapshot(&self, snapshot: &RankingSnapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)
            .map_err(|e| StoreError::Corrupt(format!("{SNAPSHOT_KEY}: {e}")))?;

        let mut connection = self.connection.clone();
        let _: () = self.bounded(connection.set(SNAPSHOT_KEY, payload)).await?;

        Ok(())
    }
}
