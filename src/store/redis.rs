//! Redis shared store.
//!
//! # Key Schema
//!
//! | Key | Type | Purpose |
//! |-----|------|---------|
//! | `{prefix}task:{task_id}` | Hash | Task record (`input`, `status`, `result`, `error`, timestamps) |
//! | `{prefix}decompose-queue` | List | Task ids awaiting decomposition |
//! | `{prefix}execute-queue` | List | JSON jobs awaiting execution |
//!
//! Queues are `LPUSH` / `BRPOP`, so the oldest element is delivered first and
//! Redis hands each element to exactly one blocked client. Conditional status
//! transitions run as a Lua script so the check and the write are one atomic
//! step on the server.
//!
//! `BRPOP` holds its connection for the whole wait, so each blocking pop
//! checks a synchronous connection out of an idle pool and runs inside
//! `spawn_blocking`. Concurrent pollers therefore wait on separate
//! connections. All other commands share one multiplexed connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::Script;
use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::traits::{QueueName, SharedStore, task_key};
use crate::error::StoreError;
use crate::task::{TaskField, TaskRecord, TaskStatus, Transition};

/// Conditional status transition.
///
/// KEYS[1] = record hash key.
/// ARGV[1] = target status, ARGV[2] = count N of allowed predecessors,
/// ARGV[3..2+N] = allowed predecessors, remaining ARGV = field/value pairs.
/// Returns {code, current}: 1 = applied, 0 = already in target,
/// 2 = rejected, -1 = record missing.
const LUA_TRANSITION: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {-1, ''}
end

local current = redis.call('HGET', KEYS[1], 'status')
if not current or current == '' then
    current = 'SUBMITTED'
end
if current == ARGV[1] or (ARGV[1] == 'SUBMITTED' and current == 'PENDING') then
    return {0, current}
end

local n = tonumber(ARGV[2])
local allowed = false
for i = 3, 2 + n do
    if ARGV[i] == current then
        allowed = true
        break
    end
end
if not allowed then
    return {2, current}
end

local args = {'status', ARGV[1]}
for i = 3 + n, #ARGV do
    table.insert(args, ARGV[i])
end
redis.call('HSET', KEYS[1], unpack(args))
return {1, current}
"#;

/// Idle connections for blocking pops. A checked-out connection belongs to
/// one pop until it is checked back in.
struct IdlePool<T> {
    idle: Mutex<Vec<T>>,
}

impl<T> IdlePool<T> {
    fn new() -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Reuse an idle connection or open a fresh one.
    fn checkout<E>(&self, open: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        let reused = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        match reused {
            Some(conn) => Ok(conn),
            None => open(),
        }
    }

    fn checkin(&self, conn: T) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn);
    }
}

/// Redis-backed [`SharedStore`].
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    conn: MultiplexedConnection,
    blocking: Arc<IdlePool<::redis::Connection>>,
    transition_script: Script,
    key_prefix: String,
}

impl RedisStore {
    /// Connect to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = ::redis::Client::open(url)
            .map_err(|e| StoreError::Connection(format!("invalid Redis URL: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(format!("failed to connect to Redis: {e}")))?;
        info!("Connected to Redis");
        Ok(Self {
            client,
            conn,
            blocking: Arc::new(IdlePool::new()),
            transition_script: Script::new(LUA_TRANSITION),
            key_prefix: String::new(),
        })
    }

    /// Prefix every key, e.g. for test isolation or shared databases.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn record_key(&self, task_id: &str) -> String {
        prefixed(&self.key_prefix, &task_key(task_id))
    }

    fn queue_key(&self, queue: QueueName) -> String {
        prefixed(&self.key_prefix, queue.as_str())
    }
}

fn prefixed(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}:{key}")
    }
}

/// Script arguments for a transition to `to` carrying `fields`.
fn transition_argv(to: TaskStatus, fields: &[(TaskField, String)]) -> Vec<String> {
    let allowed = to.predecessor_wire_names();
    let mut argv = Vec::with_capacity(2 + allowed.len() + fields.len() * 2);
    argv.push(to.as_str().to_string());
    argv.push(allowed.len().to_string());
    argv.extend(allowed.into_iter().map(str::to_string));
    for (field, value) in fields {
        argv.push(field.as_str().to_string());
        argv.push(value.clone());
    }
    argv
}

fn map_redis_error(command: &str, key: &str, err: ::redis::RedisError) -> StoreError {
    StoreError::Command {
        command: command.to_string(),
        key: key.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn push(&self, queue: QueueName, payload: &str) -> Result<(), StoreError> {
        let key = self.queue_key(queue);
        let _: i64 = ::redis::cmd("LPUSH")
            .arg(&key)
            .arg(payload)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error("LPUSH", &key, e))?;
        debug!(queue = %queue, "Pushed element");
        Ok(())
    }

    async fn pop(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let key = self.queue_key(queue);
        let client = self.client.clone();
        let blocking = Arc::clone(&self.blocking);
        // BRPOP treats 0 as "wait forever".
        let secs = timeout.as_secs_f64().max(0.01);

        tokio::task::spawn_blocking(move || -> Result<Option<String>, StoreError> {
            let mut conn = blocking.checkout(|| {
                client
                    .get_connection()
                    .map_err(|e| StoreError::Connection(format!("failed to connect to Redis: {e}")))
            })?;

            let popped: Option<(String, String)> = ::redis::cmd("BRPOP")
                .arg(&key)
                .arg(secs)
                .query(&mut conn)
                .map_err(|e| {
                    warn!(queue = %key, error = %e, "BRPOP failed, dropping connection");
                    map_redis_error("BRPOP", &key, e)
                })?;

            blocking.checkin(conn);
            Ok(popped.map(|(_, payload)| payload))
        })
        .await
        .map_err(|e| StoreError::Connection(format!("blocking pop task failed: {e}")))?
    }

    async fn set_fields(
        &self,
        task_id: &str,
        fields: &[(TaskField, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let key = self.record_key(task_id);
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(&key);
        for (field, value) in fields {
            cmd.arg(field.as_str()).arg(value);
        }
        let _: i64 = cmd
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error("HSET", &key, e))?;
        Ok(())
    }

    async fn get_field(
        &self,
        task_id: &str,
        field: TaskField,
    ) -> Result<Option<String>, StoreError> {
        let key = self.record_key(task_id);
        let value: Option<String> = ::redis::cmd("HGET")
            .arg(&key)
            .arg(field.as_str())
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error("HGET", &key, e))?;
        Ok(value)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let key = self.record_key(task_id);
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error("HGETALL", &key, e))?;

        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(TaskRecord::from_fields(task_id, &fields)))
    }

    async fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        fields: &[(TaskField, String)],
    ) -> Result<Transition, StoreError> {
        let key = self.record_key(task_id);
        let mut invocation = self.transition_script.key(&key);
        for arg in transition_argv(to, fields) {
            invocation.arg(arg);
        }

        let (code, current): (i64, String) = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error("EVALSHA", &key, e))?;

        match code {
            1 => Ok(Transition::Applied),
            0 => Ok(Transition::AlreadyInState),
            2 => {
                let current = TaskStatus::parse(&current).ok_or_else(|| {
                    StoreError::Serialization(format!(
                        "unknown status '{current}' on task {task_id}"
                    ))
                })?;
                Ok(Transition::Rejected { current })
            }
            _ => Err(StoreError::NotFound {
                task_id: task_id.to_string(),
            }),
        }
    }
}
