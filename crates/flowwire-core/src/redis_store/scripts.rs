// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-side Lua scripts.
//!
//! Each script runs atomically on the server. `redis::Script` sends them by
//! SHA and falls back to a full EVAL on NOSCRIPT, so a restarted server
//! needs no manual loading. Counted `LPOP` needs Redis 6.2 or Valkey.

use redis::Script;

/// KEYS = [lock, state, inbox], ARGV = [token, ttl_ms, max_inbox]
///
/// `false` (nil) when locked, else `{state or nil, inbox_items}`.
const ACQUIRE_AND_LOAD: &str = r#"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
    return false
end
local state = redis.call('GET', KEYS[2])
local inbox = {}
local max = tonumber(ARGV[3])
if max > 0 then
    inbox = redis.call('LPOP', KEYS[3], max) or {}
end
return {state, inbox}
"#;

/// KEYS = [lock, state], ARGV = [token, state, retention_ms]
///
/// retention_ms: -1 keep, 0 delete, >0 expire. Returns 1 on commit, 0 on fence mismatch.
const SAVE_AND_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
local retention = tonumber(ARGV[3])
if retention < 0 then
    redis.call('SET', KEYS[2], ARGV[2])
elseif retention == 0 then
    redis.call('DEL', KEYS[2])
else
    redis.call('SET', KEYS[2], ARGV[2], 'PX', retention)
end
redis.call('DEL', KEYS[1])
return 1
"#;

/// KEYS = [lock], ARGV = [token, ttl_ms]
const EXTEND_LOCK: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// KEYS = [lock], ARGV = [token]
const RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS = [pending, inflight], ARGV = [now_ms, visibility_ms]
const POP_WORK: &str = r#"
local item = redis.call('LPOP', KEYS[1])
if not item then
    return false
end
redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + tonumber(ARGV[2]), item)
return item
"#;

/// KEYS = [pending, inflight], ARGV = [now_ms, visibility_ms, max]
const POP_WORK_BATCH: &str = r#"
local items = redis.call('LPOP', KEYS[1], tonumber(ARGV[3]))
if not items then
    return {}
end
local deadline = tonumber(ARGV[1]) + tonumber(ARGV[2])
for _, item in ipairs(items) do
    redis.call('ZADD', KEYS[2], deadline, item)
end
return items
"#;

/// KEYS = [inflight, destination], ARGV = [current_member, replacement]
///
/// Returns 0 without pushing when the member already left inflight.
const NACK: &str = r#"
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('RPUSH', KEYS[2], ARGV[2])
return 1
"#;

/// KEYS = [inflight, pending], ARGV = [now_ms, limit]
const RECLAIM_EXPIRED: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, item in ipairs(items) do
    redis.call('ZREM', KEYS[1], item)
    redis.call('RPUSH', KEYS[2], item)
end
return #items
"#;

/// Compiled scripts, hashed once per store.
pub(crate) struct Scripts {
    pub acquire_and_load: Script,
    pub save_and_release: Script,
    pub extend_lock: Script,
    pub release: Script,
    pub pop_work: Script,
    pub pop_work_batch: Script,
    pub nack: Script,
    pub reclaim_expired: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            acquire_and_load: Script::new(ACQUIRE_AND_LOAD),
            save_and_release: Script::new(SAVE_AND_RELEASE),
            extend_lock: Script::new(EXTEND_LOCK),
            release: Script::new(RELEASE),
            pop_work: Script::new(POP_WORK),
            pop_work_batch: Script::new(POP_WORK_BATCH),
            nack: Script::new(NACK),
            reclaim_expired: Script::new(RECLAIM_EXPIRED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripts_have_distinct_hashes() {
        let scripts = Scripts::load();
        let hashes = [
            scripts.acquire_and_load.get_hash(),
            scripts.save_and_release.get_hash(),
            scripts.extend_lock.get_hash(),
            scripts.release.get_hash(),
            scripts.pop_work.get_hash(),
            scripts.pop_work_batch.get_hash(),
            scripts.nack.get_hash(),
            scripts.reclaim_expired.get_hash(),
        ];
        let unique: std::collections::HashSet<_> = hashes.iter().collect();
        assert_eq!(unique.len(), hashes.len());
        assert!(hashes.iter().all(|h| h.len() == 40));
    }
}
