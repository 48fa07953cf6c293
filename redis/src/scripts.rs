//! Lua scripts evaluated atomically by the Redis server.
//!
//! Every script takes `KEYS[1]` = stock counter and `KEYS[2]` = purchased-buyer
//! set of one offer. Both keys share a hash tag so they live in the same
//! cluster slot.

/// Reply codes of [`ADMIT`].
pub mod admit_reply {
    /// Unit reserved, buyer recorded
    pub const RESERVED: i64 = 1;
    /// Buyer already in the purchased set
    pub const ALREADY_PURCHASED: i64 = -1;
    /// Counter at or below zero
    pub const OUT_OF_STOCK: i64 = -2;
    /// Counter key missing
    pub const UNKNOWN_OFFER: i64 = -3;
}

/// Check dedup, check stock, decrement and record.
///
/// `ARGV[1]` = buyer id.
pub const ADMIT: &str = r"
    if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
        return -1
    end

    local stock = redis.call('GET', KEYS[1])
    if not stock then
        return -3
    end

    if tonumber(stock) <= 0 then
        return -2
    end

    redis.call('DECR', KEYS[1])
    redis.call('SADD', KEYS[2], ARGV[1])
    return 1
";

/// Write counter and purchased set only if the counter does not exist.
///
/// `ARGV[1]` = remaining stock, `ARGV[2..]` = buyers already holding orders.
/// Returns 1 when seeded, 0 when the offer was already present.
pub const SEED_IF_ABSENT: &str = r"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        return 0
    end

    redis.call('DEL', KEYS[2])
    for i = 2, #ARGV do
        redis.call('SADD', KEYS[2], ARGV[i])
    end

    redis.call('SET', KEYS[1], ARGV[1])
    return 1
";

/// Re-derive the counter from durable truth and the live purchased set.
///
/// `ARGV[1]` = allotment (durable remaining + durable orders),
/// `ARGV[2]` = durable remaining.
///
/// Returns `false` (nil) if the offer was never seeded, otherwise
/// `{previous, target, purchased, oversold}`.
pub const RECONCILE: &str = r"
    local previous = redis.call('GET', KEYS[1])
    if not previous then
        return false
    end
    previous = tonumber(previous)

    local purchased = redis.call('SCARD', KEYS[2])
    local target = math.min(tonumber(ARGV[1]) - purchased, tonumber(ARGV[2]))
    local oversold = 0
    if target < 0 then
        target = 0
        oversold = 1
    end

    if target ~= previous then
        redis.call('SET', KEYS[1], target)
    end

    return {previous, target, purchased, oversold}
";
