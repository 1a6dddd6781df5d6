//! Lua scripts for atomic presence updates.
//!
//! A binding, the member set and the per-participant session count must move
//! together: a connection id is bound into exactly one room or none, and the
//! member set only changes on a participant's first and last session. Redis
//! executes each script atomically, so concurrent joins and leaves from any
//! process observe a consistent view.

/// Bind a connection and count the participant's session.
///
/// Arguments:
/// - KEYS[1]: Connection binding hash (e.g., `classroom:conn:{id}`)
/// - KEYS[2]: Room member set (e.g., `classroom:room:{id}:members`)
/// - KEYS[3]: Room session counts (e.g., `classroom:room:{id}:sessions`)
/// - ARGV[1]: Room id
/// - ARGV[2]: Participant id
/// - ARGV[3]: Display name
///
/// Returns:
/// - 1: Bound, first session for this participant in the room
/// - 2: Bound, participant already had other sessions
/// - 0: Connection already bound to this room and participant (no change)
/// - -1: Connection bound to a different room or participant (no change)
pub const ATTACH: &str = r#"
local bound_room = redis.call('HGET', KEYS[1], 'room')
if bound_room then
    local bound_participant = redis.call('HGET', KEYS[1], 'participant')
    if bound_room == ARGV[1] and bound_participant == ARGV[2] then
        return 0
    end
    return -1
end

redis.call('HSET', KEYS[1], 'room', ARGV[1], 'participant', ARGV[2], 'display_name', ARGV[3])
redis.call('SADD', KEYS[2], ARGV[2])
local sessions = redis.call('HINCRBY', KEYS[3], ARGV[2], 1)
if sessions == 1 then
    return 1
end
return 2
"#;

/// Unbind a connection and drop its session.
///
/// The caller reads the binding first and passes the expected room and
/// participant, so the script can refuse to act on a binding that changed in
/// between.
///
/// Arguments:
/// - KEYS[1]: Connection binding hash
/// - KEYS[2]: Room member set
/// - KEYS[3]: Room session counts
/// - ARGV[1]: Expected room id
/// - ARGV[2]: Expected participant id
///
/// Returns:
/// - 1: Unbound, last session (participant removed from the member set)
/// - 0: Unbound, participant still has other sessions
/// - -1: Connection has no binding
/// - -2: Binding no longer matches the expected room/participant
pub const DETACH: &str = r#"
local bound_room = redis.call('HGET', KEYS[1], 'room')
if not bound_room then
    return -1
end
local bound_participant = redis.call('HGET', KEYS[1], 'participant')
if bound_room ~= ARGV[1] or bound_participant ~= ARGV[2] then
    return -2
end

redis.call('DEL', KEYS[1])
local remaining = redis.call('HINCRBY', KEYS[3], ARGV[2], -1)
if remaining <= 0 then
    redis.call('HDEL', KEYS[3], ARGV[2])
    redis.call('SREM', KEYS[2], ARGV[2])
    return 1
end
return 0
"#;

/// Grant a participant's session lease if no live lease exists.
///
/// Each grant bumps a per-participant generation, the fencing token of the
/// lease. The lease key expires on its own so a crashed holder cannot block
/// the participant forever.
///
/// Arguments:
/// - KEYS[1]: Lease key (e.g., `classroom:room:{id}:lease:{participant}`)
/// - KEYS[2]: Lease generations (e.g., `classroom:room:{id}:lease-generations`)
/// - ARGV[1]: Participant id
/// - ARGV[2]: Lease TTL in milliseconds
///
/// Returns:
/// - >0: Granted, the new generation
/// - 0: Another holder's lease is live
pub const ACQUIRE_LEASE: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end

local generation = redis.call('HINCRBY', KEYS[2], ARGV[1], 1)
redis.call('SET', KEYS[1], generation, 'PX', ARGV[2])
return generation
"#;

/// Release a lease only if the caller still holds it.
///
/// Arguments:
/// - KEYS[1]: Lease key
/// - ARGV[1]: Generation granted to the caller
///
/// Returns:
/// - 1: Released
/// - 0: Expired or held by a later generation (no change)
pub const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;
