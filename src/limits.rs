use std::time::Duration;

/// Rooms a single reservation may hold.
pub const MAX_ROOMS_PER_RESERVATION: usize = 20;

/// Longest stay accepted, in nights.
pub const MAX_STAY_NIGHTS: i64 = 365;

pub const MAX_NOTES_LEN: usize = 2_000;

pub const MAX_ROOM_NUMBER_LEN: usize = 32;

/// Calendar rebuilds cover at most this many days.
pub const MAX_PROJECTION_DAYS: i64 = 400;

/// Adults plus children (or `guests_count`) a single reservation may carry.
pub const MAX_GUESTS_PER_RESERVATION: i64 = 500;

/// How long a unit of work waits for a room lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
