/// Quantity of each catalog item a seller's ledger is seeded with at
/// registration.
///
/// The value is uniform across items and sellers. It is large enough to be
/// effectively non-limiting over a typical session while staying finite, so
/// insufficient-stock rejection remains reachable.
pub const INITIAL_STOCK: f64 = 1000.0;

/// Duration of every sale, in seconds.
///
/// Sales are created with this fixed duration and are reclaimed by the
/// expiry sweeper once it elapses.
pub const SALE_DURATION_SECS: u64 = 60;

/// Upper bound on a sale duration, in seconds.
///
/// Sale construction rejects durations of zero or above this bound.
pub const MAX_SALE_DURATION_SECS: u64 = 60;

/// Expiry sweeper tick period in milliseconds.
///
/// Every tick the sweeper closes sales whose deadline has passed and
/// returns their unsold remainder to the owning seller's ledger. Expiry
/// granularity is therefore this period plus scheduling jitter. It must not
/// be made coarser than one second.
pub const SWEEP_TICK_PERIOD_MSEC: u64 = 1000;

/// Maximum size in bytes of a single wire frame payload.
///
/// Frames announcing a larger payload are rejected as protocol violations
/// before any buffer is allocated.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Capacity of the shared broadcast event queue.
///
/// Sessions enqueue market events without blocking; when the queue is full
/// the event is dropped and logged rather than stalling the producer.
pub const BROADCAST_QUEUE_CAPACITY: usize = 256;

/// Capacity of each session's outbound frame queue.
///
/// A recipient whose queue fills up (a stalled or dead peer) is marked
/// failed and reaped; deliveries to other recipients proceed.
pub const SESSION_OUTBOUND_CAPACITY: usize = 64;

/// Polling interval (in milliseconds) used by a session's read loop when
/// waiting for data or performing keep-alive checks.
///
/// Reducing this value makes the server more responsive to shutdown but
/// increases CPU usage.
pub const SESSION_READ_TICK_MSEC: u64 = 200;

/// Maximum allowed time (in seconds) between inbound frames from a client.
///
/// Any frame counts, HEARTBEAT included. If a connection stays silent
/// longer than this window the server assumes the peer is dead and tears
/// the session down.
pub const CLIENT_KEEP_ALIVE_SEC: u64 = 60;

/// Polling interval (in milliseconds) of the accept loop.
///
/// The listener runs in non-blocking mode so the loop can observe
/// shutdown; this is how long it sleeps when no connection is pending.
pub const ACCEPT_TICK_PERIOD_MSEC: u64 = 100;

/// Length of generated client identifiers.
///
/// Eight random alphanumeric characters are collision-free with
/// overwhelming probability across a process lifetime.
pub const CLIENT_ID_LEN: usize = 8;
