use core::net::Ipv4Addr;

/// Address every process listener binds to.
pub const DSIM_LISTEN_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;

/// Default first port handed out to process listeners (0 lets the OS choose).
pub const DSIM_BASE_PORT: u16 = 4242;

/// Interval between two liveness polls of the network monitor.
pub const DSIM_MONITOR_INTERVAL_MS: u64 = 100;

/// Number of attempts a channel writer makes to reach its peer listener.
pub const DSIM_CONNECT_ATTEMPTS: u32 = 50;

/// Delay between two connection attempts.
pub const DSIM_CONNECT_BACKOFF_MS: u64 = 20;
