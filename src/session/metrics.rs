//! Metric name constants.
//!
//! Call sites use these constants rather than raw strings, so renames
//! stay centralized and typos cannot split a series.

/// Current number of logged-in sessions (gauge).
pub const SESSIONS_ACTIVE: &str = "gambit_sessions_active";
/// Total accepted TCP connections.
pub const CONNECTIONS_TOTAL: &str = "gambit_connections_total";
/// Total completed logins.
pub const LOGINS_TOTAL: &str = "gambit_logins_total";
/// Total idle-timeout disconnects issued by the heartbeat.
pub const IDLE_DISCONNECTS: &str = "gambit_idle_disconnects_total";
/// Total keepalive pings sent.
pub const PINGS_SENT: &str = "gambit_keepalive_pings_total";
/// Total flag-fall checks issued by the heartbeat.
pub const FLAG_CHECKS: &str = "gambit_flag_checks_total";
/// Uncompressed bytes fed to zipseal encoders.
pub const ZIPSEAL_BYTES_IN: &str = "gambit_zipseal_bytes_in_total";
/// Compressed bytes produced by zipseal encoders.
pub const ZIPSEAL_BYTES_OUT: &str = "gambit_zipseal_bytes_out_total";
