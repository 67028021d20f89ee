//! The session and protocol layer.
//!
//! Everything between the TCP socket and the external command registry:
//! line framing, timestamp codecs, block-mode response framing, the
//! presence directory with its notification fan-out, and the heartbeat.

pub mod block;
pub mod codec;
pub mod directory;
pub mod game;
pub mod heartbeat;
pub mod metrics;
pub mod notify;
pub mod server;
pub mod session;
pub mod timeseal;
pub mod user;

pub use directory::Directory;
pub use server::{start, run, ServerConfig, Services, SharedState};
pub use session::{CommandRegistry, Conn, Session, SessionEvent, SessionHandle};
