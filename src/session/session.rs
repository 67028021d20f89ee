//! Per-connection session state and the session write path.
//!
//! A `Session` is owned exclusively by its connection task and destroyed
//! on disconnect. Other tasks never touch it directly: cross-task
//! delivery goes through the session's event channel (`SessionHandle`),
//! and the connection task is the only writer on the socket. That is
//! what keeps block-mode capture atomic: while a block is open, every
//! write lands in the session's own accumulator, and nothing else can
//! reach the wire.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use metrics::counter;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::warn;

use super::codec::{CodecError, LineCodec};
use super::metrics::{ZIPSEAL_BYTES_IN, ZIPSEAL_BYTES_OUT};
use super::timeseal::{SealChannels, SealMode, SealPaths};

/// Process-unique session identifier.
pub type SessionId = u64;

/// Seconds since the Unix epoch.
pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Events other tasks may queue for a connection task to act on.
#[derive(Debug)]
pub enum SessionEvent {
    /// One line of text to deliver to the client.
    Line(String),
    /// Keepalive probe (heartbeat, zipseal and timeseal v2 only).
    Ping,
    /// Begin an idle-timeout disconnect; threshold in whole minutes,
    /// for display.
    IdleTimeout { minutes: u64 },
}

/// Cheap cross-task handle to a live session.
///
/// The negotiated seal mode is fixed before login completes, so it can
/// be carried here by value; the last-command timestamp is shared with
/// the connection task through an atomic.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub seal_mode: SealMode,
    pub last_command: Arc<AtomicU64>,
    pub tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    /// Queue one line for delivery. Delivery failure means the session
    /// is already tearing down; that is not the sender's problem.
    pub fn send_line(&self, line: impl Into<String>) {
        let _ = self.tx.send(SessionEvent::Line(line.into()));
    }

    pub fn send_event(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    /// Seconds since this session last issued a command.
    pub fn idle_secs(&self, now_secs: u64) -> u64 {
        now_secs.saturating_sub(self.last_command.load(Ordering::Relaxed))
    }
}

/// Timestamp-codec state of one session.
///
/// The mode is bound irreversibly by the handshake on the first line;
/// `degraded` flips when the encode helper fails, reverting output to
/// plain without renegotiating anything.
#[derive(Debug, Default)]
pub struct SealState {
    pub mode: SealMode,
    /// Client-reported account string from the handshake.
    pub account: String,
    /// Client-reported system string from the handshake.
    pub system: String,
    pub degraded: bool,
}

/// Connection-task-local state for one live session.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub addr: SocketAddr,
    pub seal: SealState,
    pub channels: SealChannels,
    /// Block-mode framing enabled (set by the command layer).
    pub block_mode: bool,
    /// Set by the command layer to end the session after this command.
    pub quit: bool,
    buffering: bool,
    buffer: String,
    /// Cumulative uncompressed bytes fed to the zipseal encoder.
    pub zipseal_in: u64,
    /// Cumulative compressed bytes it produced.
    pub zipseal_out: u64,
    pub last_command: Arc<AtomicU64>,
    /// Online users who have this user on their notify list.
    pub notifiers_online: HashSet<String>,
    /// Online users this user's notify list points at.
    pub notified_online: HashSet<String>,
}

impl Session {
    pub fn new(id: SessionId, addr: SocketAddr, paths: SealPaths) -> Self {
        Session {
            id,
            addr,
            seal: SealState::default(),
            channels: SealChannels::new(paths),
            block_mode: false,
            quit: false,
            buffering: false,
            buffer: String::new(),
            zipseal_in: 0,
            zipseal_out: 0,
            last_command: Arc::new(AtomicU64::new(epoch_secs())),
            notifiers_online: HashSet::new(),
            notified_online: HashSet::new(),
        }
    }

    /// Record command activity for the idle-timeout sweep.
    pub fn touch(&self) {
        self.last_command.store(epoch_secs(), Ordering::Relaxed);
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    /// Open a block: subsequent output accumulates instead of going to
    /// the wire. Nesting is a contract violation.
    pub fn enter_block(&mut self) {
        assert!(!self.buffering, "nested block-mode entry");
        self.buffering = true;
        self.buffer.clear();
    }

    /// Close the block and hand back everything captured inside it.
    pub fn exit_block(&mut self) -> String {
        assert!(self.buffering, "exit_block without an open block");
        self.buffering = false;
        std::mem::take(&mut self.buffer)
    }

    /// Append one line to the open block.
    pub(crate) fn push_output(&mut self, line: &str) {
        self.buffer.push_str(line);
        self.buffer.push('\n');
    }
}

/// A live connection: the framed socket plus its session state.
///
/// This is the only writer for the session. The command registry gets
/// `&mut Conn` during dispatch so its output flows through the same
/// buffering-aware path as everything else.
#[derive(Debug)]
pub struct Conn {
    framed: Framed<TcpStream, LineCodec>,
    pub session: Session,
}

impl Conn {
    pub fn new(socket: TcpStream, session: Session) -> Self {
        Conn {
            framed: Framed::new(socket, LineCodec::default()),
            session,
        }
    }

    /// Next raw line from the client, or `None` at EOF.
    pub async fn next_line(&mut self) -> Option<Result<Vec<u8>, CodecError>> {
        self.framed.next().await
    }

    /// Deliver one line of text. While a block is open the line joins
    /// the block's accumulator instead of the wire.
    pub async fn write_line(&mut self, line: &str) -> Result<(), CodecError> {
        if self.session.is_buffering() {
            self.session.push_output(line);
            return Ok(());
        }
        let mut wire = String::with_capacity(line.len() + 1);
        wire.push_str(line);
        wire.push('\n');
        self.write_wire(&wire).await
    }

    /// Send an already-terminated chunk, compressing it when the session
    /// negotiated zipseal. Compression is best effort: a failed encode
    /// degrades the session to plain output and the chunk still goes out.
    pub async fn write_wire(&mut self, chunk: &str) -> Result<(), CodecError> {
        if self.session.seal.mode.is_zipseal() && !self.session.seal.degraded {
            match self.session.channels.encode_zipseal(chunk.as_bytes()).await {
                Some((consumed, compressed)) => {
                    self.session.zipseal_in += consumed as u64;
                    self.session.zipseal_out += compressed.len() as u64;
                    counter!(ZIPSEAL_BYTES_IN).increment(consumed as u64);
                    counter!(ZIPSEAL_BYTES_OUT).increment(compressed.len() as u64);
                    return self.framed.send(Bytes::from(compressed)).await;
                }
                None => {
                    self.session.seal.degraded = true;
                    warn!(
                        session = self.session.id,
                        "zipseal encoder unavailable, session degraded to plain output"
                    );
                }
            }
        }
        self.framed.send(Bytes::copy_from_slice(chunk.as_bytes())).await
    }

    /// Send fixed protocol bytes (keepalive probes) untouched.
    pub async fn write_raw(&mut self, bytes: &'static [u8]) -> Result<(), CodecError> {
        self.framed.send(Bytes::from_static(bytes)).await
    }
}

/// The external command table. Invoked with the parsed command text
/// after all framing and timestamp handling is done.
#[async_trait]
pub trait CommandRegistry: Send + Sync {
    /// Run one command. Output written through `conn` is captured by an
    /// open block; the returned result code is what block frames report.
    async fn dispatch(&self, conn: &mut Conn, text: &str) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        Session::new(
            7,
            "127.0.0.1:5000".parse().unwrap(),
            SealPaths {
                timeseal_decoder: "cat".into(),
                zipseal_decoder: "cat".into(),
                zipseal_encoder: "cat".into(),
            },
        )
    }

    #[test]
    fn block_captures_output_lines() {
        let mut s = test_session();
        s.enter_block();
        assert!(s.is_buffering());
        s.push_output("first");
        s.push_output("second");
        assert_eq!(s.exit_block(), "first\nsecond\n");
        assert!(!s.is_buffering());
    }

    #[test]
    fn exiting_a_block_resets_the_accumulator() {
        let mut s = test_session();
        s.enter_block();
        s.push_output("old");
        let _ = s.exit_block();
        s.enter_block();
        assert_eq!(s.exit_block(), "");
    }

    #[test]
    #[should_panic(expected = "nested block-mode entry")]
    fn nested_block_entry_panics() {
        let mut s = test_session();
        s.enter_block();
        s.enter_block();
    }

    #[test]
    #[should_panic(expected = "exit_block without an open block")]
    fn exit_without_entry_panics() {
        let mut s = test_session();
        let _ = s.exit_block();
    }

    #[test]
    fn touch_refreshes_last_command() {
        let s = test_session();
        s.last_command.store(0, Ordering::Relaxed);
        s.touch();
        assert!(s.last_command.load(Ordering::Relaxed) > 0);
    }

    /// Build a connected socket pair so a real `Conn` can be exercised.
    async fn conn_pair(session: Session) -> (Conn, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, connected) =
            tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (server_side, _) = accepted.unwrap();
        (Conn::new(server_side, session), connected.unwrap())
    }

    #[tokio::test]
    async fn zipseal_write_updates_byte_counters() {
        let mut session = test_session();
        session.seal.mode = SealMode::Zipseal;
        // cat is an identity encoder, so in and out counts match.
        let (mut conn, _client) = conn_pair(session).await;

        conn.write_line("hello").await.unwrap();
        assert_eq!(conn.session.zipseal_in, 6); // "hello\n"
        assert_eq!(conn.session.zipseal_out, 6);

        conn.write_line("go").await.unwrap();
        assert_eq!(conn.session.zipseal_in, 9);
        assert_eq!(conn.session.zipseal_out, 9);
    }

    #[tokio::test]
    async fn broken_encoder_degrades_to_plain_output() {
        let mut session = Session::new(
            8,
            "127.0.0.1:5000".parse().unwrap(),
            SealPaths {
                timeseal_decoder: "/nonexistent/helper".into(),
                zipseal_decoder: "/nonexistent/helper".into(),
                zipseal_encoder: "/nonexistent/helper".into(),
            },
        );
        session.seal.mode = SealMode::Zipseal;
        let (mut conn, mut client) = conn_pair(session).await;

        // The write itself must succeed, just uncompressed.
        conn.write_line("hello").await.unwrap();
        assert!(conn.session.seal.degraded);
        assert_eq!(conn.session.zipseal_in, 0);
        assert_eq!(conn.session.zipseal_out, 0);

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }
}
