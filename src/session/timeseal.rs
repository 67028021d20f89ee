//! Timeseal and zipseal: the client timestamp codec.
//!
//! Vendor clients obfuscate every line they send and embed a client-side
//! millisecond timestamp, so the server can tell real thinking time from
//! network lag. The scheme has two generations: timeseal (v1 and v2) only
//! timestamps input; zipseal additionally compresses server output.
//!
//! The byte-level transform is handled by cooperating helper processes,
//! one triple of pipes per connection, addressed line-by-line:
//!
//! - decode request: the raw client line + `\n`
//! - decode reply: `"<timestamp>: <text>\n"` (decimal for timeseal,
//!   hexadecimal for zipseal)
//! - encode request: 4 hex digits (length) + up to 1023 raw bytes
//! - encode reply: 4 hex digits (length) + compressed bytes
//!
//! A helper failing is never fatal to the connection: decode failures
//! yield the invalid-timestamp sentinel and the line is dropped, encode
//! failures degrade the session to uncompressed output.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::warn;

/// Largest payload the encode channel accepts. Longer lines are clipped,
/// not rejected.
pub const MAX_SEAL_PAYLOAD: usize = 1023;

/// Sentinel timestamp for a line the decoder could not recover.
pub const INVALID_TIMESTAMP: i64 = -1;

/// Server-initiated keepalive probe.
pub const PING: &[u8] = b"[G]\0";
/// The two-byte acknowledgment vendor clients send back, as it appears
/// after timestamp decoding.
pub const PONG_REPLY: &str = "\u{2}9";

/// The negotiated timestamp mode of a session. Fixed for the session's
/// lifetime once the first line has been seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SealMode {
    #[default]
    Plain,
    TimesealV1,
    TimesealV2,
    Zipseal,
}

impl SealMode {
    /// Whether the heartbeat sends keepalive pings to this mode.
    /// v1 clients do not answer pings; plain clients never see them.
    pub fn wants_ping(self) -> bool {
        matches!(self, SealMode::TimesealV2 | SealMode::Zipseal)
    }

    pub fn is_zipseal(self) -> bool {
        matches!(self, SealMode::Zipseal)
    }
}

/// A recognized handshake from the first line of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub mode: SealMode,
    pub account: String,
    pub system: String,
}

/// Recognize a protocol handshake in the raw first line.
///
/// Exact, case-sensitive keywords with pipe-delimited fields:
/// `TIMESTAMP|acc|system|`, `TIMESEAL2|acc|system|`,
/// `ZIPSEAL|1|0|acc|system|` (the version fields must be exactly `1`
/// and `0`). Anything else leaves the session in plain mode for good.
pub fn detect_handshake(line: &str) -> Option<Handshake> {
    if let Some(rest) = line.strip_prefix("TIMESTAMP|") {
        let (account, system) = two_fields(rest)?;
        return Some(Handshake {
            mode: SealMode::TimesealV1,
            account,
            system,
        });
    }
    if let Some(rest) = line.strip_prefix("TIMESEAL2|") {
        let (account, system) = two_fields(rest)?;
        return Some(Handshake {
            mode: SealMode::TimesealV2,
            account,
            system,
        });
    }
    if let Some(rest) = line.strip_prefix("ZIPSEAL|") {
        let mut parts = rest.split('|');
        if parts.next() != Some("1") || parts.next() != Some("0") {
            return None;
        }
        let account = parts.next()?.to_owned();
        let system = parts.next()?.to_owned();
        // The line must end with the closing pipe and nothing after it.
        if parts.next() != Some("") || parts.next().is_some() {
            return None;
        }
        return Some(Handshake {
            mode: SealMode::Zipseal,
            account,
            system,
        });
    }
    None
}

/// Parse `acc|system|` with a mandatory trailing pipe.
fn two_fields(rest: &str) -> Option<(String, String)> {
    let mut parts = rest.split('|');
    let account = parts.next()?.to_owned();
    let system = parts.next()?.to_owned();
    if parts.next() != Some("") || parts.next().is_some() {
        return None;
    }
    Some((account, system))
}

/// A decoded input line: the client's millisecond timestamp and the real
/// command text. `text == None` means the decoder could not recover a
/// command; the caller drops the line and moves on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub timestamp: i64,
    pub text: Option<String>,
}

impl Decoded {
    pub fn invalid() -> Self {
        Decoded {
            timestamp: INVALID_TIMESTAMP,
            text: None,
        }
    }
}

/// Parse a decoder reply of the form `"<timestamp>: <text>\n"`.
///
/// The timestamp is decimal for timeseal, hexadecimal for zipseal. A
/// zipseal timestamp of exactly zero is treated as a decode failure, the
/// same as a reply that does not match the shape at all.
pub fn parse_decoder_reply(reply: &str, hex: bool) -> Decoded {
    let Some(body) = reply.strip_suffix('\n') else {
        return Decoded::invalid();
    };
    let Some((stamp, text)) = body.split_once(": ") else {
        return Decoded::invalid();
    };
    if stamp.is_empty() {
        return Decoded::invalid();
    }
    let digits_ok = if hex {
        stamp.bytes().all(|b| b.is_ascii_hexdigit())
    } else {
        stamp.bytes().all(|b| b.is_ascii_digit())
    };
    if !digits_ok {
        return Decoded::invalid();
    }
    let parsed = if hex {
        i64::from_str_radix(stamp, 16)
    } else {
        stamp.parse()
    };
    match parsed {
        Ok(0) if hex => Decoded::invalid(),
        Ok(ts) => Decoded {
            timestamp: ts,
            text: Some(text.to_owned()),
        },
        Err(_) => Decoded::invalid(),
    }
}

/// Paths of the three helper binaries. Read from the environment once at
/// startup; tests substitute their own.
#[derive(Debug, Clone)]
pub struct SealPaths {
    pub timeseal_decoder: String,
    pub zipseal_decoder: String,
    pub zipseal_encoder: String,
}

impl SealPaths {
    pub fn from_env() -> Self {
        SealPaths {
            timeseal_decoder: std::env::var("GAMBIT_TIMESEAL_DECODER")
                .unwrap_or_else(|_| "timeseal_decoder".into()),
            zipseal_decoder: std::env::var("GAMBIT_ZIPSEAL_DECODER")
                .unwrap_or_else(|_| "zipseal_decoder".into()),
            zipseal_encoder: std::env::var("GAMBIT_ZIPSEAL_ENCODER")
                .unwrap_or_else(|_| "zipseal_encoder".into()),
        }
    }
}

/// One long-lived helper process addressed over its stdio pipes.
#[derive(Debug)]
pub struct CodecProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CodecProcess {
    pub fn spawn(program: &str) -> std::io::Result<Self> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdin pipe")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout pipe")
        })?;
        Ok(CodecProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Write one raw line and read one reply line back.
    pub async fn round_trip_line(&mut self, line: &[u8]) -> std::io::Result<String> {
        self.stdin.write_all(line).await?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;

        let mut reply = String::new();
        let n = self.stdout.read_line(&mut reply).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "codec helper closed its pipe",
            ));
        }
        Ok(reply)
    }

    /// Length-prefixed exchange for the encode channel: `%04x` + payload
    /// out, `%04x` + result back. The payload is clipped to
    /// [`MAX_SEAL_PAYLOAD`] bytes first.
    ///
    /// Returns `(consumed, compressed)`: how many payload bytes were
    /// actually sent, and what came back.
    pub async fn exchange_block(&mut self, payload: &[u8]) -> std::io::Result<(usize, Vec<u8>)> {
        let clipped = &payload[..payload.len().min(MAX_SEAL_PAYLOAD)];
        let header = format!("{:04x}", clipped.len());
        self.stdin.write_all(header.as_bytes()).await?;
        self.stdin.write_all(clipped).await?;
        self.stdin.flush().await?;

        let mut len_buf = [0u8; 4];
        self.stdout.read_exact(&mut len_buf).await?;
        let len_str = std::str::from_utf8(&len_buf).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "non-ASCII length header")
        })?;
        let len = usize::from_str_radix(len_str, 16).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "bad hex length header")
        })?;

        let mut compressed = vec![0u8; len];
        self.stdout.read_exact(&mut compressed).await?;
        Ok((clipped.len(), compressed))
    }
}

impl Drop for CodecProcess {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; start_kill here just makes the
        // teardown immediate rather than waiting for the runtime.
        let _ = self.child.start_kill();
    }
}

/// The per-session triple of codec channels, spawned lazily on first use.
///
/// A channel that fails is poisoned and never retried: the session runs
/// on without timestamps or compression from then on.
#[derive(Debug)]
pub struct SealChannels {
    paths: SealPaths,
    timeseal_decode: ChannelState,
    zipseal_decode: ChannelState,
    zipseal_encode: ChannelState,
}

#[derive(Debug, Default)]
enum ChannelState {
    #[default]
    Idle,
    Running(CodecProcess),
    Poisoned,
}

impl SealChannels {
    pub fn new(paths: SealPaths) -> Self {
        SealChannels {
            paths,
            timeseal_decode: ChannelState::Idle,
            zipseal_decode: ChannelState::Idle,
            zipseal_encode: ChannelState::Idle,
        }
    }

    /// Decode a timeseal v1/v2 line. Never fails: helper trouble maps to
    /// the invalid sentinel, exactly like a garbled line.
    pub async fn decode_timeseal(&mut self, raw: &[u8]) -> Decoded {
        let program = self.paths.timeseal_decoder.clone();
        match channel(&mut self.timeseal_decode, &program) {
            Some(proc_) => match proc_.round_trip_line(raw).await {
                Ok(reply) => parse_decoder_reply(&reply, false),
                Err(e) => {
                    warn!("timeseal decode failed, dropping channel: {e}");
                    self.timeseal_decode = ChannelState::Poisoned;
                    Decoded::invalid()
                }
            },
            None => Decoded::invalid(),
        }
    }

    /// Decode a zipseal line. Timestamp field is hexadecimal; a decoded
    /// value of zero counts as a failure.
    pub async fn decode_zipseal(&mut self, raw: &[u8]) -> Decoded {
        let program = self.paths.zipseal_decoder.clone();
        match channel(&mut self.zipseal_decode, &program) {
            Some(proc_) => match proc_.round_trip_line(raw).await {
                Ok(reply) => parse_decoder_reply(&reply, true),
                Err(e) => {
                    warn!("zipseal decode failed, dropping channel: {e}");
                    self.zipseal_decode = ChannelState::Poisoned;
                    Decoded::invalid()
                }
            },
            None => Decoded::invalid(),
        }
    }

    /// Compress an outgoing chunk. `Ok((consumed, bytes))` on success;
    /// `None` when the channel is unavailable, in which case the caller
    /// falls back to plain output.
    pub async fn encode_zipseal(&mut self, payload: &[u8]) -> Option<(usize, Vec<u8>)> {
        let program = self.paths.zipseal_encoder.clone();
        let proc_ = channel(&mut self.zipseal_encode, &program)?;
        match proc_.exchange_block(payload).await {
            Ok(pair) => Some(pair),
            Err(e) => {
                warn!("zipseal encode failed, dropping channel: {e}");
                self.zipseal_encode = ChannelState::Poisoned;
                None
            }
        }
    }
}

/// Fetch the running process for a channel, spawning it on first use.
fn channel<'a>(state: &'a mut ChannelState, program: &str) -> Option<&'a mut CodecProcess> {
    if matches!(state, ChannelState::Idle) {
        match CodecProcess::spawn(program) {
            Ok(proc_) => *state = ChannelState::Running(proc_),
            Err(e) => {
                warn!(%program, "failed to spawn codec helper: {e}");
                *state = ChannelState::Poisoned;
            }
        }
    }
    match state {
        ChannelState::Running(proc_) => Some(proc_),
        _ => None,
    }
}
