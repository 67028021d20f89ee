//! Server core: listeners, the per-connection lifecycle, and dispatch
//! wiring.
//!
//! One task per connection. The task owns the socket and the session
//! state; everything another task wants delivered goes through the
//! session's event channel. Incoming bytes flow line codec, then
//! timestamp decode, then block framing, then the external command
//! registry; output retraces the same path in reverse.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use metrics::{counter, gauge};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use super::block;
use super::directory::Directory;
use super::game::GameRegistry;
use super::heartbeat;
use super::metrics::{CONNECTIONS_TOTAL, LOGINS_TOTAL, SESSIONS_ACTIVE};
use super::notify::{notify_pin, notify_users};
use super::session::{Conn, CommandRegistry, Session, SessionEvent, SessionHandle, SessionId};
use super::timeseal::{detect_handshake, SealMode, SealPaths, PING, PONG_REPLY};
use super::user::{User, UserStore};

/// Server identity: `GAMBIT_SERVER_NAME`, or the system hostname.
pub static SERVER_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::var("GAMBIT_SERVER_NAME")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| hostname::get().ok().and_then(|h| h.into_string().ok()))
        .unwrap_or_else(|| "gambit.local".into())
});

/// Command prompt for interactive (non-block) sessions.
const PROMPT: &str = "gambit% ";

/// Runtime configuration, environment-driven.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Non-admin logins are refused above this many online users.
    pub max_users: usize,
    /// Idle threshold for the heartbeat's auto-logout, in seconds.
    pub idle_timeout_secs: u64,
    /// Heartbeat period in seconds.
    pub heartbeat_secs: u64,
    /// Codec helper binaries.
    pub seal: SealPaths,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        ServerConfig {
            max_users: env_or("GAMBIT_MAX_USERS", 1000),
            idle_timeout_secs: env_or("GAMBIT_IDLE_TIMEOUT_SECS", 3600),
            heartbeat_secs: env_or("GAMBIT_HEARTBEAT_SECS", 10),
            seal: SealPaths::from_env(),
        }
    }
}

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// The external collaborators the session core is wired to.
#[derive(Clone)]
pub struct Services {
    pub users: Arc<dyn UserStore>,
    pub commands: Arc<dyn CommandRegistry>,
    pub games: Arc<dyn GameRegistry>,
}

/// Shared server state.
#[derive(Debug)]
pub struct ServerState {
    pub directory: Directory,
    pub config: ServerConfig,
    next_session: SessionId,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        ServerState {
            directory: Directory::new(),
            config,
            next_session: 1,
        }
    }

    fn alloc_session_id(&mut self) -> SessionId {
        let id = self.next_session;
        self.next_session += 1;
        id
    }
}

/// Shared, task-safe server state.
pub type SharedState = Arc<RwLock<ServerState>>;

type TaskResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Bind all listeners, spawn the accept loops and the heartbeat, and
/// hand ownership of the lifecycle to the caller.
///
/// This is the embedding entry point; `run` is the thin binary wrapper.
/// The returned addresses are the actual bound ones, so callers may
/// pass port 0.
pub async fn start(
    addrs: &[&str],
    config: ServerConfig,
    services: Services,
) -> Result<(SharedState, Vec<SocketAddr>, Vec<JoinHandle<TaskResult>>), Box<dyn std::error::Error + Send + Sync>>
{
    let state: SharedState = Arc::new(RwLock::new(ServerState::new(config)));

    // Bind everything first, so port conflicts fail fast.
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let listener = TcpListener::bind(addr).await?;
        info!("gambit listening on {}", listener.local_addr()?);
        listeners.push(listener);
    }
    let local_addrs = listeners
        .iter()
        .map(|l| l.local_addr())
        .collect::<Result<Vec<_>, _>>()?;

    heartbeat::spawn(Arc::clone(&state), Arc::clone(&services.games));

    let mut handles = Vec::new();
    for listener in listeners {
        let state = Arc::clone(&state);
        let services = services.clone();
        handles.push(tokio::spawn(accept_loop(listener, state, services)));
    }

    Ok((state, local_addrs, handles))
}

/// Run the server until a listener fails (it shouldn't).
pub async fn run(addrs: &[&str], config: ServerConfig, services: Services) -> TaskResult {
    let (_state, _addrs, handles) = start(addrs, config, services).await?;
    for handle in handles {
        handle.await??;
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, state: SharedState, services: Services) -> TaskResult {
    loop {
        let (socket, addr) = listener.accept().await?;
        info!(%addr, "new connection");
        counter!(CONNECTIONS_TOTAL).increment(1);
        let state = Arc::clone(&state);
        let services = services.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(socket, addr, state, services).await {
                warn!(%addr, "client error: {e}");
            }
            info!(%addr, "disconnected");
        });
    }
}

/// Handle one client connection from accept to teardown.
async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    state: SharedState,
    services: Services,
) -> TaskResult {
    let (id, seal_paths) = {
        let mut st = state.write().await;
        (st.alloc_session_id(), st.config.seal.clone())
    };
    let mut conn = Conn::new(socket, Session::new(id, addr, seal_paths));
    let (tx, mut rx) = mpsc::unbounded_channel::<SessionEvent>();

    conn.write_line(&format!("Welcome to {}.", *SERVER_NAME)).await?;
    conn.write_wire("login: ").await?;

    // Set once login completes; departure fan-out only runs for a
    // session that made it into the directory.
    let mut presence: Option<(Arc<User>, SessionHandle)> = None;
    let mut first_line = true;
    let mut close_reason: Option<&'static str> = None;

    loop {
        tokio::select! {
            frame = conn.next_line() => {
                let raw = match frame {
                    Some(Ok(raw)) => raw,
                    Some(Err(e)) => {
                        warn!(%addr, "read error: {e}");
                        break;
                    }
                    None => break, // client closed
                };

                // The handshake window is exactly the first raw line.
                if std::mem::take(&mut first_line) {
                    if let Some(hs) = std::str::from_utf8(&raw).ok().and_then(detect_handshake) {
                        info!(session = id, mode = ?hs.mode, account = %hs.account, "timestamp handshake");
                        conn.session.seal.mode = hs.mode;
                        conn.session.seal.account = hs.account;
                        conn.session.seal.system = hs.system;
                        continue;
                    }
                }

                // Timestamp decode. A line the decoder cannot recover is
                // dropped; the connection lives on.
                let Some(text) = decode_input(&mut conn, &raw).await else {
                    continue;
                };
                if text == PONG_REPLY {
                    trace!(session = id, "keepalive pong");
                    continue;
                }
                conn.session.touch();

                if presence.is_none() {
                    presence = try_login(&mut conn, text.trim(), addr, &state, &services, &tx).await?;
                } else {
                    dispatch_command(&mut conn, &services, &text).await?;
                }
                if conn.session.quit {
                    break;
                }
            }

            Some(event) = rx.recv() => {
                match event {
                    SessionEvent::Line(line) => conn.write_line(&line).await?,
                    SessionEvent::Ping => {
                        if conn.session.seal.mode.wants_ping() {
                            conn.write_raw(PING).await?;
                        }
                    }
                    SessionEvent::IdleTimeout { minutes } => {
                        conn.write_line(&format!(
                            "**** Auto-logout because you were idle more than {minutes} minutes. ****"
                        )).await?;
                        close_reason = Some("idle timeout");
                        break;
                    }
                }
            }
        }
    }

    if let Some((user, handle)) = presence {
        // Remove from the directory and every derived set before any
        // further fan-out, so nothing can notify or count a departed
        // session.
        {
            let mut st = state.write().await;
            if st.directory.remove(&user.name).is_some() {
                let _ = notify_users(&st.directory, &user, &handle, false);
                notify_pin(&st.directory, &user, addr, false);
            }
        }
        gauge!(SESSIONS_ACTIVE).decrement(1.0);

        // Best-effort flush of anything queued during teardown, the
        // departure summary included.
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Line(line) = event {
                let _ = conn.write_line(&line).await;
            }
        }
        info!(
            %addr,
            name = %user.name,
            reason = close_reason.unwrap_or("connection closed"),
            "logout"
        );
    }

    Ok(())
}

/// Unwrap the timestamp framing according to the session's mode.
async fn decode_input(conn: &mut Conn, raw: &[u8]) -> Option<String> {
    match conn.session.seal.mode {
        SealMode::Plain => Some(String::from_utf8_lossy(raw).into_owned()),
        SealMode::TimesealV1 | SealMode::TimesealV2 => {
            conn.session.channels.decode_timeseal(raw).await.text
        }
        SealMode::Zipseal => conn.session.channels.decode_zipseal(raw).await.text,
    }
}

/// Names are plain words: letters only, 3 to 17 of them.
fn valid_name(name: &str) -> bool {
    (3..=17).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_alphabetic())
}

/// One login attempt. `Ok(None)` means the prompt was reissued (or the
/// session was refused and flagged to quit); `Ok(Some(..))` means the
/// user is in the directory and the arrival fan-out has run.
async fn try_login(
    conn: &mut Conn,
    name: &str,
    addr: SocketAddr,
    state: &SharedState,
    services: &Services,
    tx: &mpsc::UnboundedSender<SessionEvent>,
) -> Result<Option<(Arc<User>, SessionHandle)>, Box<dyn std::error::Error + Send + Sync>> {
    if name.is_empty() {
        conn.write_wire("login: ").await?;
        return Ok(None);
    }
    if !valid_name(name) {
        conn.write_line("Names may contain only letters and must be 3 to 17 characters long.")
            .await?;
        conn.write_wire("login: ").await?;
        return Ok(None);
    }

    let user = match services.users.lookup(name).await {
        Some(user) => user,
        None => Arc::new(User::guest(name)),
    };

    // Policy checks and insertion under one lock: the store lookup was a
    // suspension point, so "still free" must be re-established here.
    let handle = {
        let mut st = state.write().await;
        if st.directory.is_online(name) {
            drop(st);
            conn.write_line(&format!("Sorry, {name} is already logged in.")).await?;
            conn.session.quit = true;
            return Ok(None);
        }
        if st.directory.len() >= st.config.max_users && !user.is_admin() {
            drop(st);
            info!(%name, "login refused: server full");
            conn.write_line("Sorry, the server is full. Try again later.").await?;
            conn.session.quit = true;
            return Ok(None);
        }
        let handle = SessionHandle {
            id: conn.session.id,
            addr,
            seal_mode: conn.session.seal.mode,
            last_command: Arc::clone(&conn.session.last_command),
            tx: tx.clone(),
        };
        st.directory.add(Arc::clone(&user), handle.clone());
        handle
    };
    counter!(LOGINS_TOTAL).increment(1);
    gauge!(SESSIONS_ACTIVE).increment(1.0);

    if user.guest {
        conn.write_line(&format!(
            "Logging you in as \"{}\"; you are not registered.",
            user.name
        ))
        .await?;
    }
    conn.write_line(&format!("**** Starting session as {} ****", user.name)).await?;

    // Arrival fan-out, once per lifetime.
    let outcome = {
        let st = state.read().await;
        let outcome = notify_users(&st.directory, &user, &handle, true);
        notify_pin(&st.directory, &user, addr, true);
        outcome
    };
    conn.session.notifiers_online = outcome.notifiers_online;
    conn.session.notified_online = outcome.notified_online;

    conn.write_wire(PROMPT).await?;
    info!(name = %user.name, guest = user.guest, session = conn.session.id, "login complete");
    Ok(Some((user, handle)))
}

/// Route one command line through the block framer (when enabled) and
/// the external registry.
async fn dispatch_command(
    conn: &mut Conn,
    services: &Services,
    text: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if conn.session.block_mode {
        match block::parse_request(text) {
            Some((seq, rest)) => {
                conn.session.enter_block();
                let code = services.commands.dispatch(conn, rest).await;
                let payload = conn.session.exit_block();
                conn.write_wire(&block::frame(seq, code, &payload)).await?;
            }
            None => {
                conn.write_wire(&block::no_sequence_frame()).await?;
            }
        }
    } else {
        let _ = services.commands.dispatch(conn, text).await;
        conn.write_wire(PROMPT).await?;
    }
    Ok(())
}
