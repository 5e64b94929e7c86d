//! Readiness-based single-threaded transport: binds the control and debug
//! Unix sockets, multiplexes every open connection through one `mio::Poll`,
//! and feeds decoded messages to the allocation engine.
//!
//! Grounded on the corpus's bare event-loop pattern (`mio::Poll` + `Events`
//! + a `Token`-keyed connection table, accept-until-`WouldBlock`, a
//! leftover-buffer for partial writes) rather than the teacher's own
//! `tokio` transport: the engine this module drives is a single-threaded
//! cooperative fixpoint loop with no interior mutability, and `mio` here
//! exists only to multiplex file descriptors on that one thread, never to
//! run engine logic concurrently.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use membroker_proto::{unpack_register_arg, Direction, Message, Opcode, RawMessage, WIRE_SIZE};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use crate::diagnostics;
use crate::engine::{Broker, Outbound};
use crate::ids::{ClientId, ConnId};
use crate::solicitation::RequestKind;

const WAKER_TOKEN: Token = Token(0);
const CONTROL_TOKEN: Token = Token(1);
const DEBUG_TOKEN: Token = Token(2);
const FIRST_CONN_TOKEN: usize = 3;

/// Reads the systemd-style `LISTEN_FDS`/`LISTEN_PID` convention: if set and
/// addressed to this process, the control socket has already been bound by
/// a supervisor and passed as fd 3, so the broker should adopt it rather
/// than bind its own.
pub fn inherited_listen_fd() -> Option<RawFd> {
    let n: u32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
    if n == 0 {
        return None;
    }
    let pid: i32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
    if pid != std::process::id() as i32 {
        return None;
    }
    Some(3)
}

fn set_world_rw(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o666))
}

fn bind_fresh(path: &Path) -> io::Result<UnixListener> {
    // A stale socket file from a previous, uncleanly-terminated run must be
    // removed before bind, or the new bind fails with `AddrInUse`.
    if path.exists() {
        fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    set_world_rw(path)?;
    Ok(listener)
}

fn adopt_inherited(fd: RawFd) -> io::Result<UnixListener> {
    let std_listener = unsafe { StdUnixListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(std_listener))
}

/// Removes the control and debug socket files. Call after the event loop
/// returns from a clean shutdown; a crash leaves them for the next run's
/// `bind_fresh` to clear.
pub fn unlink_sockets(control_path: &Path, debug_path: Option<&Path>) {
    let _ = fs::remove_file(control_path);
    if let Some(p) = debug_path {
        let _ = fs::remove_file(p);
    }
}

/// Retrieves the peer's pid and program name over `SO_PEERCRED`, falling
/// back to `/proc/<pid>/cmdline`'s basename. Best-effort: a failure here is
/// diagnostic-only and never blocks registration (it only affects what
/// shows up in logs and the debug dump).
fn peer_credentials(fd: RawFd) -> (Option<i32>, Option<String>) {
    let mut cred: libc::ucred = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut libc::ucred as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        warn!(fd, "could not read peer credentials from socket");
        return (None, None);
    }
    let pid = cred.pid;
    let cmdline = fs::read(format!("/proc/{pid}/cmdline"))
        .ok()
        .and_then(|bytes| {
            let text = String::from_utf8_lossy(&bytes);
            let first = text.split('\u{0}').next().unwrap_or("").to_owned();
            if first.is_empty() {
                None
            } else {
                Some(first.rsplit('/').next().unwrap_or(&first).to_owned())
            }
        });
    (Some(pid), cmdline)
}

/// One open connection on the control socket: a partially-filled inbound
/// message buffer and a queue of bytes still waiting to go out.
struct Connection {
    stream: UnixStream,
    client_id: Option<ClientId>,
    pid: Option<i32>,
    cmdline: Option<String>,
    read_buf: [u8; WIRE_SIZE],
    read_len: usize,
    write_buf: VecDeque<u8>,
    writable_registered: bool,
}

impl Connection {
    fn new(stream: UnixStream, pid: Option<i32>, cmdline: Option<String>) -> Self {
        Self {
            stream,
            client_id: None,
            pid,
            cmdline,
            read_buf: [0u8; WIRE_SIZE],
            read_len: 0,
            write_buf: VecDeque::new(),
            writable_registered: false,
        }
    }

    fn queue(&mut self, bytes: [u8; WIRE_SIZE]) {
        self.write_buf.extend(bytes);
    }

    /// Writes as much of the queue as the socket accepts right now.
    /// `Ok(true)` means the queue fully drained; `Ok(false)` means some of
    /// it is still buffered for the next writable event.
    fn flush(&mut self) -> io::Result<bool> {
        while !self.write_buf.is_empty() {
            let (front, _) = self.write_buf.as_slices();
            match self.stream.write(front) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    self.write_buf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

/// A diagnostic-socket connection: write-only, closed once the dump has
/// fully drained.
struct DebugConn {
    stream: UnixStream,
    payload: Vec<u8>,
    sent: usize,
}

/// Feeds [`Broker`] outbound messages onto real sockets, looking up each
/// recipient's connection by the client-id-to-token table maintained by
/// [`Server`].
struct SocketOutbound<'a> {
    connections: &'a mut HashMap<Token, Connection>,
    client_tokens: &'a HashMap<ClientId, Token>,
}

impl Outbound for SocketOutbound<'_> {
    fn send(&mut self, to: ClientId, msg: Message) -> bool {
        let Some(&token) = self.client_tokens.get(&to) else {
            warn!(client = to.0, "no connection for outbound message, dropping");
            return false;
        };
        let Some(conn) = self.connections.get_mut(&token) else {
            return false;
        };
        conn.queue(msg.into_raw().to_bytes());
        match conn.flush() {
            Ok(_) => true,
            Err(e) => {
                warn!(conn = token.0, error = %e, "send failed, dropping connection");
                false
            }
        }
    }
}

/// A cloneable handle that wakes the event loop and asks it to exit. A
/// signal handler (installed by the daemon binary, which owns process
/// lifecycle concerns) calls [`ShutdownHandle::trigger`]; the loop itself
/// never touches signals directly.
#[derive(Clone)]
pub struct ShutdownHandle {
    waker: Arc<mio::Waker>,
    flag: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// The event loop: owns the poller, the listening sockets, and every open
/// connection's buffered state.
pub struct Server {
    poll: Poll,
    waker: Arc<mio::Waker>,
    shutdown: Arc<AtomicBool>,
    control: UnixListener,
    debug: Option<UnixListener>,
    connections: HashMap<Token, Connection>,
    debug_connections: HashMap<Token, DebugConn>,
    client_tokens: HashMap<ClientId, Token>,
    next_token: usize,
    shutting_down: bool,
}

impl Server {
    /// Binds the control socket (adopting a supervisor-passed fd if
    /// [`inherited_listen_fd`] found one) and, unless path truncation made
    /// it collide with the control socket, the debug socket.
    pub fn bind(
        inherited_control_fd: Option<RawFd>,
        control_path: &Path,
        debug_path: Option<&Path>,
    ) -> io::Result<Server> {
        let mut control = match inherited_control_fd {
            Some(fd) => adopt_inherited(fd)?,
            None => bind_fresh(control_path)?,
        };
        let mut debug = match debug_path {
            Some(p) => Some(bind_fresh(p)?),
            None => None,
        };

        let poll = Poll::new()?;
        let waker = Arc::new(mio::Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry()
            .register(&mut control, CONTROL_TOKEN, Interest::READABLE)?;
        if let Some(d) = debug.as_mut() {
            poll.registry()
                .register(d, DEBUG_TOKEN, Interest::READABLE)?;
        }

        Ok(Server {
            poll,
            waker,
            shutdown: Arc::new(AtomicBool::new(false)),
            control,
            debug,
            connections: HashMap::new(),
            debug_connections: HashMap::new(),
            client_tokens: HashMap::new(),
            next_token: FIRST_CONN_TOKEN,
            shutting_down: false,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            waker: Arc::clone(&self.waker),
            flag: Arc::clone(&self.shutdown),
        }
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Runs until a [`ShutdownHandle`] fires. `initial_dispatch` lets the
    /// caller register startup bookkeeping (currently unused, reserved for
    /// symmetry with the binary's setup phase).
    pub fn run(&mut self, broker: &mut Broker) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, None)?;
            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {
                        if self.shutdown.load(Ordering::SeqCst) {
                            self.shutting_down = true;
                        }
                    }
                    CONTROL_TOKEN => self.accept_control()?,
                    DEBUG_TOKEN => self.accept_debug(broker)?,
                    token if self.debug_connections.contains_key(&token) => {
                        self.drive_debug(token);
                    }
                    token => {
                        if event.is_readable() {
                            self.readable(token, broker)?;
                        }
                        if event.is_writable() && self.connections.contains_key(&token) {
                            self.writable(token, broker);
                        }
                    }
                }
            }
            if self.shutting_down {
                return Ok(());
            }
        }
    }

    fn accept_control(&mut self) -> io::Result<()> {
        let mut accepted = Vec::new();
        loop {
            match self.control.accept() {
                Ok((stream, _)) => accepted.push(stream),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        for mut stream in accepted {
            let (pid, cmdline) = peer_credentials(stream.as_raw_fd());
            let token = self.alloc_token();
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)?;
            debug!(
                conn = token.0,
                pid,
                cmdline = cmdline.as_deref().unwrap_or("unknown"),
                "accepted control connection"
            );
            self.connections
                .insert(token, Connection::new(stream, pid, cmdline));
        }
        Ok(())
    }

    fn accept_debug(&mut self, broker: &Broker) -> io::Result<()> {
        let mut accepted = Vec::new();
        if let Some(listener) = self.debug.as_ref() {
            loop {
                match listener.accept() {
                    Ok((stream, _)) => accepted.push(stream),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }
        for mut stream in accepted {
            let token = self.alloc_token();
            self.poll
                .registry()
                .register(&mut stream, token, Interest::WRITABLE)?;
            let payload = diagnostics::dump(broker).into_bytes();
            self.debug_connections
                .insert(token, DebugConn { stream, payload, sent: 0 });
        }
        Ok(())
    }

    fn readable(&mut self, token: Token, broker: &mut Broker) -> io::Result<()> {
        loop {
            let mut completed: Option<RawMessage> = None;
            let mut gone = false;
            {
                let Some(conn) = self.connections.get_mut(&token) else {
                    return Ok(());
                };
                match conn.stream.read(&mut conn.read_buf[conn.read_len..]) {
                    Ok(0) => gone = true,
                    Ok(n) => {
                        conn.read_len += n;
                        if conn.read_len == WIRE_SIZE {
                            completed = Some(RawMessage::from_bytes(conn.read_buf));
                            conn.read_len = 0;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => gone = true,
                }
            }
            if gone {
                self.drop_connection(token, broker);
                return Ok(());
            }
            if let Some(raw) = completed {
                self.dispatch(token, raw, broker);
            }
        }
    }

    fn writable(&mut self, token: Token, broker: &mut Broker) {
        let flushed = self.connections.get_mut(&token).map(Connection::flush);
        match flushed {
            Some(Ok(true)) => {
                if let Some(conn) = self.connections.get_mut(&token) {
                    if conn.writable_registered {
                        let _ = self.poll.registry().reregister(
                            &mut conn.stream,
                            token,
                            Interest::READABLE,
                        );
                        conn.writable_registered = false;
                    }
                }
            }
            Some(Ok(false)) => {}
            Some(Err(e)) => {
                warn!(conn = token.0, error = %e, "write failed, dropping connection");
                self.drop_connection(token, broker);
            }
            None => {}
        }
    }

    fn drive_debug(&mut self, token: Token) {
        let mut done = false;
        if let Some(conn) = self.debug_connections.get_mut(&token) {
            loop {
                if conn.sent >= conn.payload.len() {
                    done = true;
                    break;
                }
                match conn.stream.write(&conn.payload[conn.sent..]) {
                    Ok(0) => {
                        done = true;
                        break;
                    }
                    Ok(n) => conn.sent += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        done = true;
                        break;
                    }
                }
            }
        }
        if done {
            if let Some(mut conn) = self.debug_connections.remove(&token) {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
        }
    }

    fn drop_connection(&mut self, token: Token, broker: &mut Broker) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut conn.stream);
        if let Some(client_id) = conn.client_id {
            self.client_tokens.remove(&client_id);
            info!(client = client_id.0, "connection closed, disconnecting client");
            let mut out = SocketOutbound {
                connections: &mut self.connections,
                client_tokens: &self.client_tokens,
            };
            broker.disconnect(client_id, &mut out);
        }
    }

    /// Sends an error reply directly to `token`, bypassing the client-id
    /// lookup `SocketOutbound` needs (registration may not have succeeded
    /// yet, or may be the very message that failed).
    fn send_error_reply(&mut self, token: Token, reply: Message) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.queue(reply.into_raw().to_bytes());
        match conn.flush() {
            Ok(true) => {}
            Ok(false) => {
                if !conn.writable_registered {
                    let _ = self.poll.registry().reregister(
                        &mut conn.stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    );
                    conn.writable_registered = true;
                }
            }
            Err(e) => warn!(conn = token.0, error = %e, "failed to send error reply"),
        }
    }

    fn dispatch(&mut self, token: Token, raw: RawMessage, broker: &mut Broker) {
        let msg = match raw.into_message(Direction::ClientToBroker) {
            Ok(m) => m,
            Err(code) => {
                warn!(conn = token.0, opcode = raw.opcode, %code, "rejecting malformed message");
                return;
            }
        };
        let from = ClientId(msg.client_id);
        let pid = self.connections.get(&token).and_then(|c| c.pid);
        let cmdline = self
            .connections
            .get(&token)
            .and_then(|c| c.cmdline.clone());

        let result = {
            let mut out = SocketOutbound {
                connections: &mut self.connections,
                client_tokens: &self.client_tokens,
            };
            match msg.opcode {
                Opcode::Register => {
                    let (bidi, donation) = unpack_register_arg(msg.param);
                    let conn = ConnId(token.0 as i32);
                    broker.register(conn, from, pid, cmdline, bidi, donation, &mut out)
                }
                Opcode::Request => {
                    broker.request_or_reserve(from, RequestKind::Request, msg.param, &mut out)
                }
                Opcode::Reserve => {
                    broker.request_or_reserve(from, RequestKind::Reserve, msg.param, &mut out)
                }
                Opcode::Return => broker.handle_return(from, msg.param, &mut out),
                Opcode::Share => broker.handle_share_or_deny(from, msg.param, &mut out),
                Opcode::Deny => broker.handle_share_or_deny(from, 0, &mut out),
                Opcode::Terminate => broker.terminate(from, &mut out),
                Opcode::Query => broker.query(from, &mut out),
                Opcode::Total => broker.total(from, &mut out),
                Opcode::Status => {
                    info!("{}", diagnostics::dump(broker));
                    Ok(())
                }
                // Accepted on the wire but not a client-initiated request;
                // a client sending either is a no-op rather than an error.
                Opcode::QueryAvailable | Opcode::Available => Ok(()),
            }
        };

        match result {
            Ok(()) => {
                if msg.opcode == Opcode::Register {
                    self.client_tokens.insert(from, token);
                    if let Some(conn) = self.connections.get_mut(&token) {
                        conn.client_id = Some(from);
                    }
                }
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(
                    conn = token.0,
                    client = from.0,
                    error = %e,
                    "contract violation, broker exiting"
                );
                std::process::exit(1);
            }
            Err(e) => {
                debug!(conn = token.0, client = from.0, error = %e, "rejecting client message");
                let reply = Message::new(
                    msg.client_id,
                    msg.opcode,
                    membroker_proto::tag_bad_pages(e.as_wire_error()),
                );
                self.send_error_reply(token, reply);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn no_inherited_fd_without_listen_fds() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
        assert_eq!(inherited_listen_fd(), None);
    }

    #[test]
    fn no_inherited_fd_when_pid_does_not_match() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LISTEN_FDS", "1");
        std::env::set_var("LISTEN_PID", "1");
        assert_eq!(inherited_listen_fd(), None);
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
    }

    #[test]
    fn inherits_fd_three_when_addressed_to_this_process() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LISTEN_FDS", "1");
        std::env::set_var("LISTEN_PID", std::process::id().to_string());
        assert_eq!(inherited_listen_fd(), Some(3));
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
    }

    #[test]
    fn zero_listen_fds_is_treated_as_absent() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("LISTEN_FDS", "0");
        std::env::set_var("LISTEN_PID", std::process::id().to_string());
        assert_eq!(inherited_listen_fd(), None);
        std::env::remove_var("LISTEN_FDS");
        std::env::remove_var("LISTEN_PID");
    }
}
