//! The proxy container: listening sockets, the session registry, and the
//! configuration shared by every session.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use http::StatusCode;
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tracing::{debug, error, info, trace};

use crate::channel::State;
use crate::config::ProxyConfig;
use crate::headers::HeaderSieve;
use crate::pages::ErrorPages;
use crate::resolver::Resolver;
use crate::session::Session;
use crate::stats::{self, Counters};

/// Per-session registry entry: the live channel states and open-channel
/// count the debug dump reads.
#[derive(Clone)]
pub(crate) struct SessionEntry {
    pub(crate) request_state: Rc<Cell<State>>,
    pub(crate) response_state: Rc<Cell<State>>,
    pub(crate) opened: Rc<Cell<u32>>,
}

impl SessionEntry {
    fn new() -> SessionEntry {
        SessionEntry {
            request_state: Rc::new(Cell::new(State::Created)),
            response_state: Rc::new(Cell::new(State::Created)),
            opened: Rc::new(Cell::new(0)),
        }
    }
}

/// State shared between the accept loops, the sessions, and observers.
pub(crate) struct Shared {
    outbound: Option<SocketAddr>,
    receive_timeout: Duration,
    connect_timeout: Duration,
    resolve_timeout: Duration,
    sieve: HeaderSieve,
    pages: ErrorPages,
    resolver: Resolver,
    counters: Counters,
    sessions: RefCell<BTreeMap<u64, SessionEntry>>,
    next_id: Cell<u64>,
}

impl Shared {
    pub(crate) fn outbound_endpoint(&self) -> Option<SocketAddr> {
        self.outbound
    }

    pub(crate) fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn resolve_timeout(&self) -> Duration {
        self.resolve_timeout
    }

    pub(crate) fn sieve(&self) -> &HeaderSieve {
        &self.sieve
    }

    pub(crate) fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn error_page(&self, status: StatusCode) -> Option<&Bytes> {
        self.pages.get(status)
    }

    fn next_session_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    fn insert_session(&self, id: u64, entry: SessionEntry) {
        let prev = self.sessions.borrow_mut().insert(id, entry);
        assert!(prev.is_none(), "duplicate session id {}", id);
        self.counters.increment("sessions_started");
    }

    pub(crate) fn remove_session(&self, id: u64) {
        let removed = self.sessions.borrow_mut().remove(&id);
        assert!(removed.is_some(), "session {} erased twice", id);
        self.counters.increment("sessions_finished");
    }

    /// One line per live session: id, request-channel state,
    /// response-channel state, open-channel count.
    pub(crate) fn dump(&self) -> String {
        let mut out = String::new();
        for (id, entry) in self.sessions.borrow().iter() {
            let _ = writeln!(
                out,
                "{} reqch: {} rspch: {} opened: {}",
                id,
                entry.request_state.get(),
                entry.response_state.get(),
                entry.opened.get(),
            );
        }
        out
    }
}

/// The proxy: bound listeners plus everything sessions share.
pub struct Proxy {
    shared: Rc<Shared>,
    listeners: Vec<TcpListener>,
    addrs: Vec<SocketAddr>,
}

/// A cloneable observer handle, used by the statistics socket and tests.
#[derive(Clone)]
pub struct ProxyHandle {
    shared: Rc<Shared>,
}

impl Proxy {
    /// Builds the sieve and error-page table, starts the resolver backend,
    /// and binds one listener per configured endpoint (and the statistics
    /// socket when configured). Must run inside the proxy's `LocalSet`.
    pub async fn bind(config: ProxyConfig) -> crate::Result<Proxy> {
        config.validate()?;
        let sieve = HeaderSieve::build(&config.allow_headers, &config.rename_headers)?;
        let pages = ErrorPages::load(&config.error_pages);
        let counters = Counters::new();
        let resolver = Resolver::start(&config, counters.clone()).await?;

        let mut listeners = Vec::with_capacity(config.listen.len());
        let mut addrs = Vec::with_capacity(config.listen.len());
        for &endpoint in &config.listen {
            let listener = bind_listener(endpoint).map_err(crate::Error::new_listen)?;
            let addr = listener.local_addr().map_err(crate::Error::new_listen)?;
            info!("listening on {}", addr);
            addrs.push(addr);
            listeners.push(listener);
        }

        let outbound = config
            .outbound_http
            .filter(|addr| !(addr.ip().is_unspecified() && addr.port() == 0));

        let shared = Rc::new(Shared {
            outbound,
            receive_timeout: config.receive_timeout,
            connect_timeout: config.connect_timeout,
            resolve_timeout: config.resolve_timeout,
            sieve,
            pages,
            resolver,
            counters,
            sessions: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        });

        if let Some(path) = &config.stat_socket {
            // a previous run may have left the socket file behind
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path).map_err(crate::Error::new_listen)?;
            info!("statistics socket at {}", path.display());
            tokio::task::spawn_local(stats::serve(listener, shared.clone()));
        }

        Ok(Proxy {
            shared,
            listeners,
            addrs,
        })
    }

    /// The bound listener addresses, in configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    pub fn handle(&self) -> ProxyHandle {
        ProxyHandle {
            shared: self.shared.clone(),
        }
    }

    /// Accepts connections forever. Must run inside the proxy's `LocalSet`.
    pub async fn run(self) -> crate::Result<()> {
        let Proxy {
            shared, listeners, ..
        } = self;
        let accepts = listeners
            .into_iter()
            .map(|listener| accept_loop(shared.clone(), listener));
        futures_util::future::join_all(accepts).await;
        Ok(())
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy").field("addrs", &self.addrs).finish()
    }
}

impl ProxyHandle {
    /// Renders the per-session debug dump.
    pub fn dump(&self) -> String {
        self.shared.dump()
    }

    /// The daemon-wide counter registry.
    pub fn counters(&self) -> Counters {
        self.shared.counters.clone()
    }

    /// Number of sessions currently registered.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.borrow().len()
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("sessions", &self.session_count())
            .finish()
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(shared: Rc<Shared>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                shared.counters.increment("accepts");
                let id = shared.next_session_id();
                trace!(id, %remote, "accepted connection");
                let entry = SessionEntry::new();
                shared.insert_session(id, entry.clone());
                let session = Session::new(id, shared.clone(), stream, entry);
                tokio::task::spawn_local(session.run());
            }
            Err(err) if is_connection_error(&err) => {
                debug!("accepted connection already errored: {}", err);
            }
            Err(err) => {
                // resource exhaustion (EMFILE and friends); back off so the
                // loop does not spin
                error!("accept error: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Errors that only affect the connection being accepted; the next accept
/// may well succeed immediately.
fn is_connection_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared_for_tests() -> Shared {
        Shared {
            outbound: None,
            receive_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            resolve_timeout: Duration::from_secs(1),
            sieve: HeaderSieve::build(&[], &[]).unwrap(),
            pages: ErrorPages::empty(),
            resolver: Resolver::disconnected(),
            counters: Counters::new(),
            sessions: RefCell::new(BTreeMap::new()),
            next_id: Cell::new(0),
        }
    }

    #[test]
    fn session_ids_are_monotonic() {
        let shared = shared_for_tests();
        assert_eq!(shared.next_session_id(), 0);
        assert_eq!(shared.next_session_id(), 1);
        assert_eq!(shared.next_session_id(), 2);
    }

    #[test]
    fn dump_renders_one_line_per_session() {
        let shared = shared_for_tests();
        shared.insert_session(3, SessionEntry::new());
        let entry = SessionEntry::new();
        entry.opened.set(2);
        entry.request_state.set(State::WaitingInput);
        entry.response_state.set(State::WaitingOutput);
        shared.insert_session(1, entry);

        let dump = shared.dump();
        let lines: Vec<&str> = dump.lines().collect();
        // ordered by session id
        assert_eq!(
            lines,
            vec![
                "1 reqch: waiting_input rspch: waiting_output opened: 2",
                "3 reqch: created rspch: created opened: 0",
            ]
        );
    }

    #[test]
    #[should_panic(expected = "duplicate session id")]
    fn duplicate_session_id_is_fatal() {
        let shared = shared_for_tests();
        shared.insert_session(7, SessionEntry::new());
        shared.insert_session(7, SessionEntry::new());
    }

    #[test]
    #[should_panic(expected = "erased twice")]
    fn double_erase_is_fatal() {
        let shared = shared_for_tests();
        shared.insert_session(7, SessionEntry::new());
        shared.remove_session(7);
        shared.remove_session(7);
    }

    #[test]
    fn removal_removes_exactly_one_entry() {
        let shared = shared_for_tests();
        shared.insert_session(1, SessionEntry::new());
        shared.insert_session(2, SessionEntry::new());
        shared.remove_session(1);
        assert_eq!(shared.sessions.borrow().len(), 1);
        assert!(shared.sessions.borrow().contains_key(&2));
    }
}
