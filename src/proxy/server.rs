//! Readiness loop
//!
//! One `mio::Poll` drives everything: the listener and both sockets of
//! every live connection. Sockets are registered once with read and write
//! interest; flow control happens at the connection, which only acts on a
//! write-readiness bit when it has buffered bytes for that socket. An idle
//! iteration therefore performs one readiness wait and no socket I/O.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};

use crate::error::SetupError;
use crate::proxy::connection::{Connection, Side};
use crate::timing::Timers;
use crate::trace::TraceWriter;

const LISTENER: Token = Token(0);

/// First connection id of a run. Seeding from the pid keeps id ranges from
/// different runs visually distinct in a merged trace.
pub(crate) fn initial_conn_id() -> u64 {
    std::process::id() as u64 * 1_000_000_000
}

pub struct Proxy {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    upstream: SocketAddr,
    /// Value substituted into rewritten `Host:` headers.
    host_header: String,
    trace: Rc<RefCell<TraceWriter>>,
    timers: Arc<Timers>,
    connections: HashMap<u64, Connection>,
    tokens: HashMap<Token, (u64, Side)>,
    next_token: usize,
    next_conn_id: u64,
}

impl Proxy {
    /// Bind the loopback listener and resolve nothing further; the
    /// upstream address was resolved once by the caller.
    pub fn bind(
        port: u16,
        upstream: SocketAddr,
        host_header: String,
        trace: TraceWriter,
        timers: Arc<Timers>,
    ) -> Result<Self, SetupError> {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut listener =
            TcpListener::bind(addr).map_err(|source| SetupError::Bind { port, source })?;
        let poll = Poll::new().map_err(SetupError::Register)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(SetupError::Register)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener,
            upstream,
            host_header,
            trace: Rc::new(RefCell::new(trace)),
            timers,
            connections: HashMap::new(),
            tokens: HashMap::new(),
            next_token: 1,
            next_conn_id: initial_conn_id(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn run(&mut self) -> Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One loop iteration: wait for readiness, step every touched
    /// connection, then accept whatever is pending on the listener.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.timers.io_wait.start();
        let waited = self.poll.poll(&mut self.events, timeout);
        self.timers.io_wait.stop();
        if let Err(e) = waited {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e).context("readiness wait failed");
        }

        let mut touched: Vec<u64> = Vec::new();
        let mut accept_ready = false;
        for event in self.events.iter() {
            match event.token() {
                LISTENER => accept_ready = true,
                token => {
                    if let Some(&(conn_id, side)) = self.tokens.get(&token) {
                        if let Some(conn) = self.connections.get_mut(&conn_id) {
                            conn.note_event(side, event);
                            touched.push(conn_id);
                        }
                    }
                }
            }
        }
        touched.sort_unstable();
        touched.dedup();

        for conn_id in touched {
            let Some(conn) = self.connections.get_mut(&conn_id) else {
                continue;
            };
            match conn.process() {
                Ok(true) => {}
                Ok(false) => self.remove_connection(conn_id),
                Err(e) if e.is_fatal() => {
                    return Err(e).context("trace sink failed");
                }
                Err(e) => {
                    tracing::error!(conn_id, error = %e, "connection aborted");
                    if let Some(conn) = self.connections.get_mut(&conn_id) {
                        match conn.shutdown() {
                            Err(se) if se.is_fatal() => {
                                return Err(se).context("trace sink failed");
                            }
                            Err(se) => tracing::warn!(conn_id, error = %se, "shutdown failed"),
                            Ok(()) => {}
                        }
                    }
                    self.remove_connection(conn_id);
                }
            }
        }

        if accept_ready {
            self.accept_new_clients()?;
        }
        Ok(())
    }

    fn accept_new_clients(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((client, peer)) => {
                    if let Err(e) = self.start_connection(client) {
                        tracing::warn!(%peer, error = %e, "dropping client, upstream setup failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("accept failed"),
            }
        }
    }

    fn start_connection(&mut self, mut client: TcpStream) -> io::Result<()> {
        let mut server = TcpStream::connect(self.upstream)?;
        let client_token = Token(self.next_token);
        let server_token = Token(self.next_token + 1);
        self.next_token += 2;

        let registry = self.poll.registry();
        registry.register(
            &mut client,
            client_token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        registry.register(
            &mut server,
            server_token,
            Interest::READABLE | Interest::WRITABLE,
        )?;

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        let connection = Connection::new(
            conn_id,
            client,
            server,
            client_token,
            server_token,
            self.host_header.clone(),
            self.trace.clone(),
            self.timers.clone(),
        );
        self.tokens.insert(client_token, (conn_id, Side::Client));
        self.tokens.insert(server_token, (conn_id, Side::Server));
        self.connections.insert(conn_id, connection);
        tracing::info!(conn_id, "accepted new client");
        Ok(())
    }

    fn remove_connection(&mut self, conn_id: u64) {
        if let Some(mut conn) = self.connections.remove(&conn_id) {
            self.tokens.remove(&conn.client_token);
            self.tokens.remove(&conn.server_token);
            let registry = self.poll.registry();
            let _ = registry.deregister(conn.client_mut());
            let _ = registry.deregister(conn.server_mut());
        }
    }
}
