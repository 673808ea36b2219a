//! TLS envelope over TCP connections and acceptors, via rustls.
//!
//! A [`TlsConnection`] owns a plain [`TcpConnection`] and installs read and
//! write handlers that shuttle ciphertext between the TCP buffers and the
//! rustls engine, and plaintext between the engine and the TLS-level input
//! buffer. One extra phase precedes `Connected`: the handshake pump, which
//! alternates engine reads and writes until rustls reports completion.

use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};
use tracing::{debug, warn};

use crate::acceptor::{AcceptorStats, TcpAcceptor};
use crate::addr::HostPort;
use crate::chain::ByteChain;
use crate::config::{TcpAcceptorParams, TcpConnectionParams};
use crate::connection::{CloseDirective, TcpConnection};
use crate::error::{Error, Result, Status};
use crate::selector::Selector;

/// Configuration for a [`TlsConnection`].
#[derive(Clone)]
pub struct TlsConnectionParams {
    /// Parameters for the underlying TCP connection.
    pub tcp_params: TcpConnectionParams,
    /// Pre-built rustls client config, required for outbound connects.
    /// The application loads root certificates, ALPN, etc.
    pub client_config: Option<Arc<rustls::ClientConfig>>,
    /// SNI name for outbound connects; defaults to the remote host name.
    pub server_name: Option<String>,
}

/// Configuration for a [`TlsAcceptor`].
#[derive(Clone)]
pub struct TlsAcceptorParams {
    /// Parameters for the underlying TCP acceptor.
    pub tcp_params: TcpAcceptorParams,
    /// Pre-built rustls server config. The application loads certificates
    /// and keys.
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Server- or client-side rustls engine.
enum TlsEngine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsEngine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.read_tls(rd),
            TlsEngine::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            TlsEngine::Server(c) => c.write_tls(wr),
            TlsEngine::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> std::result::Result<rustls::IoState, rustls::Error> {
        match self {
            TlsEngine::Server(c) => c.process_new_packets(),
            TlsEngine::Client(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsEngine::Server(c) => c.reader(),
            TlsEngine::Client(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsEngine::Server(c) => c.writer(),
            TlsEngine::Client(c) => c.writer(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.wants_write(),
            TlsEngine::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsEngine::Server(c) => c.is_handshaking(),
            TlsEngine::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsEngine::Server(c) => c.send_close_notify(),
            TlsEngine::Client(c) => c.send_close_notify(),
        }
    }
}

type TlsConnectHandler = Box<dyn FnMut() + Send>;
type TlsReadHandler = Box<dyn FnMut() -> Result<()> + Send>;
type TlsCloseHandler = Box<dyn FnMut(&Status, CloseDirective) + Send>;

#[derive(Default)]
struct TlsHandlers {
    connect: Option<TlsConnectHandler>,
    read: Option<TlsReadHandler>,
    close: Option<TlsCloseHandler>,
}

struct TlsState {
    engine: Mutex<Option<TlsEngine>>,
    handshake_done: AtomicBool,
    /// Decrypted application data. Selector-thread access only.
    inbuf: Mutex<ByteChain>,
    handlers: Mutex<TlsHandlers>,
    client_config: Option<Arc<rustls::ClientConfig>>,
    server_name: Option<String>,
    detail_log: bool,
}

impl TlsState {
    /// Encrypt-and-forward everything the engine has pending.
    fn flush_tls(engine: &mut TlsEngine, tcp: &TcpConnection) -> Result<()> {
        let mut ciphertext = Vec::new();
        while engine.wants_write() {
            engine
                .write_tls(&mut ciphertext)
                .map_err(|err| Error::Internal(format!("TLS record write failed: {err}")))?;
        }
        if !ciphertext.is_empty() {
            tcp.write(&ciphertext);
        }
        Ok(())
    }

    /// The ciphertext pump run from the TCP read handler: feed bytes to
    /// the engine, surface plaintext, flush responses, detect handshake
    /// completion. Returns whether fresh plaintext arrived.
    fn pump(&self, tcp: &TcpConnection) -> Result<bool> {
        let mut engine_slot = self.engine.lock();
        let Some(engine) = engine_slot.as_mut() else {
            return Err(Error::FailedPrecondition(
                "TLS engine missing while pumping".into(),
            ));
        };
        let mut got_plaintext = false;
        loop {
            let consumed = {
                let mut tcp_in = tcp.inbuf();
                if tcp_in.is_empty() {
                    0
                } else {
                    engine.read_tls(&mut *tcp_in).map_err(|err| {
                        Error::Internal(format!("TLS record read failed: {err}"))
                    })?
                }
            };
            let io_state = engine
                .process_new_packets()
                .map_err(|err| Error::Internal(format!("TLS processing failed: {err}")))?;
            if io_state.plaintext_bytes_to_read() > 0 {
                let mut plain = vec![0u8; io_state.plaintext_bytes_to_read()];
                let mut reader = engine.reader();
                let mut filled = 0usize;
                while filled < plain.len() {
                    match reader.read(&mut plain[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            return Err(Error::Internal(format!(
                                "TLS plaintext read failed: {err}"
                            )))
                        }
                    }
                }
                if filled > 0 {
                    plain.truncate(filled);
                    self.inbuf.lock().append(bytes::Bytes::from(plain));
                    got_plaintext = true;
                }
            }
            Self::flush_tls(engine, tcp)?;
            if consumed == 0 {
                break;
            }
        }
        let finished = !engine.is_handshaking();
        drop(engine_slot);
        if finished && !self.handshake_done.swap(true, Ordering::AcqRel) {
            if self.detail_log {
                debug!("TLS handshake complete");
            }
            self.call_connect_handler();
        }
        Ok(got_plaintext)
    }

    fn call_connect_handler(&self) {
        let taken = self.handlers.lock().connect.take();
        if let Some(mut connect) = taken {
            connect();
            let mut handlers = self.handlers.lock();
            if handlers.connect.is_none() {
                handlers.connect = Some(connect);
            }
        }
    }

    fn call_read_handler(&self) -> Result<()> {
        let taken = self.handlers.lock().read.take();
        let Some(mut read) = taken else {
            return Err(Error::FailedPrecondition(
                "no read handler set for TLS connection".into(),
            ));
        };
        let result = read();
        let mut handlers = self.handlers.lock();
        if handlers.read.is_none() {
            handlers.read = Some(read);
        }
        result
    }

    fn call_close_handler(&self, status: &Status, directive: CloseDirective) {
        let taken = self.handlers.lock().close.take();
        if let Some(mut close) = taken {
            close(status, directive);
            let mut handlers = self.handlers.lock();
            if handlers.close.is_none() {
                handlers.close = Some(close);
            }
        }
    }
}

/// A TLS byte stream adapting a [`TcpConnection`].
pub struct TlsConnection {
    tcp: Arc<TcpConnection>,
    state: Arc<TlsState>,
}

impl TlsConnection {
    /// Create a client-side TLS connection; point it somewhere with
    /// [`connect`](Self::connect).
    pub fn new(selector: Arc<Selector>, params: TlsConnectionParams) -> Arc<TlsConnection> {
        let tcp = TcpConnection::new(selector, params.tcp_params.clone());
        let detail_log = params.tcp_params.detail_log;
        let state = Arc::new(TlsState {
            engine: Mutex::new(None),
            handshake_done: AtomicBool::new(false),
            inbuf: Mutex::new(ByteChain::new()),
            handlers: Mutex::new(TlsHandlers::default()),
            client_config: params.client_config,
            server_name: params.server_name,
            detail_log,
        });
        let this = Arc::new(TlsConnection {
            tcp: tcp.clone(),
            state: state.clone(),
        });
        Self::install_pumps(&tcp, &state);
        this
    }

    /// Adopt a freshly accepted TCP connection as the server side of a
    /// TLS session.
    pub(crate) fn accept(
        tcp: Arc<TcpConnection>,
        server_config: Arc<rustls::ServerConfig>,
        detail_log: bool,
    ) -> Result<Arc<TlsConnection>> {
        let engine = ServerConnection::new(server_config)
            .map_err(|err| Error::Internal(format!("creating TLS server session: {err}")))?;
        let state = Arc::new(TlsState {
            engine: Mutex::new(Some(TlsEngine::Server(engine))),
            handshake_done: AtomicBool::new(false),
            inbuf: Mutex::new(ByteChain::new()),
            handlers: Mutex::new(TlsHandlers::default()),
            client_config: None,
            server_name: None,
            detail_log,
        });
        let this = Arc::new(TlsConnection {
            tcp: tcp.clone(),
            state: state.clone(),
        });
        Self::install_pumps(&tcp, &state);
        Ok(this)
    }

    /// Wire the TCP-level handlers to the ciphertext pump.
    fn install_pumps(tcp: &Arc<TcpConnection>, state: &Arc<TlsState>) {
        let weak_tcp: Weak<TcpConnection> = Arc::downgrade(tcp);

        let pump_state = state.clone();
        let pump_tcp = weak_tcp.clone();
        tcp.set_read_handler(move || {
            let Some(tcp) = pump_tcp.upgrade() else {
                return Ok(());
            };
            if pump_state.pump(&tcp)? {
                pump_state.call_read_handler()?;
            }
            Ok(())
        });

        // On TCP connect the client engine already wants to send its
        // hello.
        let connect_state = state.clone();
        let connect_tcp = weak_tcp.clone();
        tcp.set_connect_handler(move || {
            let Some(tcp) = connect_tcp.upgrade() else {
                return;
            };
            let mut engine_slot = connect_state.engine.lock();
            if let Some(engine) = engine_slot.as_mut() {
                if let Err(err) = TlsState::flush_tls(engine, &tcp) {
                    drop(engine_slot);
                    warn!("TLS client hello failed: {err}");
                    tcp.force_close();
                }
            }
        });

        // The TCP write handler runs when outbuf drained; push any
        // pending handshake records.
        let write_state = state.clone();
        let write_tcp = weak_tcp.clone();
        tcp.set_write_handler(move || {
            let Some(tcp) = write_tcp.upgrade() else {
                return Ok(());
            };
            let mut engine_slot = write_state.engine.lock();
            if let Some(engine) = engine_slot.as_mut() {
                TlsState::flush_tls(engine, &tcp)?;
            }
            Ok(())
        });

        let close_state = state.clone();
        tcp.set_close_handler(move |status, directive| {
            close_state.call_close_handler(status, directive);
        });
    }

    /// Start connecting; the TLS handshake follows the TCP connect, and
    /// the connect handler fires when the handshake completes.
    pub fn connect(&self, remote_addr: &HostPort) -> Result<()> {
        let config = self.state.client_config.clone().ok_or_else(|| {
            Error::FailedPrecondition("TLS connect without a client config".into())
        })?;
        let name = match &self.state.server_name {
            Some(name) => name.clone(),
            None => remote_addr
                .host()
                .map(str::to_string)
                .or_else(|| remote_addr.ip().map(|ip| ip.to_string()))
                .ok_or_else(|| {
                    Error::InvalidArgument(format!(
                        "no server name derivable from {remote_addr}"
                    ))
                })?,
        };
        let server_name = ServerName::try_from(name.clone()).map_err(|err| {
            Error::InvalidArgument(format!("invalid TLS server name `{name}`: {err}"))
        })?;
        let engine = ClientConnection::new(config, server_name)
            .map_err(|err| Error::Internal(format!("creating TLS client session: {err}")))?;
        *self.state.engine.lock() = Some(TlsEngine::Client(engine));
        self.tcp.connect(remote_addr)
    }

    /// Encrypt and queue application bytes.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut engine_slot = self.state.engine.lock();
        let Some(engine) = engine_slot.as_mut() else {
            return Err(Error::FailedPrecondition(
                "TLS write before connect or accept".into(),
            ));
        };
        engine
            .writer()
            .write_all(data)
            .map_err(|err| Error::Internal(format!("TLS plaintext write failed: {err}")))?;
        TlsState::flush_tls(engine, &self.tcp)
    }

    /// Send `close_notify`, flush, then run the TCP flush-and-close.
    pub fn flush_and_close(&self) {
        {
            let mut engine_slot = self.state.engine.lock();
            if let Some(engine) = engine_slot.as_mut() {
                engine.send_close_notify();
                if let Err(err) = TlsState::flush_tls(engine, &self.tcp) {
                    warn!("flushing TLS close_notify failed: {err}");
                }
            }
        }
        self.tcp.flush_and_close();
    }

    pub fn force_close(&self) {
        self.tcp.force_close();
    }

    /// Decrypted input from the peer. Selector-thread access only.
    pub fn inbuf(&self) -> MutexGuard<'_, ByteChain> {
        self.state.inbuf.lock()
    }

    /// Whether the handshake finished.
    pub fn is_established(&self) -> bool {
        self.state.handshake_done.load(Ordering::Acquire)
    }

    pub fn get_local_address(&self) -> HostPort {
        self.tcp.get_local_address()
    }

    pub fn get_remote_address(&self) -> HostPort {
        self.tcp.get_remote_address()
    }

    /// The underlying TCP connection.
    pub fn tcp(&self) -> &Arc<TcpConnection> {
        &self.tcp
    }

    /// Runs when the TLS handshake completes.
    pub fn set_connect_handler(&self, handler: impl FnMut() + Send + 'static) {
        self.state.handlers.lock().connect = Some(Box::new(handler));
    }

    /// Runs when fresh plaintext lands in [`inbuf`](Self::inbuf).
    pub fn set_read_handler(&self, handler: impl FnMut() -> Result<()> + Send + 'static) {
        self.state.handlers.lock().read = Some(Box::new(handler));
    }

    /// Runs with the terminal status of the underlying connection.
    pub fn set_close_handler(
        &self,
        handler: impl FnMut(&Status, CloseDirective) + Send + 'static,
    ) {
        self.state.handlers.lock().close = Some(Box::new(handler));
    }

    pub fn clear_all_handlers(&self) {
        let mut handlers = self.state.handlers.lock();
        handlers.connect = None;
        handlers.read = None;
        handlers.close = None;
    }
}

impl fmt::Display for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tls{}", self.tcp)
    }
}

#[derive(Default)]
struct TlsAcceptorHandlers {
    accept: Option<Box<dyn FnMut(Arc<TlsConnection>) + Send>>,
}

struct TlsAcceptorState {
    server_config: Arc<rustls::ServerConfig>,
    detail_log: bool,
    handlers: Mutex<TlsAcceptorHandlers>,
    /// Connections still handshaking; kept alive until delivery or close.
    pending: Mutex<Vec<Arc<TlsConnection>>>,
}

impl TlsAcceptorState {
    fn on_tcp_accept(state: &Arc<TlsAcceptorState>, tcp_conn: Arc<TcpConnection>) {
        let tls_conn = match TlsConnection::accept(
            tcp_conn.clone(),
            state.server_config.clone(),
            state.detail_log,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                warn!("TLS session setup failed: {err}");
                tcp_conn.force_close();
                return;
            }
        };
        // Deliver once the handshake pump reports completion; drop the
        // pending entry if the connection dies first.
        let weak_conn = Arc::downgrade(&tls_conn);
        let deliver_state = state.clone();
        tls_conn.set_connect_handler(move || {
            let Some(conn) = weak_conn.upgrade() else {
                return;
            };
            TlsAcceptorState::deliver(&deliver_state, &conn);
        });
        let drop_state = state.clone();
        let drop_conn = Arc::downgrade(&tls_conn);
        tls_conn.set_close_handler(move |_status, directive| {
            if directive == CloseDirective::ReadWrite {
                if let Some(conn) = drop_conn.upgrade() {
                    TlsAcceptorState::forget(&drop_state, &conn);
                }
            }
        });
        state.pending.lock().push(tls_conn);
    }

    fn deliver(state: &Arc<TlsAcceptorState>, conn: &Arc<TlsConnection>) {
        Self::forget(state, conn);
        let taken = state.handlers.lock().accept.take();
        match taken {
            Some(mut accept) => {
                // The application installs its own handlers now.
                conn.set_connect_handler(|| {});
                conn.set_close_handler(|_, _| {});
                accept(conn.clone());
                let mut handlers = state.handlers.lock();
                if handlers.accept.is_none() {
                    handlers.accept = Some(accept);
                }
            }
            None => {
                warn!("no TLS accept handler, dropping connection {conn}");
                conn.force_close();
            }
        }
    }

    fn forget(state: &Arc<TlsAcceptorState>, conn: &Arc<TlsConnection>) {
        state
            .pending
            .lock()
            .retain(|pending| !Arc::ptr_eq(pending, conn));
    }
}

/// A TLS acceptor: a TCP acceptor whose accepted connections are wrapped
/// in server-side TLS sessions and delivered after their handshake.
pub struct TlsAcceptor {
    tcp: Arc<TcpAcceptor>,
    state: Arc<TlsAcceptorState>,
}

impl TlsAcceptor {
    pub fn new(selector: Arc<Selector>, params: TlsAcceptorParams) -> Arc<TlsAcceptor> {
        let detail_log = params.tcp_params.detail_log;
        let tcp = TcpAcceptor::new(selector, params.tcp_params);
        let state = Arc::new(TlsAcceptorState {
            server_config: params.server_config,
            detail_log,
            handlers: Mutex::new(TlsAcceptorHandlers::default()),
            pending: Mutex::new(Vec::new()),
        });
        let accept_state = state.clone();
        tcp.set_accept_handler(move |tcp_conn| {
            TlsAcceptorState::on_tcp_accept(&accept_state, tcp_conn);
        });
        Arc::new(TlsAcceptor { tcp, state })
    }

    pub fn listen(&self, local_addr: &HostPort) -> Result<()> {
        self.tcp.listen(local_addr)
    }

    pub fn close(&self) {
        self.tcp.close();
    }

    pub fn local_address(&self) -> HostPort {
        self.tcp.local_address()
    }

    pub fn stats(&self) -> &AcceptorStats {
        self.tcp.stats()
    }

    /// Receives every connection whose handshake completed.
    pub fn set_accept_handler(&self, handler: impl FnMut(Arc<TlsConnection>) + Send + 'static) {
        self.state.handlers.lock().accept = Some(Box::new(handler));
    }

    /// Peer filtering happens before the handshake, at the TCP layer.
    pub fn set_filter_handler(&self, handler: impl FnMut(&HostPort) -> bool + Send + 'static) {
        self.tcp.set_filter_handler(handler);
    }

    pub fn set_close_handler(&self, handler: impl FnMut(&Status) + Send + 'static) {
        self.tcp.set_close_handler(handler);
    }
}

impl fmt::Display for TlsAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tls{}", self.tcp)
    }
}
