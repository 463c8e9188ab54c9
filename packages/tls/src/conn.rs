//! Handshake orchestration and the transfer interface
//!
//! [`TlsEngine::open`] binds a connected, non-blocking socket to a new
//! backend session, offers ALPN and resumption, and pumps the handshake
//! under the connect timeout. The resulting [`TlsChannel`] provides
//! timeout-aware reads and writes and the bidirectional close.

use std::io::{self, Read as _, Write as _};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, HandshakeKind};
use tokio::io::{Interest, Ready};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::engine::TlsEngine;
use crate::error::{TlsError, map_backend_error};
use crate::pins::PinVerdict;
use crate::stats::{HttpProtocol, TlsStats, tls_version_id};
use crate::verify::HandshakeState;

/// Per-connection knobs of [`TlsEngine::open_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    /// Skip the revocation pipeline for this connection. Meant for the
    /// sub-connections an OCSP transport opens to reach a responder over
    /// HTTPS; chain verification against the trust store still applies.
    pub revocation_exempt: bool,
}

/// Transfer deadline. A negative millisecond value normalizes to
/// [`Timeout::Unbounded`]; zero means non-blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Unbounded,
    Zero,
    In(Duration),
}

impl Timeout {
    pub fn from_millis(ms: i64) -> Self {
        if ms < 0 {
            Timeout::Unbounded
        } else if ms == 0 {
            Timeout::Zero
        } else {
            Timeout::In(Duration::from_millis(ms as u64))
        }
    }
}

/// Non-blocking socket adapter for the backend's record I/O.
struct SockIo<'a>(&'a TcpStream);

impl io::Read for SockIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl io::Write for SockIo<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TlsEngine {
    /// Runs a TLS handshake over a connected socket.
    ///
    /// `connect_timeout` bounds every readiness wait of the handshake pump;
    /// `None` waits indefinitely. On failure the partially built session is
    /// dropped and the error kind tells certificate failures
    /// ([`TlsError::Certificate`]) apart from protocol failures
    /// ([`TlsError::Handshake`]).
    pub async fn open(
        &self,
        stream: TcpStream,
        hostname: &str,
        connect_timeout: Option<Duration>,
    ) -> Result<TlsChannel, TlsError> {
        self.open_with(stream, hostname, connect_timeout, ConnectOptions::default())
            .await
    }

    pub async fn open_with(
        &self,
        stream: TcpStream,
        hostname: &str,
        connect_timeout: Option<Duration>,
        options: ConnectOptions,
    ) -> Result<TlsChannel, TlsError> {
        if hostname.is_empty() {
            return Err(TlsError::Invalid("hostname must not be empty"));
        }

        let shared = self.shared();
        let state = Arc::new(HandshakeState::new(hostname, options.revocation_exempt));
        let config = shared.client_config(&state)?;

        if !shared.config.check_hostname {
            info!("host name check disabled, server certificate's subject name will not be checked");
        }

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| TlsError::Invalid("hostname is not a valid server name"))?;
        // SNI derives from the server name; ALPN and the resumption store
        // were installed into the config
        let mut conn = ClientConnection::new(config, server_name)
            .map_err(|e| TlsError::Handshake(e.to_string()))?;

        match &shared.config.tls_session_cache {
            Some(cache) if cache.contains(hostname) => {
                debug!("found cached session data for host '{hostname}'");
            }
            Some(_) => debug!("no cached TLS session available, will run a full handshake"),
            None => {}
        }

        if let Err(err) = drive_handshake(&mut conn, &stream, connect_timeout).await {
            return Err(err);
        }

        let resumed = conn.handshake_kind() == Some(HandshakeKind::Resumed);
        debug!(
            "handshake completed{}",
            if resumed {
                " (resumed session)"
            } else {
                " (full handshake - not resumed)"
            }
        );

        let alpn_protocol = conn
            .alpn_protocol()
            .map(|proto| String::from_utf8_lossy(proto).into_owned());
        let http_protocol = if conn.alpn_protocol() == Some(b"h2") {
            HttpProtocol::Http2
        } else {
            HttpProtocol::Http11
        };
        if let Some(proto) = &alpn_protocol {
            debug!("ALPN: server accepted protocol '{proto}'");
        }

        let stats = TlsStats {
            hostname: hostname.to_string(),
            alpn_protocol,
            version: tls_version_id(conn.protocol_version()),
            false_start: false,
            tcp_fast_open: false,
            resumed,
            http_protocol,
            cert_chain_size: state.chain_size(),
        };

        if shared.config.print_info {
            info!(
                "TLS established: version {:?}, cipher suite {:?}, ALPN {:?}",
                conn.protocol_version(),
                conn.negotiated_cipher_suite().map(|suite| suite.suite()),
                stats.alpn_protocol
            );
        }
        if let Some(callback) = &shared.config.tls_stats {
            callback(&stats);
        }

        Ok(TlsChannel {
            conn,
            stream,
            hpkp: state.hpkp(),
            stats,
        })
    }
}

async fn wait_ready(
    stream: &TcpStream,
    interest: Interest,
    timeout: Option<Duration>,
) -> Result<Ready, TlsError> {
    match timeout {
        None => stream
            .ready(interest)
            .await
            .map_err(|e| TlsError::Unknown(e.to_string())),
        Some(limit) => match tokio::time::timeout(limit, stream.ready(interest)).await {
            Ok(ready) => ready.map_err(|e| TlsError::Unknown(e.to_string())),
            Err(_) => Err(TlsError::Timeout),
        },
    }
}

/// Writes queued records until done or the socket would block. Returns
/// whether the socket blocked.
fn flush_records(conn: &mut ClientConnection, stream: &TcpStream) -> Result<bool, TlsError> {
    while conn.wants_write() {
        match conn.write_tls(&mut SockIo(stream)) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(true),
            Err(err) => return Err(TlsError::Handshake(err.to_string())),
        }
    }
    Ok(false)
}

/// The handshake pump: wait for readiness under the connect timeout, move
/// records in both directions, let the backend advance until the handshake
/// is complete. A timeout surfaces as [`TlsError::Timeout`].
async fn drive_handshake(
    conn: &mut ClientConnection,
    stream: &TcpStream,
    timeout: Option<Duration>,
) -> Result<(), TlsError> {
    while conn.is_handshaking() {
        let blocked = flush_records(conn, stream)?;
        if !conn.is_handshaking() {
            break;
        }

        let mut interest = Interest::READABLE;
        if blocked || conn.wants_write() {
            interest = interest | Interest::WRITABLE;
        }
        let ready = wait_ready(stream, interest, timeout).await?;

        if ready.is_readable() && conn.wants_read() {
            match conn.read_tls(&mut SockIo(stream)) {
                Ok(0) => {
                    return Err(TlsError::Handshake(
                        "connection closed during handshake".to_string(),
                    ));
                }
                Ok(_) => {
                    if let Err(err) = conn.process_new_packets() {
                        // give the backend a chance to send its alert
                        let _ = flush_records(conn, stream);
                        return Err(map_backend_error(err));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => return Err(TlsError::Handshake(err.to_string())),
            }
        }
    }

    // the final flight may still be queued
    while flush_records(conn, stream)? {
        wait_ready(stream, Interest::WRITABLE, timeout).await?;
    }
    Ok(())
}

/// An established TLS tunnel over a TCP socket.
#[derive(Debug)]
pub struct TlsChannel {
    conn: ClientConnection,
    stream: TcpStream,
    hpkp: PinVerdict,
    stats: TlsStats,
}

impl TlsChannel {
    /// Handshake statistics snapshot.
    pub fn stats(&self) -> &TlsStats {
        &self.stats
    }

    /// Pinning verdict recorded during chain verification.
    pub fn hpkp(&self) -> PinVerdict {
        self.hpkp
    }

    pub fn http_protocol(&self) -> HttpProtocol {
        self.stats.http_protocol
    }

    pub fn alpn_protocol(&self) -> Option<&str> {
        self.stats.alpn_protocol.as_deref()
    }

    pub fn is_resumed(&self) -> bool {
        self.stats.resumed
    }

    /// Reads at most `buf.len()` bytes from the tunnel.
    ///
    /// Returns 0 on a clean peer close, when `buf` is empty, or when a zero
    /// timeout finds no data. Steady-state backend errors are surfaced as
    /// [`TlsError::Unknown`] with the reason logged.
    pub async fn read(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TlsError> {
        match self.transfer_read(buf, timeout).await {
            Err(TlsError::Handshake(reason)) => {
                error!("TLS read error: {reason}");
                Err(TlsError::Unknown(reason))
            }
            other => other,
        }
    }

    /// Writes `buf` to the tunnel, returning the number of bytes accepted.
    ///
    /// Returns 0 when `buf` is empty or when a zero timeout finds the
    /// socket unwritable before anything was handed to the backend.
    pub async fn write(&mut self, buf: &[u8], timeout: Timeout) -> Result<usize, TlsError> {
        match self.transfer_write(buf, timeout).await {
            Err(TlsError::Handshake(reason)) => {
                error!("TLS write error: {reason}");
                Err(TlsError::Unknown(reason))
            }
            other => other,
        }
    }

    async fn transfer_read(&mut self, buf: &mut [u8], timeout: Timeout) -> Result<usize, TlsError> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            // hand out plaintext the backend already holds
            match self.conn.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(TlsError::Handshake(
                        "peer closed without close_notify".to_string(),
                    ));
                }
                Err(err) => return Err(TlsError::Handshake(err.to_string())),
            }

            if timeout != Timeout::Zero {
                let mut interest = Interest::READABLE;
                if self.conn.wants_write() {
                    interest = interest | Interest::WRITABLE;
                }
                wait_transfer(&self.stream, interest, timeout).await?;
            }

            if self.conn.wants_write() {
                flush_records(&mut self.conn, &self.stream)?;
            }

            match self.conn.read_tls(&mut SockIo(&self.stream)) {
                Ok(0) => {
                    // EOF: the next reader() call settles whether the peer
                    // closed cleanly
                    if let Err(err) = self.conn.process_new_packets() {
                        return Err(TlsError::Handshake(err.to_string()));
                    }
                }
                Ok(_) => {
                    if let Err(err) = self.conn.process_new_packets() {
                        return Err(TlsError::Handshake(err.to_string()));
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if timeout == Timeout::Zero {
                        return Ok(0);
                    }
                }
                Err(err) => return Err(TlsError::Handshake(err.to_string())),
            }
        }
    }

    async fn transfer_write(&mut self, buf: &[u8], timeout: Timeout) -> Result<usize, TlsError> {
        if buf.is_empty() {
            return Ok(0);
        }

        // plaintext is committed to the backend only once the socket is
        // writable; a would-block before that reports nothing written, in
        // both the zero-timeout and the bounded case
        match timeout {
            Timeout::Zero => {
                let probe =
                    tokio::time::timeout(Duration::ZERO, self.stream.ready(Interest::WRITABLE));
                match probe.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => return Err(TlsError::Unknown(err.to_string())),
                    Err(_) => return Ok(0),
                }
            }
            _ => {
                wait_transfer(&self.stream, Interest::WRITABLE, timeout).await?;
            }
        }

        let accepted = self
            .conn
            .writer()
            .write(buf)
            .map_err(|err| TlsError::Handshake(err.to_string()))?;

        loop {
            match self.conn.write_tls(&mut SockIo(&self.stream)) {
                Ok(_) => {
                    if !self.conn.wants_write() {
                        return Ok(accepted);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if timeout == Timeout::Zero {
                        // the committed records go out with a later write
                        // or the close
                        return Ok(accepted);
                    }
                    wait_transfer(&self.stream, Interest::WRITABLE, timeout).await?;
                }
                Err(err) => return Err(TlsError::Handshake(err.to_string())),
            }
        }
    }

    /// Closes the tunnel: sends close_notify, then drains until the peer's
    /// close_notify or EOF. The underlying socket is dropped afterwards.
    pub async fn close(mut self) {
        self.conn.send_close_notify();

        loop {
            match flush_records(&mut self.conn, &self.stream) {
                Ok(false) => break,
                Ok(true) => {
                    if self.stream.ready(Interest::WRITABLE).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }

        let mut scratch = [0u8; 1024];
        loop {
            match self.conn.read_tls(&mut SockIo(&self.stream)) {
                Ok(0) => return,
                Ok(_) => match self.conn.process_new_packets() {
                    Ok(io_state) => {
                        // discard pending plaintext so the close record is
                        // reachable
                        while self.conn.reader().read(&mut scratch).map(|n| n > 0).unwrap_or(false) {}
                        if io_state.peer_has_closed() {
                            return;
                        }
                    }
                    Err(_) => return,
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if self.stream.ready(Interest::READABLE).await.is_err() {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }
}

async fn wait_transfer(
    stream: &TcpStream,
    interest: Interest,
    timeout: Timeout,
) -> Result<Ready, TlsError> {
    match timeout {
        Timeout::Unbounded => wait_ready(stream, interest, None).await,
        Timeout::In(limit) => wait_ready(stream, interest, Some(limit)).await,
        Timeout::Zero => Err(TlsError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeouts_normalize_to_unbounded() {
        assert_eq!(Timeout::from_millis(-1), Timeout::Unbounded);
        assert_eq!(Timeout::from_millis(-500), Timeout::Unbounded);
        assert_eq!(Timeout::from_millis(0), Timeout::Zero);
        assert_eq!(
            Timeout::from_millis(250),
            Timeout::In(Duration::from_millis(250))
        );
    }

    #[test]
    fn connect_options_default_to_full_verification() {
        assert!(!ConnectOptions::default().revocation_exempt);
    }
}
