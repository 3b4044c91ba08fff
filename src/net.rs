//! Transport layer: listening sockets and per-connection streams.
//!
//! A [`Transport`] is what a worker reads requests from and writes responses
//! to. It is either the raw non-blocking socket or a TLS session layered
//! over it; both are mio event sources so the worker reactor can register
//! them directly.

use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use mio::{Interest, Registry, Token};

use crate::error::ServerError;
use crate::sitefile::{PortDecl, SiteFile, TransportKind};

#[cfg(feature = "tls")]
use std::sync::Arc;

/// A connection's byte stream.
pub enum Transport {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream>),
}

impl Transport {
    fn socket_mut(&mut self) -> &mut TcpStream {
        match self {
            Transport::Plain(sock) => sock,
            #[cfg(feature = "tls")]
            Transport::Tls(tls) => &mut tls.sock,
        }
    }
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.read(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(sock) => sock.write(buf),
            #[cfg(feature = "tls")]
            Transport::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Transport::Plain(sock) => sock.flush(),
            #[cfg(feature = "tls")]
            Transport::Tls(tls) => tls.flush(),
        }
    }
}

impl Source for Transport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.socket_mut().register(registry, token, interests)
    }

    fn reregister(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.socket_mut().reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.socket_mut().deregister(registry)
    }
}

/// A server-side TLS session over a non-blocking socket.
#[cfg(feature = "tls")]
pub struct TlsStream {
    sock: TcpStream,
    conn: rustls::ServerConnection,
}

#[cfg(feature = "tls")]
impl TlsStream {
    /// Writes queued records until rustls has nothing left or the socket
    /// would block.
    fn write_tls(&mut self) -> io::Result<()> {
        while self.conn.wants_write() {
            if self.conn.write_tls(&mut self.sock)? == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
        }
        Ok(())
    }

    fn write_tls_lenient(&mut self) -> io::Result<()> {
        match self.write_tls() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other,
        }
    }
}

#[cfg(feature = "tls")]
impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                other => return other,
            }

            if self.conn.read_tls(&mut self.sock)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            // Handshake records may need to go out before more data arrives.
            self.write_tls_lenient()?;
        }
    }
}

#[cfg(feature = "tls")]
impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Refuse new plaintext while earlier records are still queued.
        self.write_tls()?;
        let n = self.conn.writer().write(buf)?;
        self.write_tls_lenient()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.writer().flush()?;
        self.write_tls()
    }
}

/// How connections accepted on one port are wrapped.
#[derive(Clone)]
pub enum PortContext {
    Plain,
    #[cfg(feature = "tls")]
    Tls(Arc<rustls::ServerConfig>),
}

impl PortContext {
    /// Sets up the transport for one declared port, loading TLS credentials
    /// where needed.
    ///
    /// # Errors
    /// - Returns `ServerError::Tls` if the key or certificate cannot be loaded,
    ///   or if the crate was built without the `tls` feature
    pub fn from_decl(decl: &PortDecl) -> Result<Self, ServerError> {
        match decl.transport {
            TransportKind::Tcp => Ok(PortContext::Plain),
            #[cfg(feature = "tls")]
            TransportKind::Tls => tls_config(decl).map(PortContext::Tls),
            #[cfg(not(feature = "tls"))]
            TransportKind::Tls => Err(ServerError::Tls {
                port: decl.number,
                message: "built without the tls feature".to_owned(),
            }),
        }
    }

    /// Makes an accepted socket non-blocking and layers the port's
    /// transport over it. The TLS handshake happens lazily on first I/O.
    ///
    /// # Arguments
    /// - `stream`: A connection accepted on this context's port
    ///
    /// # Returns
    /// - `io::Result<Transport>`: A stream ready to be registered with mio
    ///
    /// # Errors
    /// - Returns the I/O error if the socket cannot be made non-blocking
    /// - Returns `io::ErrorKind::Other` if rustls refuses to start a session
    pub fn wrap(&self, stream: std::net::TcpStream) -> io::Result<Transport> {
        stream.set_nonblocking(true)?;
        let sock = TcpStream::from_std(stream);
        match self {
            PortContext::Plain => Ok(Transport::Plain(sock)),
            #[cfg(feature = "tls")]
            PortContext::Tls(config) => {
                let conn = rustls::ServerConnection::new(config.clone())
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Ok(Transport::Tls(Box::new(TlsStream { sock, conn })))
            }
        }
    }
}

/// Builds the transport context for every declared port, in declaration order.
pub fn contexts(site: &SiteFile) -> Result<Vec<PortContext>, ServerError> {
    site.ports.iter().map(PortContext::from_decl).collect()
}

#[cfg(feature = "tls")]
fn tls_config(decl: &PortDecl) -> Result<Arc<rustls::ServerConfig>, ServerError> {
    use std::fs::File;
    use std::io::BufReader;

    let tls_err = |message: String| ServerError::Tls {
        port: decl.number,
        message,
    };
    let open = |path: &Option<std::path::PathBuf>, what: &str| {
        let path = path
            .as_ref()
            .ok_or_else(|| tls_err(format!("no {} configured", what)))?;
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| tls_err(format!("cannot open {} {}: {}", what, path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(&decl.cert, "cert")?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_err(format!("invalid certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_err("certificate file holds no certificates".to_owned()));
    }
    let key = rustls_pemfile::private_key(&mut open(&decl.key, "key")?)
        .map_err(|e| tls_err(format!("invalid key: {}", e)))?
        .ok_or_else(|| tls_err("key file holds no private key".to_owned()))?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tls_err(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Opens a non-blocking listening socket on `host:port`.
///
/// # Arguments
/// - `host`: The address to bind, `0.0.0.0` for every IPv4 interface
/// - `port`: The port to bind, `0` for an ephemeral one
/// - `backlog`: Length of the kernel's queue of unaccepted connections
///
/// # Errors
/// - Returns `ServerError::Bind` naming `port` if the socket cannot be
///   created, bound or put into the listening state
pub fn bind(host: IpAddr, port: u16, backlog: u32) -> Result<TcpListener, ServerError> {
    let addr = SocketAddr::new(host, port);
    let listen = || -> io::Result<TcpListener> {
        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
        Ok(TcpListener::from_std(socket.into()))
    };
    let listener = listen().map_err(|source| ServerError::Bind { port, source })?;
    log::info!("listening on {}", addr);
    Ok(listener)
}

/// Binds one listener per declared port, in declaration order.
pub fn bind_all(site: &SiteFile, host: IpAddr, backlog: u32) -> Result<Vec<TcpListener>, ServerError> {
    site.ports.iter().map(|p| bind(host, p.number, backlog)).collect()
}
