//! Byte stream transports for PYXNet connections.
//!
//! The overlay only needs to open a stream to an endpoint, and to accept
//! streams on an endpoint. [`TcpTransport`] does this with real sockets,
//! and [`MemoryTransport`] with in-process pipes, so whole overlays can be
//! tested without a network.

use std::{
    collections::HashMap,
    fmt, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{
    channel::mpsc,
    future::{self, BoxFuture, FutureExt},
    stream::{self, BoxStream, StreamExt},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream},
    net::{TcpListener, TcpStream},
};
use tower::{service_fn, timeout::Timeout, ServiceExt};

use crate::BoxError;

#[cfg(test)]
mod tests;

/// A bidirectional byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A transport stream of any type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// A bound endpoint, and the streams it accepts.
pub struct Listener {
    /// The bound endpoint. If the requested port was 0, this has the assigned port.
    pub local_addr: SocketAddr,
    /// Accepted streams, with the remote endpoint of each stream.
    pub incoming: BoxStream<'static, io::Result<(BoxedStream, SocketAddr)>>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Opens and accepts byte streams.
pub trait Transport: Send + Sync + 'static {
    /// Opens a stream to `addr`.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>>;

    /// Binds `addr`, and returns a stream of accepted connections.
    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Listener>>;
}

/// Races connections to every endpoint in `candidates`, returning the first
/// stream that opens within `timeout`, and its endpoint.
///
/// The other attempts are dropped.
pub async fn connect_any(
    transport: Arc<dyn Transport>,
    candidates: Vec<SocketAddr>,
    timeout: Duration,
) -> Result<(BoxedStream, SocketAddr), BoxError> {
    if candidates.is_empty() {
        return Err("no endpoints to connect to".into());
    }

    let attempts = candidates.into_iter().map(|addr| {
        let transport = transport.clone();
        let connector = service_fn(move |addr: SocketAddr| {
            let connect = transport.connect(addr);
            async move { connect.await.map(|stream| (stream, addr)) }
        });

        Timeout::new(connector, timeout).oneshot(addr).boxed()
    });

    let (connected, _rest) = future::select_ok(attempts).await?;
    trace!(addr = %connected.1, "connected to endpoint");

    Ok(connected)
}

/// Connects with TCP sockets.
#[derive(Copy, Clone, Debug, Default)]
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }

    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Listener>> {
        async move {
            let listener = TcpListener::bind(addr).await?;
            let local_addr = listener.local_addr()?;
            info!(%local_addr, "opened PYXNet listener");

            let incoming = stream::unfold(listener, |listener| async move {
                let accepted = listener.accept().await.map(|(stream, addr)| {
                    if let Err(error) = stream.set_nodelay(true) {
                        debug!(%addr, %error, "could not disable Nagle's algorithm");
                    }
                    (Box::new(stream) as BoxedStream, addr)
                });
                Some((accepted, listener))
            })
            .boxed();

            Ok(Listener {
                local_addr,
                incoming,
            })
        }
        .boxed()
    }
}

/// The capacity of each direction of an in-memory stream.
const MEMORY_STREAM_BUFFER: usize = 256 * 1024;

/// The first port assigned to listeners that ask for port 0.
const FIRST_MEMORY_PORT: u16 = 20_000;

#[derive(Debug)]
struct MemoryNetwork {
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<(DuplexStream, SocketAddr)>>,
    unreachable: Vec<SocketAddr>,
    connect_attempts: HashMap<SocketAddr, usize>,
    next_port: u16,
}

impl MemoryNetwork {
    fn assign_port(&mut self, ip: IpAddr) -> SocketAddr {
        loop {
            let addr = SocketAddr::new(ip, self.next_port);
            self.next_port = self.next_port.wrapping_add(1).max(FIRST_MEMORY_PORT);
            if !self.is_listening(&addr) {
                return addr;
            }
        }
    }

    fn is_listening(&self, addr: &SocketAddr) -> bool {
        self.listeners
            .get(addr)
            .map_or(false, |listener| !listener.is_closed())
    }
}

/// Connects with in-memory pipes.
///
/// Clones share the same simulated network. Endpoints can be made
/// unreachable, so that connections to them are refused while they can
/// still connect out.
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: Arc<Mutex<MemoryNetwork>>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        MemoryTransport::new()
    }
}

impl MemoryTransport {
    /// Creates a new, empty simulated network.
    pub fn new() -> MemoryTransport {
        MemoryTransport {
            network: Arc::new(Mutex::new(MemoryNetwork {
                listeners: HashMap::new(),
                unreachable: Vec::new(),
                connect_attempts: HashMap::new(),
                next_port: FIRST_MEMORY_PORT,
            })),
        }
    }

    /// Refuses or allows inbound connections to `addr`.
    pub fn set_reachable(&self, addr: SocketAddr, reachable: bool) {
        let mut network = self.lock();
        network.unreachable.retain(|blocked| *blocked != addr);
        if !reachable {
            network.unreachable.push(addr);
        }
    }

    /// The number of times a connection to `addr` was attempted.
    pub fn connect_attempts(&self, addr: SocketAddr) -> usize {
        self.lock()
            .connect_attempts
            .get(&addr)
            .copied()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryNetwork> {
        self.network
            .lock()
            .expect("memory network mutex should be unpoisoned")
    }

    fn open(&self, addr: SocketAddr) -> io::Result<BoxedStream> {
        let mut network = self.lock();
        *network.connect_attempts.entry(addr).or_default() += 1;

        if network.unreachable.contains(&addr) || !network.is_listening(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nothing is listening on {addr}"),
            ));
        }

        let local_addr = network.assign_port(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (client, server) = tokio::io::duplex(MEMORY_STREAM_BUFFER);

        let accepted = network
            .listeners
            .get(&addr)
            .map_or(false, |listener| {
                listener.unbounded_send((server, local_addr)).is_ok()
            });
        if !accepted {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("listener on {addr} was closed"),
            ));
        }

        Ok(Box::new(client) as BoxedStream)
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<Listener> {
        let mut network = self.lock();

        let local_addr = if addr.port() == 0 {
            network.assign_port(addr.ip())
        } else if network.is_listening(&addr) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{addr} is already listening"),
            ));
        } else {
            addr
        };

        let (tx, rx) = mpsc::unbounded();
        network.listeners.insert(local_addr, tx);
        debug!(%local_addr, "opened in-memory listener");

        let incoming = rx
            .map(|(stream, addr)| Ok((Box::new(stream) as BoxedStream, addr)))
            .boxed();

        Ok(Listener {
            local_addr,
            incoming,
        })
    }
}

impl Transport for MemoryTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        future::ready(self.open(addr)).boxed()
    }

    fn listen(&self, addr: SocketAddr) -> BoxFuture<'static, io::Result<Listener>> {
        future::ready(self.bind(addr)).boxed()
    }
}
