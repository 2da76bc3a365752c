//! UDP transport
//!
//! Operates in "client" mode: binds an ephemeral local port and connects
//! to one remote host/port, so reads only see that peer's datagrams and
//! writes always go to it.
//!
//! One read yields at most one datagram. A datagram longer than the read
//! asked for is split; the rest is served by the following reads.

use super::{resolve, CloseSignal, ReadHandler, Surplus, Transport, WriteHandler};
use crate::constants::UDP_DATAGRAM_MAX;
use crate::error::{Result, StreamError};
use crate::executor::Executor;
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};

struct UdpLink {
    socket: Arc<UdpSocket>,
    surplus: tokio::sync::Mutex<Surplus>,
    closed: CloseSignal,
}

impl UdpLink {
    async fn read_some(&self, max: usize) -> Result<Bytes> {
        let mut surplus = self.surplus.lock().await;
        if let Some(chunk) = surplus.take(max) {
            return Ok(chunk);
        }

        loop {
            let mut buf = BytesMut::with_capacity(UDP_DATAGRAM_MAX);
            let len = self
                .socket
                .recv_buf(&mut buf)
                .await
                .map_err(StreamError::from_io)?;
            // Empty datagrams carry nothing to deliver
            if len > 0 {
                return Ok(surplus.serve(buf.freeze(), max));
            }
        }
    }

    /// Drop datagrams waiting in the OS receive queue
    ///
    /// Reads the non-blocking descriptor directly so the result does not
    /// depend on whether the reactor has seen the socket become readable.
    fn discard_queued(&self) -> usize {
        let socket = SockRef::from(&*self.socket);
        let mut scratch = vec![0u8; UDP_DATAGRAM_MAX];
        let mut dropped = 0;
        // Stops on WouldBlock, or on any error since nothing is left to drop
        while (&*socket).read(&mut scratch).is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// UDP "connection" to one remote peer
///
/// # Example
///
/// ```ignore
/// let transport = UdpTransport::connect(Executor::default(), "192.168.1.10", 9000)?;
/// let stream = Stream::new(Arc::new(transport));
/// ```
pub struct UdpTransport {
    executor: Executor,
    remote: SocketAddr,
    link: RwLock<Option<Arc<UdpLink>>>,
}

impl UdpTransport {
    /// Resolve `host` and open a socket connected to it
    pub fn connect(executor: Executor, host: &str, port: u16) -> Result<Self> {
        let remote = resolve(host, port)?;
        let transport = Self {
            executor,
            remote,
            link: RwLock::new(None),
        };
        transport.open()?;
        Ok(transport)
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Local address of the current socket
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link().and_then(|link| link.socket.local_addr().ok())
    }

    fn open(&self) -> Result<()> {
        let socket = create_connected_udp_socket(&self.executor, self.remote)?;
        info!("Opened UDP socket to {}", self.remote);
        *self.link.write() = Some(Arc::new(UdpLink {
            socket,
            surplus: tokio::sync::Mutex::new(Surplus::default()),
            closed: CloseSignal::new(),
        }));
        Ok(())
    }

    fn link(&self) -> Option<Arc<UdpLink>> {
        self.link.read().clone()
    }
}

/// Create a non-blocking UDP socket bound to an ephemeral port and
/// connected to `remote`, registered with the executor's reactor
fn create_connected_udp_socket(executor: &Executor, remote: SocketAddr) -> Result<Arc<UdpSocket>> {
    let map_err = |source| StreamError::UdpBind {
        addr: remote.to_string(),
        source,
    };

    let (domain, local) = match remote {
        SocketAddr::V4(_) => (Domain::IPV4, SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        SocketAddr::V6(_) => (Domain::IPV6, SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)),
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(map_err)?;
    socket.set_nonblocking(true).map_err(map_err)?;
    socket.bind(&local.into()).map_err(map_err)?;
    socket.connect(&remote.into()).map_err(map_err)?;

    let handle = executor.handle()?;
    let _guard = handle.enter();
    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket).map_err(map_err)?;
    Ok(Arc::new(tokio_socket))
}

impl Transport for UdpTransport {
    fn executor(&self) -> &Executor {
        &self.executor
    }

    fn async_read_some(&self, max_count: usize, on_done: ReadHandler) {
        let Some(link) = self.link() else {
            self.executor
                .submit(move || on_done(Err(StreamError::Cancelled)));
            return;
        };
        self.executor.spawn(async move {
            let result = tokio::select! {
                r = link.read_some(max_count) => r,
                _ = link.closed.closed() => Err(StreamError::Cancelled),
            };
            on_done(result);
        });
    }

    fn async_write_some(&self, data: Bytes, on_done: WriteHandler) {
        let Some(link) = self.link() else {
            self.executor
                .submit(move || on_done(Err(StreamError::Cancelled)));
            return;
        };
        self.executor.spawn(async move {
            let result = tokio::select! {
                r = link.socket.send(&data) => r.map_err(StreamError::from_io),
                _ = link.closed.closed() => Err(StreamError::Cancelled),
            };
            on_done(result);
        });
    }

    fn flush(&self) -> Result<()> {
        if let Some(link) = self.link() {
            // A pending read holds the surplus, which means it is empty
            if let Ok(mut surplus) = link.surplus.try_lock() {
                surplus.clear();
            }
            let dropped = link.discard_queued();
            if dropped > 0 {
                debug!("Flushed {} queued datagrams from {}", dropped, self.remote);
            }
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        info!("Resetting UDP socket to {}", self.remote);
        self.close();
        self.open()
    }

    fn is_open(&self) -> bool {
        self.link()
            .map(|link| !link.closed.is_closed())
            .unwrap_or(false)
    }

    fn close(&self) {
        if let Some(link) = self.link.write().take() {
            info!("Closing UDP socket to {}", self.remote);
            link.closed.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_udp_transport_connect() {
        let transport = UdpTransport::connect(Executor::default(), "127.0.0.1", 9000).unwrap();
        assert_eq!(transport.remote().port(), 9000);
        assert!(transport.is_open());
        assert!(transport.local_addr().is_some());

        transport.close();
        assert!(!transport.is_open());
    }

    fn recv_one(transport: &UdpTransport, max: usize) -> Bytes {
        let (tx, rx) = std::sync::mpsc::channel();
        transport.async_read_some(max, Box::new(move |r| tx.send(r).unwrap()));
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap()
    }

    #[test]
    fn test_udp_flush_discards_queued_datagrams() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let transport = UdpTransport::connect(Executor::default(), "127.0.0.1", port).unwrap();
        let local = SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            transport.local_addr().unwrap().port(),
        ));

        peer.send_to(b"stale", local).unwrap();
        peer.send_to(b"older", local).unwrap();
        // Let both datagrams land in the receive queue
        std::thread::sleep(Duration::from_millis(50));
        transport.flush().unwrap();

        peer.send_to(b"fresh", local).unwrap();
        assert_eq!(recv_one(&transport, 16).as_ref(), b"fresh");
    }

    #[test]
    fn test_udp_flush_drops_datagram_surplus() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();
        let transport = UdpTransport::connect(Executor::default(), "127.0.0.1", port).unwrap();
        let local = SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            transport.local_addr().unwrap().port(),
        ));

        peer.send_to(b"abcdef", local).unwrap();
        assert_eq!(recv_one(&transport, 2).as_ref(), b"ab");
        transport.flush().unwrap();

        peer.send_to(b"next", local).unwrap();
        assert_eq!(recv_one(&transport, 16).as_ref(), b"next");
    }

    #[test]
    fn test_udp_transport_reset_rebinds() {
        let transport = UdpTransport::connect(Executor::default(), "127.0.0.1", 9000).unwrap();
        transport.close();
        transport.reset().unwrap();
        assert!(transport.is_open());
    }
}
