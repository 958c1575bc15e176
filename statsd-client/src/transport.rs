use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs as _, UdpSocket},
    time::Duration,
};

use tracing::debug;

/// A resolved remote address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RemoteAddr(Vec<SocketAddr>);

impl RemoteAddr {
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.0
    }
}

impl From<SocketAddr> for RemoteAddr {
    fn from(addr: SocketAddr) -> Self {
        RemoteAddr(vec![addr])
    }
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        match addr.to_socket_addrs() {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                if addrs.is_empty() {
                    Err(format!("'{}' did not resolve to any addresses", addr))
                } else {
                    Ok(RemoteAddr(addrs))
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }
}

/// A datagram transport.
///
/// Each call to `send` must either write the entire payload as a single datagram or fail. There is no delivery
/// guarantee beyond that.
pub trait Transport: Send + Sync + 'static {
    /// Sends `payload` as a single datagram, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// If the underlying write fails, the error is returned as-is and nothing is retried.
    fn send(&self, payload: &[u8]) -> io::Result<usize>;

    /// Returns a short identifier for the transport, such as `udp`.
    fn transport_id(&self) -> &'static str {
        "custom"
    }
}

/// A UDP socket connected to a single StatsD server.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub(crate) fn connect(remote_addr: &RemoteAddr, write_timeout: Duration) -> io::Result<Self> {
        // Bind to the unspecified address of whichever family we're sending to, or `connect` will fail.
        let local_addr: SocketAddr = match remote_addr.addrs().first() {
            Some(SocketAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };

        let socket = UdpSocket::bind(local_addr)?;
        socket.connect(remote_addr.addrs())?;
        socket.set_write_timeout(Some(write_timeout))?;

        debug!(local_addr = ?socket.local_addr().ok(), remote_addr = ?socket.peer_addr().ok(), "Connected UDP socket.");

        Ok(UdpTransport { socket })
    }

    /// Returns the local address of the underlying socket.
    ///
    /// # Errors
    ///
    /// If the socket address cannot be queried, an error is returned.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> io::Result<usize> {
        self.socket.send(payload)
    }

    fn transport_id(&self) -> &'static str {
        "udp"
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{SocketAddr, UdpSocket},
        time::Duration,
    };

    use super::{RemoteAddr, Transport as _, UdpTransport};

    #[test]
    fn resolve_remote_addr() {
        let expected: SocketAddr = "127.0.0.1:8125".parse().unwrap();
        let remote = RemoteAddr::try_from("127.0.0.1:8125").unwrap();
        assert_eq!(remote.addrs(), [expected]);

        assert!(RemoteAddr::try_from("not an address").is_err());
        assert!(RemoteAddr::try_from("127.0.0.1").is_err());
    }

    #[test]
    fn udp_send_is_single_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let remote = RemoteAddr::from(server.local_addr().unwrap());
        let transport = UdpTransport::connect(&remote, Duration::from_secs(1)).unwrap();
        assert_eq!(transport.transport_id(), "udp");
        assert_eq!(transport.send(b"a:1|c\nb:2|g").unwrap(), 11);

        let mut buf = [0u8; 64];
        let (n, source) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a:1|c\nb:2|g");
        assert_eq!(source.port(), transport.local_addr().unwrap().port());
    }

    #[test]
    fn udp_applies_write_timeout() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let remote = RemoteAddr::from(server.local_addr().unwrap());

        let transport = UdpTransport::connect(&remote, Duration::from_millis(250)).unwrap();
        assert_eq!(transport.socket.write_timeout().unwrap(), Some(Duration::from_millis(250)));
    }
}
