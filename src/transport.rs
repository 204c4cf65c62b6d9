use std::{
    io::{self, Write as _},
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

#[cfg(target_os = "linux")]
use std::os::unix::net::{UnixDatagram, UnixStream};

#[cfg(target_os = "linux")]
use std::path::PathBuf;

/// A destination for finished payloads.
///
/// The pipeline only ever hands a transport a complete buffer for delivery; delivery itself is
/// best-effort and fire-and-forget. Implementations must be safe to call from the worker's
/// consumer thread(s).
pub trait Transport: Send + Sync {
    /// Delivers a single finished payload.
    fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Returns a short identifier for the underlying transport, such as `udp`.
    fn transport_id(&self) -> &'static str;
}

/// The parsed remote address of a DogStatsD server.
#[derive(Clone)]
pub(crate) enum RemoteAddr {
    Udp(Vec<SocketAddr>),

    #[cfg(target_os = "linux")]
    Unixgram(PathBuf),

    #[cfg(target_os = "linux")]
    Unix(PathBuf),
}

impl<'a> TryFrom<&'a str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &'a str) -> Result<Self, Self::Error> {
        #[cfg(target_os = "linux")]
        if let Some((scheme, path)) = addr.split_once("://") {
            return match scheme {
                "unix" => Ok(RemoteAddr::Unix(PathBuf::from(path))),
                "unixgram" => Ok(RemoteAddr::Unixgram(PathBuf::from(path))),
                _ => Err(format!("invalid scheme '{scheme}' (expected 'unix' or 'unixgram')")),
            };
        }

        match addr.to_socket_addrs() {
            Ok(addrs) => Ok(RemoteAddr::Udp(addrs.collect())),
            Err(e) => Err(e.to_string()),
        }
    }
}

/// Connects the transport appropriate for the given remote address.
pub(crate) fn connect(
    remote_addr: &RemoteAddr,
    write_timeout: Duration,
) -> io::Result<Arc<dyn Transport>> {
    match remote_addr {
        RemoteAddr::Udp(addrs) => {
            Ok(Arc::new(UdpTransport::connect(&addrs[..], write_timeout)?))
        }

        #[cfg(target_os = "linux")]
        RemoteAddr::Unixgram(path) => {
            Ok(Arc::new(UnixgramTransport::connect(path, write_timeout)?))
        }

        #[cfg(target_os = "linux")]
        RemoteAddr::Unix(path) => Ok(Arc::new(UnixStreamTransport::connect(path, write_timeout)?)),
    }
}

/// Transport that sends payloads as UDP datagrams.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Binds an ephemeral local socket and connects it to the given remote address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound, connected, or configured.
    pub fn connect<A>(addr: A, write_timeout: Duration) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect(addr)?;
        socket.set_write_timeout(Some(write_timeout))?;
        Ok(UdpTransport { socket })
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send(payload).map(|_| ())
    }

    fn transport_id(&self) -> &'static str {
        "udp"
    }
}

/// Transport that sends payloads over a `SOCK_DGRAM` Unix domain socket.
#[cfg(target_os = "linux")]
pub struct UnixgramTransport {
    socket: UnixDatagram,
}

#[cfg(target_os = "linux")]
impl UnixgramTransport {
    /// Connects an unbound datagram socket to the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created, connected, or configured.
    pub fn connect(path: &std::path::Path, write_timeout: Duration) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        socket.set_write_timeout(Some(write_timeout))?;
        Ok(UnixgramTransport { socket })
    }
}

#[cfg(target_os = "linux")]
impl Transport for UnixgramTransport {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        self.socket.send(payload).map(|_| ())
    }

    fn transport_id(&self) -> &'static str {
        "uds"
    }
}

/// Transport that sends payloads over a `SOCK_STREAM` Unix domain socket.
///
/// Roughly equivalent to TCP but host-local, with better delivery behavior than datagram sockets
/// under high throughput.
#[cfg(target_os = "linux")]
pub struct UnixStreamTransport {
    socket: Mutex<UnixStream>,
}

#[cfg(target_os = "linux")]
impl UnixStreamTransport {
    /// Connects a stream socket to the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be connected or configured.
    pub fn connect(path: &std::path::Path, write_timeout: Duration) -> io::Result<Self> {
        let socket = UnixStream::connect(path)?;
        socket.set_write_timeout(Some(write_timeout))?;
        Ok(UnixStreamTransport { socket: Mutex::new(socket) })
    }
}

#[cfg(target_os = "linux")]
impl Transport for UnixStreamTransport {
    fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        socket.write_all(payload)
    }

    fn transport_id(&self) -> &'static str {
        "uds-stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_addresses() {
        match RemoteAddr::try_from("127.0.0.1:8125") {
            Ok(RemoteAddr::Udp(addrs)) => assert!(!addrs.is_empty()),
            _ => panic!("expected UDP address"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn parses_unix_socket_addresses() {
        assert!(matches!(
            RemoteAddr::try_from("unix:///var/run/dsd.sock"),
            Ok(RemoteAddr::Unix(_))
        ));
        assert!(matches!(
            RemoteAddr::try_from("unixgram:///var/run/dsd.sock"),
            Ok(RemoteAddr::Unixgram(_))
        ));
        assert!(RemoteAddr::try_from("tcp:///var/run/dsd.sock").is_err());
    }

    #[test]
    fn udp_transport_delivers_datagrams() {
        let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = receiver.local_addr().unwrap();

        let transport = UdpTransport::connect(addr, Duration::from_secs(1)).unwrap();
        transport.send(b"app.hits:1|c\n").unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"app.hits:1|c\n");
    }
}
