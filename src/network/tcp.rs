//! TCP transport and the readiness poll.
//!
//! The protocol assumes an ordered, reliable byte stream per peer, so the
//! transport layer is a thin trait over non-blocking TCP with Nagle
//! disabled. A host listening on IPv6 clears `IPV6_V6ONLY` so IPv4 peers
//! can dial the same port.

use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use smallvec::SmallVec;
use tracing::warn;

/// A buffered, reliable, ordered byte stream to one peer.
///
/// Implementations must be non-blocking: both calls return
/// [`ErrorKind::WouldBlock`] instead of waiting. `try_recv` returning
/// `Ok(0)` signals an orderly EOF.
pub trait PeerTransport: Send {
    /// Attempts to push bytes to the peer. Returns how many were taken.
    fn try_send(&mut self, bytes: &[u8]) -> std::io::Result<usize>;

    /// Attempts to pull bytes from the peer into `buf`.
    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// The raw descriptor for the readiness selector, when there is one.
    /// Transports without a descriptor fall back to a bounded sleep.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// A non-blocking TCP connection to one peer.
#[derive(Debug)]
pub struct TcpPeer {
    stream: TcpStream,
}

impl TcpPeer {
    /// Dials `server:port`, resolving the name if needed, and configures
    /// the stream for netplay (TCP_NODELAY, non-blocking).
    pub fn connect(server: &str, port: u16) -> std::io::Result<Self> {
        let mut last_err = None;
        for addr in (server, port).to_socket_addrs()? {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::from_stream(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(ErrorKind::AddrNotAvailable, "host name resolved to no address")
        }))
    }

    /// Dials a pre-resolved address, bypassing DNS.
    pub fn connect_direct(addr: SocketAddr) -> std::io::Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    /// Adopts an already-established stream (e.g. from a listener).
    pub fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set TCP_NODELAY, expect jitter: {e}");
        }
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl PeerTransport for TcpPeer {
    fn try_send(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        self.stream.write(bytes)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf)
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }
}

/// Binds the host listener.
///
/// Prefers an IPv6 socket with `IPV6_V6ONLY` cleared so a single listener
/// accepts both families; falls back to plain IPv4 where IPv6 is
/// unavailable. The listener is non-blocking; `accept` is polled once per
/// session tick.
pub fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let listener = match bind_dual_stack(port) {
        Ok(listener) => listener,
        Err(e) => {
            warn!("failed to listen on both IPv6 and IPv4: {e}");
            TcpListener::bind(("0.0.0.0", port))?
        }
    };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    use std::os::fd::FromRawFd;

    // SAFETY: plain socket syscalls on a descriptor we own; the descriptor
    // is either handed to TcpListener or closed on every error path.
    unsafe {
        let fd = libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let close_with_err = |fd: libc::c_int| -> std::io::Error {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            err
        };

        let off: libc::c_int = 0;
        if libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            libc::IPV6_V6ONLY,
            (&off as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            warn!("failed to clear IPV6_V6ONLY; IPv4 peers may not reach us");
        }
        let on: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            (&on as *const libc::c_int).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        // Don't let inherited processes keep our port open.
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            warn!("cannot set the netplay port to close-on-exec");
        }

        let mut addr: libc::sockaddr_in6 = std::mem::zeroed();
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        if libc::bind(
            fd,
            (&addr as *const libc::sockaddr_in6).cast(),
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        ) < 0
        {
            return Err(close_with_err(fd));
        }
        if libc::listen(fd, 1024) < 0 {
            return Err(close_with_err(fd));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

#[cfg(not(unix))]
fn bind_dual_stack(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(("::", port))
}

/// Waits until any of `transports` may have data, or `timeout` elapses.
///
/// Returns whether readiness was signalled. Transports without a
/// descriptor cannot be selected on; when none offers one, the wait
/// degenerates to a plain sleep so the retry loop still paces itself.
pub fn wait_readable(transports: &[&dyn PeerTransport], timeout: Duration) -> std::io::Result<bool> {
    #[cfg(unix)]
    {
        let fds: SmallVec<[RawFd; 8]> = transports.iter().filter_map(|t| t.raw_fd()).collect();
        if !fds.is_empty() {
            return poll_fds(&fds, timeout);
        }
    }
    let _ = transports;
    std::thread::sleep(timeout);
    Ok(false)
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn poll_fds(fds: &[RawFd], timeout: Duration) -> std::io::Result<bool> {
    let mut pollfds: SmallVec<[libc::pollfd; 8]> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: the pollfd array outlives the call and its length is exact.
    let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, millis) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.kind() == ErrorKind::Interrupted {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(ret > 0)
}
