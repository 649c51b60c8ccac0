//! Socket setup shared by discovery and sessions

use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::time::Duration;

// Keepalive probes start after this much idle time
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Keep-alive on, Nagle off, blocking with bounded timeouts: reads wake every
/// `poll` so loops can check for shutdown, writes give up after `io_timeout`.
pub fn tune_stream(stream: &TcpStream, poll: Duration, io_timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let sock = SockRef::from(stream);
    sock.set_keepalive(true)?;
    let _ = sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_IDLE));
    stream.set_read_timeout(Some(poll))?;
    stream.set_write_timeout(Some(io_timeout))?;
    Ok(())
}

/// Dial `addr`, optionally from a specific local address
pub fn connect_stream(
    addr: SocketAddr,
    local_ip: Option<IpAddr>,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if let Some(ip) = local_ip {
        socket.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    }
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    Ok(socket.into())
}

/// Nonblocking listener so the accept loop can poll its shutdown token
pub fn bind_listener(ip: IpAddr, port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

pub fn bind_udp(ip: IpAddr, port: u16, broadcast: bool, poll: Duration) -> io::Result<UdpSocket> {
    let addr = SocketAddr::new(ip, port);
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if broadcast {
        socket.set_broadcast(true)?;
    }
    socket.bind(&SockAddr::from(addr))?;
    let udp: UdpSocket = socket.into();
    udp.set_read_timeout(Some(poll))?;
    Ok(udp)
}

/// Local address the OS would use to reach `target`. Connecting a UDP socket
/// sends nothing; it only selects a route.
pub fn local_ip_towards(target: IpAddr) -> Option<IpAddr> {
    let bind: IpAddr = match target {
        IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        IpAddr::V6(_) => std::net::Ipv6Addr::UNSPECIFIED.into(),
    };
    let sock = UdpSocket::bind(SocketAddr::new(bind, 0)).ok()?;
    sock.connect(SocketAddr::new(target, 9)).ok()?;
    let ip = sock.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Primary LAN address of this host, if it has a routable one
pub fn primary_ip() -> Option<IpAddr> {
    local_ip_towards(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)))
}

/// Broadcast address of the primary interface, assuming a /24
pub fn subnet_broadcast() -> Option<Ipv4Addr> {
    match primary_ip()? {
        IpAddr::V4(ip) if !ip.is_loopback() => Some(broadcast_24(ip)),
        _ => None,
    }
}

/// Read timeouts surface as either kind depending on the platform
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn broadcast_24(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 255)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_24() {
        assert_eq!(
            broadcast_24(Ipv4Addr::new(192, 168, 1, 37)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
    }

    #[test]
    fn test_loopback_route() {
        assert_eq!(
            local_ip_towards(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[test]
    fn test_listener_and_connect() {
        let listener = bind_listener(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let stream = connect_stream(addr, None, Duration::from_secs(5)).unwrap();
        tune_stream(&stream, Duration::from_millis(50), Duration::from_secs(5)).unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert!(stream.nodelay().unwrap());
    }
}
