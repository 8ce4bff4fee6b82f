//! # Server Endpoints
//!
//! One [`ServerEndpoint`] per configured server: a pair of `connect`-bound
//! UDP sockets (upstream and downstream) with receive timeouts. A server
//! failing resolution, socket creation or connect at startup is marked
//! non-live and never used again; startup carries on with the remaining
//! servers. There is no reconnection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use log::{error, info};

use crate::config::ServerConf;
use crate::error::FwdError;

struct ServerSockets {
    up: UdpSocket,
    down: UdpSocket,
}

/// One configured server and its socket pair.
pub struct ServerEndpoint {
    /// Position in the configured server list, for logging.
    pub index: usize,
    pub address: String,
    sockets: Option<ServerSockets>,
}

fn open_socket(host: &str, port: u16, timeout: Duration) -> Result<UdpSocket, FwdError> {
    let mut last_err: Option<std::io::Error> = None;
    for addr in (host, port).to_socket_addrs()? {
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        match UdpSocket::bind(local).and_then(|s| s.connect(addr).map(|()| s)) {
            Ok(socket) => {
                socket.set_read_timeout(Some(timeout))?;
                return Ok(socket);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(match last_err {
        Some(e) => FwdError::SocketError(e),
        None => FwdError::Other(format!("no usable address for {host}:{port}")),
    })
}

impl ServerEndpoint {
    /// Resolves and connects both sockets of one server. Failure yields a
    /// non-live endpoint, not an error: individual servers being down must
    /// not abort startup.
    pub fn connect(
        index: usize,
        conf: &ServerConf,
        push_timeout_half: Duration,
        pull_timeout: Duration,
    ) -> ServerEndpoint {
        let sockets = open_socket(&conf.address, conf.port_up, push_timeout_half)
            .and_then(|up| {
                let down = open_socket(&conf.address, conf.port_down, pull_timeout)?;
                Ok(ServerSockets { up, down })
            });
        match sockets {
            Ok(sockets) => {
                info!("Successfully contacted server {}", conf.address);
                ServerEndpoint {
                    index,
                    address: conf.address.clone(),
                    sockets: Some(sockets),
                }
            }
            Err(e) => {
                error!(
                    "Server {} (ports {}/{}) could not be set up, marking non-live: {e}",
                    conf.address, conf.port_up, conf.port_down
                );
                ServerEndpoint {
                    index,
                    address: conf.address.clone(),
                    sockets: None,
                }
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.sockets.is_some()
    }

    /// Upstream socket; `None` for a non-live server.
    pub fn up(&self) -> Option<&UdpSocket> {
        self.sockets.as_ref().map(|s| &s.up)
    }

    /// Downstream socket; `None` for a non-live server.
    pub fn down(&self) -> Option<&UdpSocket> {
        self.sockets.as_ref().map(|s| &s.down)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(address: &str, port_up: u16, port_down: u16) -> ServerConf {
        ServerConf {
            address: address.into(),
            port_up,
            port_down,
        }
    }

    #[test]
    fn test_loopback_server_is_live() {
        let peer_up = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_down = UdpSocket::bind("127.0.0.1:0").unwrap();
        let endpoint = ServerEndpoint::connect(
            0,
            &conf(
                "127.0.0.1",
                peer_up.local_addr().unwrap().port(),
                peer_down.local_addr().unwrap().port(),
            ),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        assert!(endpoint.is_live());

        endpoint.up().unwrap().send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let (len, _) = peer_up.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
    }

    #[test]
    fn test_unresolvable_server_is_marked_non_live() {
        let endpoint = ServerEndpoint::connect(
            0,
            &conf("server.invalid.", 1780, 1782),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        assert!(!endpoint.is_live());
        assert!(endpoint.up().is_none());
        assert!(endpoint.down().is_none());
    }

    #[test]
    fn test_upstream_receive_times_out() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let endpoint = ServerEndpoint::connect(
            0,
            &conf(
                "127.0.0.1",
                peer.local_addr().unwrap().port(),
                peer.local_addr().unwrap().port(),
            ),
            Duration::from_millis(50),
            Duration::from_millis(200),
        );
        let start = std::time::Instant::now();
        let mut buf = [0u8; 16];
        assert!(endpoint.up().unwrap().recv(&mut buf).is_err());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
