/*! Accepting FastCGI connections from the HTTP front-end.

The listener binds one endpoint (TCP or Unix domain socket), waits for raw
connections and performs the opening handshake: exactly one begin-request
record with a known role turns the raw transport into a
[`ServerConnection`]. Anything else is answered with an end-request record
carrying the closest protocol status before the error surfaces, so the
client always sees a valid protocol termination.
*/
use std::net::TcpListener;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use std::os::unix::net::UnixListener;
#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::fastcgi::{BeginRequestBody, EndRequestBody, Header, Record};
use crate::server::ServerConnection;
use crate::transport::{read_full, Transport};

/// Where a listener binds.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// IPv4 or IPv6 address, port and the queue size of pending connections.
    Tcp {
        address: String,
        port: u16,
        backlog: i32,
    },
    /// Socket path and the queue size of pending connections.
    #[cfg(unix)]
    Unix { path: PathBuf, backlog: i32 },
}

/// FastCGI listener options.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    endpoint: Endpoint,
}

impl ListenerOptions {
    /// Options for listening on the network.
    pub fn tcp(address: impl Into<String>, port: u16, backlog: i32) -> Result<ListenerOptions> {
        if port == 0 {
            return Err(Error::InvalidArgument("port must be positive"));
        }
        Ok(ListenerOptions {
            endpoint: Endpoint::Tcp {
                address: address.into(),
                port,
                backlog,
            },
        })
    }

    /// Options for listening on a Unix domain socket.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>, backlog: i32) -> ListenerOptions {
        ListenerOptions {
            endpoint: Endpoint::Unix {
                path: path.into(),
                backlog,
            },
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

enum Bound {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// Accepts FastCGI connections on one endpoint.
pub struct Listener {
    options: ListenerOptions,
    bound: Option<Bound>,
}

impl Listener {
    pub fn new(options: ListenerOptions) -> Listener {
        Listener {
            options,
            bound: None,
        }
    }

    pub fn options(&self) -> &ListenerOptions {
        &self.options
    }

    pub fn is_listening(&self) -> bool {
        self.bound.is_some()
    }

    /// Binds the endpoint and starts listening.
    pub fn listen(&mut self) -> Result<()> {
        if self.bound.is_some() {
            return Err(Error::InvalidArgument("listener is already listening"));
        }
        let bound = match &self.options.endpoint {
            Endpoint::Tcp {
                address,
                port,
                backlog,
            } => {
                let listener = TcpListener::bind((address.as_str(), *port))?;
                #[cfg(unix)]
                set_backlog(listener.as_raw_fd(), *backlog)?;
                info!("listening on {}:{}", address, port);
                Bound::Tcp(listener)
            }
            #[cfg(unix)]
            Endpoint::Unix { path, backlog } => {
                let listener = UnixListener::bind(path)?;
                set_backlog(listener.as_raw_fd(), *backlog)?;
                info!("listening on {}", path.display());
                Bound::Unix(listener)
            }
        };
        self.bound = Some(bound);
        Ok(())
    }

    /// Waits for a connection to become acceptable.
    ///
    /// `None` waits without limit. Returns `true` if a connection is ready
    /// to be accepted before the timeout elapses.
    #[cfg(unix)]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let fd = match self
            .bound
            .as_ref()
            .ok_or(Error::InvalidArgument("listener is not listening"))?
        {
            Bound::Tcp(l) => l.as_raw_fd(),
            Bound::Unix(l) => l.as_raw_fd(),
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let ms: libc::c_int = match deadline {
                None => -1,
                Some(d) => d
                    .saturating_duration_since(Instant::now())
                    .as_millis()
                    .min(libc::c_int::MAX as u128) as libc::c_int,
            };
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            return Ok(rc > 0);
        }
    }

    /// Accepts a FastCGI connection, or rejects it in case of a protocol
    /// violation.
    pub fn accept(&mut self) -> Result<ServerConnection> {
        let bound = self
            .bound
            .as_mut()
            .ok_or(Error::InvalidArgument("listener is not listening"))?;
        let mut io: Box<dyn Transport> = match bound {
            Bound::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                debug!("connection from {}", peer);
                Box::new(stream)
            }
            #[cfg(unix)]
            Bound::Unix(l) => Box::new(l.accept()?.0),
        };

        let mut raw = [0u8; Header::LEN];
        read_full(io.as_mut(), &mut raw)?;
        let header = Header::parse(&raw)?;

        if header.rtype != Record::BEGIN_REQUEST
            || header.is_management()
            || header.content_length as usize != BeginRequestBody::LEN
        {
            // No protocol status fits a malformed opening record;
            // CANT_MPX_CONN is the best suited code.
            io.write_all(&EndRequestBody::record(
                header.request_id,
                0,
                EndRequestBody::CANT_MPX_CONN,
            ))?;
            return Err(Error::protocol("the connection must open with a begin-request record"));
        }

        let mut raw_body = [0u8; BeginRequestBody::LEN];
        read_full(io.as_mut(), &mut raw_body)?;
        let body = BeginRequestBody::parse(&raw_body);
        match body.role() {
            Some(role) => {
                debug!("request #{} as {:?}", header.request_id, role);
                ServerConnection::new(io, role, header.request_id, body.is_keep_conn())
            }
            None => {
                io.write_all(&EndRequestBody::record(
                    header.request_id,
                    0,
                    EndRequestBody::UNKNOWN_ROLE,
                ))?;
                Err(Error::UnknownRole(body.raw_role()))
            }
        }
    }

    /// Stops listening.
    pub fn close(&mut self) -> Result<()> {
        if let Some(bound) = self.bound.take() {
            #[cfg(unix)]
            if let Bound::Unix(l) = &bound {
                // the bound socket file stays behind otherwise
                if let Some(path) = l.local_addr().ok().and_then(|a| a.as_pathname().map(PathBuf::from)) {
                    let _ = std::fs::remove_file(path);
                }
            }
            drop(bound);
        }
        Ok(())
    }
}

/// The queue of not yet accepted connections is part of the endpoint
/// configuration; re-listening on the bound socket applies it.
#[cfg(unix)]
fn set_backlog(fd: libc::c_int, backlog: i32) -> Result<()> {
    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_options_validate_the_port() {
        assert!(matches!(
            ListenerOptions::tcp("127.0.0.1", 0, 16),
            Err(Error::InvalidArgument(_))
        ));
        let options = ListenerOptions::tcp("127.0.0.1", 9000, 16).unwrap();
        match options.endpoint() {
            Endpoint::Tcp { address, port, backlog } => {
                assert_eq!(address, "127.0.0.1");
                assert_eq!(*port, 9000);
                assert_eq!(*backlog, 16);
            }
            #[cfg(unix)]
            _ => panic!("wrong endpoint"),
        }
    }

    #[test]
    fn operations_require_the_right_listening_state() {
        let mut listener =
            Listener::new(ListenerOptions::tcp("127.0.0.1", 59130, 16).unwrap());
        assert!(!listener.is_listening());
        assert!(matches!(listener.accept(), Err(Error::InvalidArgument(_))));
        #[cfg(unix)]
        assert!(matches!(listener.wait(None), Err(Error::InvalidArgument(_))));

        listener.listen().unwrap();
        assert!(listener.is_listening());
        assert!(matches!(listener.listen(), Err(Error::InvalidArgument(_))));

        listener.close().unwrap();
        assert!(!listener.is_listening());
        // a closed listener may listen again
        listener.listen().unwrap();
        listener.close().unwrap();
    }
}
