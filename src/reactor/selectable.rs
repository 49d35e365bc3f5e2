//! I/O sources watched by the reactor.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;

use super::{HandleId, HandleInfo, Reactor};

/// Something the reactor polls for readiness on every iteration.
///
/// Implementations must not block: `poll_ready` is called on the loop thread
/// and should handle whatever is ready, then return.
pub trait Selectable: Send {
    /// Short description used in logs and junk reports.
    fn description(&self) -> String;

    /// Handles any pending readiness.
    ///
    /// # Errors
    ///
    /// An error removes the selectable from the reactor.
    fn poll_ready(&mut self) -> io::Result<()>;
}

pub(crate) struct Registered {
    pub(crate) id: HandleId,
    pub(crate) selectable: Box<dyn Selectable>,
}

impl Registered {
    pub(crate) fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            description: self.selectable.description(),
        }
    }
}

type AcceptFn = Box<dyn FnMut(TcpStream, SocketAddr) + Send>;

struct TcpAcceptor {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
    on_accept: AcceptFn,
}

impl Selectable for TcpAcceptor {
    fn description(&self) -> String {
        format!("TCP port listening on {}", self.local_addr)
    }

    fn poll_ready(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(local = %self.local_addr, %peer, "accepted connection");
                    (self.on_accept)(stream, peer);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }
}

/// A listening TCP port registered with a reactor.
///
/// Created by [`Reactor::listen_tcp`]. The port keeps listening until
/// [`stop_listening`](Port::stop_listening) is called or the reactor removes
/// all of its selectables.
#[derive(Clone)]
pub struct Port {
    id: HandleId,
    local_addr: SocketAddr,
    reactor: Reactor,
}

impl Port {
    /// The port's identifier.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// The address the port is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops listening. Returns `false` if the port was already removed.
    pub fn stop_listening(&self) -> bool {
        self.reactor.remove_selectable(self.id)
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

pub(crate) fn listen_tcp<A, F>(reactor: &Reactor, addr: A, on_accept: F) -> io::Result<Port>
where
    A: ToSocketAddrs,
    F: FnMut(TcpStream, SocketAddr) + Send + 'static,
{
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;
    let id = reactor.add_selectable(TcpAcceptor {
        listener: Arc::new(listener),
        local_addr,
        on_accept: Box::new(on_accept),
    });
    tracing::debug!(%local_addr, %id, "listening");
    Ok(Port {
        id,
        local_addr,
        reactor: reactor.clone(),
    })
}
