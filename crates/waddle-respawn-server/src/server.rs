//! Listener setup and the pid echo protocol.
//!
//! Every TCP or Unix connection receives `"<index>:<pid>\n"` and is closed;
//! every UDP datagram is answered with `"<pid>:<payload>"`. The pid makes it
//! visible which generation served a request.

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use waddle_respawn::{Inheritable, Listener, ListenerFactory, PacketConn};

use crate::trap::Drain;

/// Every socket of one generation, in factory call order.
pub struct Listeners {
    tcp: Vec<Listener>,
    udp: Vec<PacketConn>,
    unix: Option<Listener>,
}

impl Listeners {
    /// Create the listeners through `factory`: TCP, then UDP, then Unix.
    /// The order must never change, reloaded generations rely on it.
    pub fn open(
        factory: &ListenerFactory,
        tcp: &[String],
        udp: &[String],
        unix: Option<&str>,
    ) -> waddle_respawn::Result<Self> {
        let tcp = tcp
            .iter()
            .map(|addr| factory.listen("tcp", addr))
            .collect::<waddle_respawn::Result<Vec<_>>>()?;
        let udp = udp
            .iter()
            .map(|addr| factory.listen_packet("udp", addr))
            .collect::<waddle_respawn::Result<Vec<_>>>()?;
        let unix = unix.map(|path| factory.listen("unix", path)).transpose()?;
        Ok(Self { tcp, udp, unix })
    }

    /// Handles in the order they were created, for `reload`.
    pub fn handles(&self) -> Vec<&dyn Inheritable> {
        let mut handles: Vec<&dyn Inheritable> = Vec::new();
        handles.extend(self.tcp.iter().map(|l| l as &dyn Inheritable));
        handles.extend(self.udp.iter().map(|c| c as &dyn Inheritable));
        handles.extend(self.unix.iter().map(|l| l as &dyn Inheritable));
        handles
    }

    pub fn log_summary(&self) {
        for listener in self.tcp.iter().chain(self.unix.iter()) {
            info!(
                network = %listener.network(),
                addr = %display_addr(listener.local_addr()),
                origin = ?listener.origin(),
                "Listener ready"
            );
        }
        for conn in &self.udp {
            info!(
                network = %conn.network(),
                addr = %display_addr(conn.local_addr()),
                origin = ?conn.origin(),
                "Packet socket ready"
            );
        }
    }

    /// Start one serving task per socket. The tasks work on duplicates, so
    /// the handles stay here, ready to be passed to a reload.
    pub fn serve(&self, drain: &Drain) -> Result<()> {
        let pid = std::process::id();

        for (index, listener) in self.tcp.iter().enumerate() {
            let std_listener = listener
                .as_tcp()
                .context("tcp handle without a tcp socket")?
                .try_clone()?;
            std_listener.set_nonblocking(true)?;
            let listener = tokio::net::TcpListener::from_std(std_listener)?;
            tokio::spawn(accept_tcp(listener, index, pid, drain.clone()));
        }

        for conn in &self.udp {
            let std_socket = conn
                .as_udp()
                .context("udp handle without a udp socket")?
                .try_clone()?;
            std_socket.set_nonblocking(true)?;
            let socket = tokio::net::UdpSocket::from_std(std_socket)?;
            tokio::spawn(answer_udp(socket, pid, drain.clone()));
        }

        if let Some(listener) = &self.unix {
            let std_listener = listener
                .as_unix()
                .context("unix handle without a unix socket")?
                .try_clone()?;
            std_listener.set_nonblocking(true)?;
            let listener = tokio::net::UnixListener::from_std(std_listener)?;
            tokio::spawn(accept_unix(listener, self.tcp.len(), pid, drain.clone()));
        }

        Ok(())
    }
}

fn display_addr(addr: std::io::Result<waddle_respawn::ListenAddr>) -> String {
    match addr {
        Ok(addr) => addr.to_string(),
        Err(e) => format!("<{}>", e),
    }
}

async fn accept_tcp(listener: tokio::net::TcpListener, index: usize, pid: u32, drain: Drain) {
    let stop = drain.stop_token();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut stream, peer)) => {
                    debug!(%peer, index, "Accepted tcp connection");
                    drain.spawn(async move {
                        let reply = format!("{}:{}\n", index, pid);
                        if let Err(e) = stream.write_all(reply.as_bytes()).await {
                            warn!(error = %e, "Failed to answer tcp connection");
                        }
                        let _ = stream.shutdown().await;
                    });
                }
                Err(e) => error!(error = %e, index, "Accept failed"),
            },
        }
    }
    debug!(index, "Stopped accepting tcp connections");
}

async fn accept_unix(listener: tokio::net::UnixListener, index: usize, pid: u32, drain: Drain) {
    let stop = drain.stop_token();
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((mut stream, _)) => {
                    debug!(index, "Accepted unix connection");
                    drain.spawn(async move {
                        let reply = format!("{}:{}\n", index, pid);
                        if let Err(e) = stream.write_all(reply.as_bytes()).await {
                            warn!(error = %e, "Failed to answer unix connection");
                        }
                        let _ = stream.shutdown().await;
                    });
                }
                Err(e) => error!(error = %e, index, "Accept failed"),
            },
        }
    }
    debug!(index, "Stopped accepting unix connections");
}

async fn answer_udp(socket: tokio::net::UdpSocket, pid: u32, drain: Drain) {
    let stop = drain.stop_token();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, peer)) => {
                    let mut reply = format!("{}:", pid).into_bytes();
                    reply.extend_from_slice(&buffer[..len]);
                    if let Err(e) = socket.send_to(&reply, peer).await {
                        warn!(error = %e, %peer, "Failed to answer datagram");
                    }
                }
                Err(e) => error!(error = %e, "Receive failed"),
            },
        }
    }
    debug!("Stopped answering datagrams");
}
