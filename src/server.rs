//! The fanout server.
//!
//! A single task multiplexes every connection: one `select!` waits on the listener, on a
//! level-triggered readiness scan over the descriptor set ([`Slots`]), and on a periodic sweep
//! for stalled partial frames. Nothing here is shared, so nothing is locked.
//!
//! Fanout is N sequential sends, each bounded by the configured timeout. A slow peer therefore
//! delays delivery to the peers after it by up to that timeout.

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use futures::future::poll_fn;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::codec::Received;
use crate::config::ServerConfig;
use crate::error::{ServerError, TransportError};
use crate::packet::{Kind, Packet};
use crate::peer::Peer;
use crate::slots::{descriptor_limit, SlotId, Slots};
use crate::transport::{self, link};

/// Pause after a failed accept, so descriptor exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    peers: Slots<Peer>,
    config: ServerConfig,
}

impl Server {
    /// Binds the listener and sizes the descriptor set. `max_clients` further caps admission below
    /// the process descriptor limit.
    pub async fn bind(
        addr: SocketAddr,
        config: ServerConfig,
        max_clients: Option<usize>,
    ) -> Result<Server, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                port: addr.port(),
                source,
            })?;
        let mut limit = descriptor_limit().map_err(ServerError::Limit)?;
        if let Some(max) = max_clients {
            limit = limit.min(max);
        }
        info!(
            "server: listening on {} (admitting up to {} clients)",
            listener.local_addr().unwrap_or(addr),
            limit
        );
        Ok(Server {
            listener,
            peers: Slots::new(config.initial_capacity, limit),
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn clients(&self) -> usize {
        self.peers.len()
    }

    /// Serves until the listener fails. Never returns `Ok`.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut sweep = interval(self.config.io_timeout);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => self.accept(accepted).await?,
                (id, next) = poll_fn(|cx| {
                    self.peers.poll_ready(cx, |peer, cx| peer.link.poll_next_unpin(cx))
                }) => self.handle(id, Received::from_next(next)).await,
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    async fn accept(&mut self, accepted: io::Result<(TcpStream, SocketAddr)>) -> Result<(), ServerError> {
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                if listener_is_broken(&err) {
                    error!("server: listener failed: {}", err);
                    return Err(ServerError::Listener(err));
                }
                error!("server: couldn't accept client: {}", err);
                sleep(ACCEPT_BACKOFF).await;
                return Ok(());
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            warn!("server: couldn't set nodelay for {}: {}", addr, err);
        }

        let peer = Peer::new(addr, link(stream, self.config.max_resyncs), self.config.strikes);
        match self.peers.insert(peer) {
            Ok(id) => info!("server: new connection from {} on slot {}", addr, id.index()),
            // The refused peer is dropped here, closing its socket.
            Err(full) => warn!("server: couldn't accept {}, {}", addr, full),
        }
        Ok(())
    }

    async fn handle(&mut self, id: SlotId, received: Received) {
        match received {
            Received::Packet(packet) => {
                if let Some(peer) = self.peers.get_mut(id) {
                    peer.clear_strikes();
                }
                self.respond(id, packet).await;
            }
            Received::Disconnected => {
                self.kick(id, "hung up");
            }
            Received::Transport(TransportError::Recoverable(err)) => {
                debug!("server: slot {} recv: {}", id.index(), err);
                self.kick(id, "disconnected");
            }
            Received::Transport(TransportError::Fatal(err)) => {
                error!("server: slot {} recv failed: {}", id.index(), err);
                self.kick(id, "errored");
            }
            Received::Invalid(err) => {
                warn!("server: slot {} {}", id.index(), err);
                self.strike(id);
            }
            Received::Desync(discarded) => {
                warn!(
                    "server: slot {} desynced, discarded {} bytes",
                    id.index(),
                    discarded
                );
                self.strike(id);
            }
        }
    }

    async fn respond(&mut self, id: SlotId, packet: Packet) {
        match packet.kind {
            Kind::Msg | Kind::Whisper | Kind::Join | Kind::Exit => {
                self.fanout(id, &packet).await;
                self.reply(id, &packet.ack()).await;
            }
            Kind::Ping => self.reply(id, &packet.pong()).await,
            Kind::Disconnect | Kind::Ack | Kind::Pong => {
                self.kick(id, "finished");
            }
        }
    }

    /// Relays `packet` unchanged to every registered peer but its sender.
    async fn fanout(&mut self, sender: SlotId, packet: &Packet) {
        let timeout = self.config.io_timeout;
        let mut failed = vec![];

        for id in self.peers.ids() {
            if id == sender {
                continue;
            }
            if let Some(peer) = self.peers.get_mut(id) {
                if let Err(err) = transport::send(&mut peer.link, packet, timeout).await {
                    failed.push((id, err));
                }
            }
        }

        for (id, err) in failed {
            self.send_failed(id, err);
        }
    }

    async fn reply(&mut self, id: SlotId, packet: &Packet) {
        let timeout = self.config.io_timeout;
        let sent = match self.peers.get_mut(id) {
            Some(peer) => transport::send(&mut peer.link, packet, timeout).await,
            None => return,
        };
        if let Err(err) = sent {
            self.send_failed(id, err);
        }
    }

    /// A send that timed out is charged as a strike, anything else drops the peer.
    fn send_failed(&mut self, id: SlotId, err: TransportError) {
        match err {
            TransportError::Recoverable(ref io) if io.kind() == io::ErrorKind::TimedOut => {
                warn!("server: slot {} send timed out", id.index());
                self.strike(id);
            }
            err => {
                debug!("server: slot {} send: {}", id.index(), err);
                self.kick(id, "disconnected");
            }
        }
    }

    fn strike(&mut self, id: SlotId) {
        let kick = match self.peers.get_mut(id) {
            Some(peer) => peer.strike(Instant::now()),
            None => return,
        };
        if kick {
            self.kick(id, "blocked and kicked");
        }
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let limit = self.config.io_timeout;
        for id in self.peers.ids() {
            let stalled = match self.peers.get_mut(id) {
                Some(peer) => peer.stalled(now, limit),
                None => false,
            };
            if stalled {
                warn!("server: slot {} timed out mid-frame", id.index());
                self.strike(id);
            }
        }
    }

    fn kick(&mut self, id: SlotId, reason: &str) {
        if let Some(peer) = self.peers.remove(id) {
            info!(
                "server: {} on slot {} {} ({} clients left)",
                peer.addr,
                id.index(),
                reason,
                self.clients()
            );
        }
    }
}

/// Errors that mean the listening socket itself is unusable.
fn listener_is_broken(err: &io::Error) -> bool {
    match err.raw_os_error() {
        Some(code) => code == libc::EBADF || code == libc::EINVAL || code == libc::ENOTSOCK,
        None => false,
    }
}
