//! The client's connection and its reconnect state machine.
//!
//! ```text
//! CONNECTED --(disconnect, reset, timeout)--> RECONNECTING --(connect)--> CONNECTED
//!                                                  |
//!                                                  +--(cancelled)--> STOPPED
//! ```
//!
//! Reconnecting first makes a burst of immediate attempts to ride out short blips, then retries
//! forever with exponential backoff plus jitter. The backoff wait races the session's
//! cancellation token, so a shutdown request never waits out a full delay.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use futures::StreamExt;
use log::{debug, info};
use rand::Rng;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::codec::Received;
use crate::error::TransportError;
use crate::packet::Packet;
use crate::transport::{self, link, Link};

const JITTER_RATIO: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Back-to-back attempts before any waiting.
    pub fast_retries: usize,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_timeout: Duration,
    pub send_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> ReconnectPolicy {
        ReconnectPolicy {
            fast_retries: 16,
            min_backoff: Duration::from_secs(1) / 16,
            max_backoff: Duration::from_secs(16),
            connect_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Exponential delay schedule: starts at the minimum, doubles per step, holds at the maximum.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Backoff {
        Backoff { next: min.min(max), max }
    }

    pub fn next_base(&mut self) -> Duration {
        let base = self.next;
        self.next = (self.next * 2).min(self.max);
        base
    }

    /// The next base delay plus a jitter drawn from `[0, base / 8)`.
    pub fn next_delay<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.next_base();
        base + jitter(base, rng)
    }
}

fn jitter<R: Rng + ?Sized>(base: Duration, rng: &mut R) -> Duration {
    let span = (base / JITTER_RATIO).as_nanos() as u64;
    if span == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(rng.random_range(0..span))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Reconnecting,
    Stopped,
}

/// Owns the socket. The descriptor is swapped in place on reconnect, and since only the session
/// task holds `&mut Connection`, nobody can observe it half-replaced.
pub struct Connection {
    target: SocketAddr,
    max_resyncs: usize,
    policy: ReconnectPolicy,
    link: Option<Link>,
    state: SessionState,
}

impl Connection {
    pub async fn open(
        target: SocketAddr,
        max_resyncs: usize,
        policy: ReconnectPolicy,
    ) -> io::Result<Connection> {
        let stream = transport::connect(target, policy.connect_timeout).await?;
        Ok(Connection {
            target,
            max_resyncs,
            policy,
            link: Some(link(stream, max_resyncs)),
            state: SessionState::Connected,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Waits for the next inbound frame.
    pub async fn recv(&mut self) -> Received {
        match self.link.as_mut() {
            Some(link) => Received::from_next(link.next().await),
            None => Received::Disconnected,
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), TransportError> {
        match self.link.as_mut() {
            Some(link) => transport::send(link, packet, self.policy.send_timeout).await,
            None => Err(TransportError::Recoverable(io::Error::from(
                io::ErrorKind::NotConnected,
            ))),
        }
    }

    /// Re-establishes the connection, retrying until it succeeds or `cancel` fires.
    ///
    /// Does nothing when already cancelled. Returns the resulting state, which is either
    /// `Connected` or `Stopped`.
    pub async fn reconnect(&mut self, cancel: &CancellationToken) -> SessionState {
        if cancel.is_cancelled() {
            return self.state;
        }

        self.state = SessionState::Reconnecting;
        // Dropping the stale link closes its descriptor.
        self.link = None;

        for attempt in 0..self.policy.fast_retries {
            if self.attempt(cancel).await {
                debug!("conn: reconnected on immediate attempt {}", attempt + 1);
                return self.state;
            }
            if cancel.is_cancelled() {
                return self.stop();
            }
        }

        let mut backoff = Backoff::new(self.policy.min_backoff, self.policy.max_backoff);
        while !cancel.is_cancelled() {
            if self.attempt(cancel).await {
                return self.state;
            }
            let delay = {
                let mut rng = rand::rng();
                backoff.next_delay(&mut rng)
            };
            debug!("conn: retrying {} in {:?}", self.target, delay);
            tokio::select! {
                _ = sleep(delay) => {}
                _ = cancel.cancelled() => break,
            }
        }
        self.stop()
    }

    async fn attempt(&mut self, cancel: &CancellationToken) -> bool {
        let connected = tokio::select! {
            connected = transport::connect(self.target, self.policy.connect_timeout) => connected,
            _ = cancel.cancelled() => return false,
        };
        match connected {
            Ok(stream) => {
                info!("conn: reconnected to {}", self.target);
                self.link = Some(link(stream, self.max_resyncs));
                self.state = SessionState::Connected;
                true
            }
            Err(err) => {
                debug!("conn: couldn't connect to {}: {}", self.target, err);
                false
            }
        }
    }

    fn stop(&mut self) -> SessionState {
        self.link = None;
        self.state = SessionState::Stopped;
        self.state
    }

    /// Closes the socket for good.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.get_mut().shutdown().await {
                debug!("conn: shutdown: {}", err);
            }
        }
        self.state = SessionState::Stopped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Instant;
    use tokio::net::TcpListener;

    fn quick() -> ReconnectPolicy {
        ReconnectPolicy {
            fast_retries: 2,
            min_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(80),
            connect_timeout: Duration::from_millis(200),
            send_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn base_delays_double_then_hold() {
        let mut backoff = Backoff::new(Duration::from_secs(1) / 16, Duration::from_secs(16));
        let delays: Vec<Duration> = (0..12).map(|_| backoff.next_base()).collect();
        assert_eq!(delays[0], Duration::from_millis(62) + Duration::from_micros(500));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(delays[8], Duration::from_secs(16));
        assert_eq!(delays[11], Duration::from_secs(16));
    }

    #[test]
    fn jitter_stays_below_an_eighth() {
        let mut backoff = Backoff::new(Duration::from_millis(80), Duration::from_secs(1));
        let mut rng = rand::rng();
        for _ in 0..200 {
            let base = backoff.clone().next_base();
            let delay = backoff.next_delay(&mut rng);
            assert!(delay >= base);
            assert!(delay < base + base / 8);
        }
    }

    #[test]
    fn zero_span_has_no_jitter() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(jitter(Duration::from_nanos(7), &mut rng), Duration::ZERO);
    }

    async fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn reconnects_once_server_returns() {
        let (listener, addr) = listener().await;
        let mut conn = Connection::open(addr, 8, quick()).await.unwrap();
        let _ = listener.accept().await.unwrap();
        drop(listener);

        let relisten = tokio::spawn(async move {
            sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let _ = listener.accept().await.unwrap();
        });

        let cancel = CancellationToken::new();
        let state = tokio::time::timeout(Duration::from_secs(5), conn.reconnect(&cancel))
            .await
            .unwrap();
        assert_eq!(state, SessionState::Connected);
        assert_eq!(conn.state(), SessionState::Connected);
        assert_eq!(conn.target(), addr);
        assert!(conn.is_online());
        relisten.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let (listener, addr) = listener().await;
        let mut policy = quick();
        policy.min_backoff = Duration::from_secs(30);
        policy.max_backoff = Duration::from_secs(30);
        let mut conn = Connection::open(addr, 8, policy).await.unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let state = conn.reconnect(&cancel).await;
        assert_eq!(state, SessionState::Stopped);
        assert_eq!(conn.state(), SessionState::Stopped);
        assert!(!conn.is_online());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn reconnect_is_a_noop_once_cancelled() {
        let (_listener, addr) = listener().await;
        let mut conn = Connection::open(addr, 8, quick()).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(conn.reconnect(&cancel).await, SessionState::Connected);
    }
}
