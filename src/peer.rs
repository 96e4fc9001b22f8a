//! Defines the server's view of one connected client.
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::StrikePolicy;
use crate::transport::Link;

/// Counts tolerated faults inside a sliding window.
///
/// The window opens at the first strike. Strikes older than the window are forgotten, and any
/// valid packet clears the count.
#[derive(Debug, Clone)]
pub struct Strikes {
    policy: StrikePolicy,
    count: u32,
    opened: Option<Instant>,
}

impl Strikes {
    pub fn new(policy: StrikePolicy) -> Strikes {
        Strikes {
            policy,
            count: 0,
            opened: None,
        }
    }

    /// Charges one strike. Returns true once the connection should be kicked.
    pub fn charge(&mut self, now: Instant) -> bool {
        match self.opened {
            Some(opened) if now.duration_since(opened) < self.policy.window => self.count += 1,
            _ => {
                self.opened = Some(now);
                self.count = 1;
            }
        }
        self.count >= self.policy.limit
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.opened = None;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// A registered client connection.
pub struct Peer {
    pub addr: SocketAddr,
    pub link: Link,
    strikes: Strikes,
    /// When buffered bytes of an incomplete frame were last seen to change, and how many.
    partial: Option<(Instant, usize)>,
}

impl Peer {
    pub fn new(addr: SocketAddr, link: Link, policy: StrikePolicy) -> Peer {
        Peer {
            addr,
            link,
            strikes: Strikes::new(policy),
            partial: None,
        }
    }

    pub fn strike(&mut self, now: Instant) -> bool {
        self.strikes.charge(now)
    }

    pub fn clear_strikes(&mut self) {
        self.strikes.clear();
    }

    /// True when an incomplete frame has sat unchanged for at least `limit`. A frame counts as
    /// incomplete while bytes are buffered or while its header has been taken and the payload is
    /// outstanding. The stall clock restarts after reporting, so a stuck peer is reported once per
    /// `limit`.
    pub fn stalled(&mut self, now: Instant, limit: Duration) -> bool {
        let buffered = self.link.read_buffer().len();
        if buffered == 0 && !self.link.codec().in_frame() {
            self.partial = None;
            return false;
        }
        match self.partial {
            Some((since, len)) if len == buffered => {
                if now.duration_since(since) >= limit {
                    self.partial = Some((now, buffered));
                    return true;
                }
                false
            }
            _ => {
                self.partial = Some((now, buffered));
                false
            }
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("strikes", &self.strikes.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StrikePolicy {
        StrikePolicy {
            limit: 3,
            window: Duration::from_secs(10),
        }
    }

    #[test]
    fn third_strike_in_window_kicks() {
        let mut strikes = Strikes::new(policy());
        let start = Instant::now();
        assert!(!strikes.charge(start));
        assert!(!strikes.charge(start + Duration::from_secs(1)));
        assert!(strikes.charge(start + Duration::from_secs(2)));
    }

    #[test]
    fn strikes_outside_window_are_forgotten() {
        let mut strikes = Strikes::new(policy());
        let start = Instant::now();
        assert!(!strikes.charge(start));
        assert!(!strikes.charge(start + Duration::from_secs(1)));
        assert!(!strikes.charge(start + Duration::from_secs(11)));
        assert_eq!(strikes.count(), 1);
    }

    #[test]
    fn valid_traffic_clears_strikes() {
        let mut strikes = Strikes::new(policy());
        let start = Instant::now();
        strikes.charge(start);
        strikes.charge(start);
        strikes.clear();
        assert!(!strikes.charge(start));
        assert_eq!(strikes.count(), 1);
    }
}
