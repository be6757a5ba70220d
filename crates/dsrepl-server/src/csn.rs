//! Change sequence numbers and per-origin replication state.
//!
//! A CSN is `(time_ms, server_id, seq)` and is compared lexicographically on
//! that tuple, so CSNs issued by different servers are comparable without any
//! coordination. The derived `Ord` relies on the field declaration order.

use crate::error::ReplError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a directory server or replication server. `0` is reserved.
pub type ServerId = u16;

/// Durability group identifier (valid range `1..=127`).
pub type GroupId = u8;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Change sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    /// Wall-clock time of the originating write (ms since epoch).
    pub time_ms: u64,
    /// Originating server.
    pub server_id: ServerId,
    /// Tie-breaker within one millisecond.
    pub seq: u32,
}

impl Csn {
    /// Create a new CSN.
    pub fn new(time_ms: u64, server_id: ServerId, seq: u32) -> Self {
        Self {
            time_ms,
            server_id,
            seq,
        }
    }

    /// The smallest CSN for a server, used as a "from the beginning" cursor.
    pub fn zero(server_id: ServerId) -> Self {
        Self::new(0, server_id, 0)
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:04x}{:08x}", self.time_ms, self.server_id, self.seq)
    }
}

impl FromStr for Csn {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 28 || !s.is_ascii() {
            return Err(ReplError::Protocol {
                msg: format!("invalid CSN string: {:?}", s),
            });
        }
        let parse = |part: &str| {
            u64::from_str_radix(part, 16).map_err(|e| ReplError::Protocol {
                msg: format!("invalid CSN string {:?}: {}", s, e),
            })
        };
        Ok(Self {
            time_ms: parse(&s[0..16])?,
            server_id: parse(&s[16..20])? as ServerId,
            seq: parse(&s[20..28])? as u32,
        })
    }
}

/// Highest CSN seen per originating server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    csns: BTreeMap<ServerId, Csn>,
}

impl ServerState {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a CSN. Returns true if it advanced the state for its origin.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.get(&csn.server_id) {
            Some(existing) if *existing >= csn => false,
            _ => {
                self.csns.insert(csn.server_id, csn);
                true
            }
        }
    }

    /// Highest CSN seen for an origin.
    pub fn get(&self, server_id: ServerId) -> Option<Csn> {
        self.csns.get(&server_id).copied()
    }

    /// True if `csn` is at or below what this state has already seen.
    pub fn covers(&self, csn: &Csn) -> bool {
        self.csns
            .get(&csn.server_id)
            .map(|seen| csn <= seen)
            .unwrap_or(false)
    }

    /// Iterate over (origin, highest CSN).
    pub fn iter(&self) -> impl Iterator<Item = (ServerId, Csn)> + '_ {
        self.csns.iter().map(|(id, csn)| (*id, *csn))
    }

    /// Number of origins tracked.
    pub fn len(&self) -> usize {
        self.csns.len()
    }

    /// True if no origin is tracked.
    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }
}

#[derive(Debug)]
struct GeneratorState {
    last_time_ms: u64,
    seq: u32,
}

/// Issues strictly increasing CSNs for one server.
#[derive(Debug)]
pub struct CsnGenerator {
    server_id: ServerId,
    state: Mutex<GeneratorState>,
}

impl CsnGenerator {
    /// Create a generator for `server_id`.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            state: Mutex::new(GeneratorState {
                last_time_ms: 0,
                seq: 0,
            }),
        }
    }

    /// Create a generator that resumes after `last` (e.g. from a stored server state).
    pub fn resume(server_id: ServerId, last: Option<Csn>) -> Self {
        let generator = Self::new(server_id);
        if let Some(csn) = last {
            generator.adjust(csn);
        }
        generator
    }

    /// Server this generator issues CSNs for.
    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// Issue a CSN using the wall clock.
    pub fn next_csn(&self) -> Csn {
        self.next_at(now_ms())
    }

    /// Issue a CSN for an explicit clock reading. A clock that goes
    /// backwards never produces a smaller CSN.
    pub fn next_at(&self, now_ms: u64) -> Csn {
        let mut state = self.state.lock();
        if now_ms > state.last_time_ms {
            state.last_time_ms = now_ms;
            state.seq = 0;
        } else if state.seq == u32::MAX {
            state.last_time_ms += 1;
            state.seq = 0;
        } else {
            state.seq += 1;
        }
        Csn::new(state.last_time_ms, self.server_id, state.seq)
    }

    /// Move past a CSN observed from any server so later CSNs sort after it.
    pub fn adjust(&self, seen: Csn) {
        let mut state = self.state.lock();
        let current = Csn::new(state.last_time_ms, self.server_id, state.seq);
        if seen <= current {
            return;
        }
        if seen.server_id < self.server_id {
            state.last_time_ms = seen.time_ms;
        } else {
            state.last_time_ms = seen.time_ms.saturating_add(1);
        }
        state.seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = Csn::new(100, 9, 9);
        let b = Csn::new(101, 1, 0);
        let c = Csn::new(101, 2, 0);
        let d = Csn::new(101, 2, 1);
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn test_display_parse_roundtrip() {
        let csn = Csn::new(0x0000_0191_2a3b_4c5d, 42, 7);
        let text = csn.to_string();
        assert_eq!(text.len(), 28);
        assert_eq!(text, "000001912a3b4c5d002a00000007");
        assert_eq!(text.parse::<Csn>().unwrap(), csn);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("xyz".parse::<Csn>().is_err());
        assert!("zzzzzzzzzzzzzzzzzzzzzzzzzzzz".parse::<Csn>().is_err());
    }

    #[test]
    fn test_server_state_update_only_advances() {
        let mut state = ServerState::new();
        assert!(state.update(Csn::new(10, 1, 0)));
        assert!(!state.update(Csn::new(9, 1, 5)));
        assert!(!state.update(Csn::new(10, 1, 0)));
        assert!(state.update(Csn::new(10, 2, 0)));
        assert_eq!(state.get(1), Some(Csn::new(10, 1, 0)));
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_server_state_covers() {
        let mut state = ServerState::new();
        state.update(Csn::new(10, 1, 3));
        assert!(state.covers(&Csn::new(10, 1, 3)));
        assert!(state.covers(&Csn::new(9, 1, 99)));
        assert!(!state.covers(&Csn::new(10, 1, 4)));
        assert!(!state.covers(&Csn::new(1, 2, 0)));
    }

    #[test]
    fn test_generator_monotonic_with_stalled_clock() {
        let gen = CsnGenerator::new(3);
        let a = gen.next_at(1000);
        let b = gen.next_at(1000);
        let c = gen.next_at(999);
        let d = gen.next_at(1001);
        assert!(a < b && b < c && c < d);
        assert_eq!(d, Csn::new(1001, 3, 0));
    }

    #[test]
    fn test_generator_adjust_moves_past_remote() {
        let gen = CsnGenerator::new(1);
        gen.adjust(Csn::new(5000, 2, 17));
        let next = gen.next_at(10);
        assert!(next > Csn::new(5000, 2, 17));
        assert_eq!(next.server_id, 1);

        let high = CsnGenerator::new(9);
        high.adjust(Csn::new(5000, 2, 17));
        assert!(high.next_at(10) > Csn::new(5000, 2, 17));
    }

    #[test]
    fn test_generator_resume() {
        let gen = CsnGenerator::resume(1, Some(Csn::new(2000, 1, 4)));
        assert!(gen.next_at(2000) > Csn::new(2000, 1, 4));
    }
}
