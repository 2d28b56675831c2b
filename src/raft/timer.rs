use std::time::{Duration, Instant};

use rand::Rng;

/// Election and heartbeat timing for one node.
///
/// Followers and candidates wait a fresh uniformly random interval in
/// `[min, max]` before giving up on the current leader; the spread keeps
/// simultaneous candidacies rare. A leader instead beats at a third of the
/// lower bound so followers hear from it well before they could time out.
#[derive(Debug)]
pub struct ElectionTimer {
    election_min: Duration,
    election_max: Duration,
    heartbeat: Duration,
    deadline: Instant,
}

impl ElectionTimer {
    pub fn new(election_min_ms: u64, election_max_ms: u64, now: Instant) -> Self {
        let mut timer = ElectionTimer {
            election_min: Duration::from_millis(election_min_ms),
            election_max: Duration::from_millis(election_max_ms),
            heartbeat: Duration::from_millis(election_min_ms / 3),
            deadline: now,
        };
        timer.reset_election(now);
        timer
    }

    /// Arms a fresh randomized election timeout.
    pub fn reset_election(&mut self, now: Instant) {
        let spread = (self.election_max - self.election_min).as_millis() as u64;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        self.deadline = now + self.election_min + jitter;
    }

    /// Arms the short leader heartbeat interval.
    pub fn reset_heartbeat(&mut self, now: Instant) {
        self.deadline = now + self.heartbeat;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}
