use crate::consensus::latch::CountdownLatch;
use crate::consensus::quorum::PeerId;
use std::collections::HashSet;
use std::sync::Mutex;

/// MajorityOpStatusTracker is the acknowledgement latch for one
/// leader-proposed operation. Each peer (self included) acks once; acks from
/// voting peers count toward the majority latch, acks from learners only
/// bump the replicated count.
pub struct MajorityOpStatusTracker {
    logger: slog::Logger,
    voting_peers: HashSet<PeerId>,
    majority: usize,
    total_peers_count: usize,
    replicated_count: Mutex<usize>,
    completion_latch: CountdownLatch,
}

impl MajorityOpStatusTracker {
    pub fn new(
        logger: slog::Logger,
        voting_peers: HashSet<PeerId>,
        majority: usize,
        total_peers_count: usize,
    ) -> Self {
        MajorityOpStatusTracker {
            logger,
            voting_peers,
            majority,
            total_peers_count,
            replicated_count: Mutex::new(0),
            completion_latch: CountdownLatch::new(majority),
        }
    }

    pub fn ack_peer(&self, uuid: &PeerId) {
        assert!(!uuid.as_str().is_empty(), "Peer acked with empty uuid");
        let mut replicated = self
            .replicated_count
            .lock()
            .expect("MajorityOpStatusTracker.ack_peer() mutex guard poison");
        if self.voting_peers.contains(uuid) {
            self.completion_latch.count_down();
        }
        *replicated += 1;
        debug_assert!(
            *replicated <= self.total_peers_count,
            "More acks than peers. Acked={}, TotalPeers={}",
            *replicated,
            self.total_peers_count,
        );
    }

    /// True once a majority of voting peers have acked.
    pub fn is_done(&self) -> bool {
        self.completion_latch.count() == 0
    }

    /// True once every peer, voting or not, has acked.
    pub fn is_all_done(&self) -> bool {
        let replicated = self
            .replicated_count
            .lock()
            .expect("MajorityOpStatusTracker.is_all_done() mutex guard poison");
        *replicated >= self.total_peers_count
    }

    /// Blocks until a majority of voting peers have acked.
    pub fn wait(&self) {
        self.completion_latch.wait();
    }

    pub fn summary(&self) -> String {
        let replicated = self
            .replicated_count
            .lock()
            .expect("MajorityOpStatusTracker.summary() mutex guard poison");
        format!(
            "IsDone: {}, AllPeers: {}, VotingPeers: {}, AckedPeers: {}, Majority: {}",
            self.is_done(),
            self.total_peers_count,
            self.voting_peers.len(),
            *replicated,
            self.majority,
        )
    }
}

impl Drop for MajorityOpStatusTracker {
    fn drop(&mut self) {
        // Dropping before majority means the leader stepped down (or shut
        // down) with this op un-acked.
        if !self.is_done() {
            slog::warn!(self.logger, "Dropping incomplete operation: {}", self.summary());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn voting(uuids: &[&str]) -> HashSet<PeerId> {
        uuids.iter().map(|u| PeerId::new(*u)).collect()
    }

    #[test]
    fn majority_of_voting_acks_completes() {
        let tracker =
            MajorityOpStatusTracker::new(test_logger(), voting(&["a", "b", "c"]), 2, 3);

        assert!(!tracker.is_done());
        tracker.ack_peer(&PeerId::new("a"));
        assert!(!tracker.is_done());
        tracker.ack_peer(&PeerId::new("b"));
        assert!(tracker.is_done());
        assert!(!tracker.is_all_done());

        tracker.ack_peer(&PeerId::new("c"));
        assert!(tracker.is_all_done());
        tracker.wait();
    }

    #[test]
    fn non_voter_ack_does_not_advance_latch() {
        // 2 voters + 1 learner; majority is 2.
        let tracker = MajorityOpStatusTracker::new(test_logger(), voting(&["a", "b"]), 2, 3);

        tracker.ack_peer(&PeerId::new("learner"));
        assert!(!tracker.is_done());

        tracker.ack_peer(&PeerId::new("a"));
        tracker.ack_peer(&PeerId::new("b"));
        assert!(tracker.is_done());
        assert!(tracker.is_all_done());
    }

    #[test]
    fn drop_before_done_only_warns() {
        let tracker = MajorityOpStatusTracker::new(test_logger(), voting(&["a", "b", "c"]), 2, 3);
        tracker.ack_peer(&PeerId::new("a"));
        drop(tracker);
    }
}
