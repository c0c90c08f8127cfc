use std::collections::HashSet;
use std::fmt;

/// PeerId is the permanent uuid of a replica participating in a tablet's
/// quorum.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(uuid: impl Into<String>) -> Self {
        PeerId(uuid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PeerRole {
    Leader,
    Follower,
    Candidate,
    Learner,
    NonParticipant,
}

impl PeerRole {
    pub fn is_voting(&self) -> bool {
        matches!(self, PeerRole::Leader | PeerRole::Follower)
    }

    pub(crate) fn wire_tag(&self) -> u8 {
        match self {
            PeerRole::Leader => 0,
            PeerRole::Follower => 1,
            PeerRole::Candidate => 2,
            PeerRole::Learner => 3,
            PeerRole::NonParticipant => 4,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Option<PeerRole> {
        match tag {
            0 => Some(PeerRole::Leader),
            1 => Some(PeerRole::Follower),
            2 => Some(PeerRole::Candidate),
            3 => Some(PeerRole::Learner),
            4 => Some(PeerRole::NonParticipant),
            _ => None,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeerRole::Leader => "LEADER",
            PeerRole::Follower => "FOLLOWER",
            PeerRole::Candidate => "CANDIDATE",
            PeerRole::Learner => "LEARNER",
            PeerRole::NonParticipant => "NON_PARTICIPANT",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QuorumPeer {
    permanent_uuid: PeerId,
    role: PeerRole,
}

impl QuorumPeer {
    pub fn new(permanent_uuid: PeerId, role: PeerRole) -> Self {
        QuorumPeer {
            permanent_uuid,
            role,
        }
    }

    pub fn permanent_uuid(&self) -> &PeerId {
        &self.permanent_uuid
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }
}

/// Quorum is the configured peer set for one tablet, plus a monotonically
/// increasing config sequence number. Two quorums are considered equal when
/// their canonical encodings are byte-equal, which keeps equality stable
/// across process restarts regardless of how each copy was assembled.
#[derive(Debug, Clone)]
pub struct Quorum {
    peers: Vec<QuorumPeer>,
    seqno: u64,
}

impl Quorum {
    pub fn new(peers: Vec<QuorumPeer>, seqno: u64) -> Self {
        Quorum { peers, seqno }
    }

    pub fn peers(&self) -> &[QuorumPeer] {
        &self.peers
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    pub fn set_seqno(&mut self, seqno: u64) {
        self.seqno = seqno;
    }

    /// Canonical encoding: seqno, then peers sorted by uuid, each framed as
    /// (uuid length, uuid bytes, role tag). Sorting makes the bytes a function
    /// of quorum content, not of insertion order.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut sorted: Vec<&QuorumPeer> = self.peers.iter().collect();
        sorted.sort_by(|a, b| a.permanent_uuid.cmp(&b.permanent_uuid));

        let mut buf = Vec::with_capacity(16 + sorted.len() * 24);
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
        for peer in sorted {
            let uuid = peer.permanent_uuid.as_str().as_bytes();
            buf.extend_from_slice(&(uuid.len() as u32).to_le_bytes());
            buf.extend_from_slice(uuid);
            buf.push(peer.role.wire_tag());
        }
        buf
    }
}

impl PartialEq for Quorum {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_bytes() == other.canonical_bytes()
    }
}

impl Eq for Quorum {}

/// QuorumState is the view of a Quorum derived for one peer. It is rebuilt
/// from scratch on any quorum change and never mutated in place; ReplicaState
/// swaps in a fresh instance under its lock.
#[derive(Debug, Clone)]
pub struct QuorumState {
    pub role: PeerRole,
    pub leader_uuid: Option<PeerId>,
    pub voting_peers: HashSet<PeerId>,
    pub majority_size: usize,
    pub quorum_size: usize,
    pub config_seqno: u64,
}

impl QuorumState {
    /// Walks the peer list once. A peer absent from the quorum is a
    /// NON_PARTICIPANT; an all-learner quorum has majority_size 1 (of zero
    /// voters), which no ack can ever satisfy.
    pub fn build(quorum: &Quorum, self_uuid: &PeerId) -> QuorumState {
        let mut role = PeerRole::NonParticipant;
        let mut leader_uuid = None;
        let mut voting_peers = HashSet::new();

        for peer in quorum.peers() {
            if peer.permanent_uuid() == self_uuid {
                role = peer.role();
            }
            if peer.role().is_voting() {
                voting_peers.insert(peer.permanent_uuid().clone());
            }
            if peer.role() == PeerRole::Leader {
                leader_uuid = Some(peer.permanent_uuid().clone());
            }
        }

        let majority_size = voting_peers.len() / 2 + 1;
        QuorumState {
            role,
            leader_uuid,
            voting_peers,
            majority_size,
            quorum_size: quorum.peers().len(),
            config_seqno: quorum.seqno(),
        }
    }
}
