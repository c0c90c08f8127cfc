use crate::consensus::quorum::{PeerId, PeerRole, Quorum, QuorumPeer};
use std::fs;
use std::io;
use std::path::PathBuf;

/// ConsensusMetadata is the durable record backing a replica's safety
/// guarantees: the current term, the vote cast in that term (if any), and the
/// committed quorum. ReplicaState builds a candidate record, flushes it, and
/// only installs it in memory once the flush succeeds, so a failed flush
/// leaves no trace.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusMetadata {
    current_term: u64,
    voted_for: Option<PeerId>,
    committed_quorum: Quorum,
}

impl ConsensusMetadata {
    pub fn new(current_term: u64, voted_for: Option<PeerId>, committed_quorum: Quorum) -> Self {
        ConsensusMetadata {
            current_term,
            voted_for,
            committed_quorum,
        }
    }

    pub fn current_term(&self) -> u64 {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<&PeerId> {
        self.voted_for.as_ref()
    }

    pub fn committed_quorum(&self) -> &Quorum {
        &self.committed_quorum
    }

    /// Returns a copy with the term replaced and the vote cleared. Clearing
    /// the vote on every term change is what makes vote-at-most-once hold
    /// across restarts.
    pub fn with_term(&self, new_term: u64) -> Self {
        ConsensusMetadata {
            current_term: new_term,
            voted_for: None,
            committed_quorum: self.committed_quorum.clone(),
        }
    }

    pub fn with_vote(&self, uuid: PeerId) -> Self {
        ConsensusMetadata {
            current_term: self.current_term,
            voted_for: Some(uuid),
            committed_quorum: self.committed_quorum.clone(),
        }
    }

    pub fn with_committed_quorum(&self, quorum: Quorum) -> Self {
        ConsensusMetadata {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            committed_quorum: quorum,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.current_term.to_le_bytes());
        match &self.voted_for {
            Some(uuid) => {
                buf.push(1);
                let bytes = uuid.as_str().as_bytes();
                buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf.extend_from_slice(bytes);
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&self.committed_quorum.canonical_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };

        let current_term = cursor.read_u64()?;
        let voted_for = match cursor.read_u8()? {
            0 => None,
            1 => {
                let len = cursor.read_u32()? as usize;
                Some(PeerId::new(cursor.read_str(len)?))
            }
            tag => return Err(malformed(format!("bad voted_for tag {}", tag))),
        };

        let seqno = cursor.read_u64()?;
        let num_peers = cursor.read_u32()? as usize;
        let mut peers = Vec::with_capacity(num_peers);
        for _ in 0..num_peers {
            let len = cursor.read_u32()? as usize;
            let uuid = PeerId::new(cursor.read_str(len)?);
            let role_tag = cursor.read_u8()?;
            let role = PeerRole::from_wire_tag(role_tag)
                .ok_or_else(|| malformed(format!("bad role tag {}", role_tag)))?;
            peers.push(QuorumPeer::new(uuid, role));
        }

        if cursor.pos != cursor.data.len() {
            return Err(malformed("trailing bytes".to_string()));
        }
        Ok(ConsensusMetadata::new(
            current_term,
            voted_for,
            Quorum::new(peers, seqno),
        ))
    }
}

fn malformed(detail: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed consensus metadata: {}", detail),
    )
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(malformed("truncated".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> io::Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn read_u64(&mut self) -> io::Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    fn read_str(&mut self, len: usize) -> io::Result<String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| malformed("non-utf8 uuid".to_string()))
    }
}

/// MetadataStore persists consensus metadata. A successful `flush` must mean
/// the record survives a crash, and a crash mid-flush must leave either the
/// old record or the new one, never a torn mix.
pub trait MetadataStore: Send {
    fn flush(&mut self, metadata: &ConsensusMetadata) -> io::Result<()>;
}

/// DiskMetadataStore keeps one file per tablet and flushes by writing a
/// sibling temp file, syncing it, and renaming it over the target.
pub struct DiskMetadataStore {
    path: PathBuf,
}

impl DiskMetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DiskMetadataStore { path: path.into() }
    }

    /// Reads the record back, or None if no flush has ever happened.
    pub fn load(&self) -> io::Result<Option<ConsensusMetadata>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(ConsensusMetadata::decode(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl MetadataStore for DiskMetadataStore {
    fn flush(&mut self, metadata: &ConsensusMetadata) -> io::Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&metadata.encode())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
    }
}

/// VolatileMetadataStore holds the last flushed record in memory. Used by
/// tests and by callers that accept losing consensus safety across restarts.
#[derive(Default)]
pub struct VolatileMetadataStore {
    last_flushed: Option<ConsensusMetadata>,
    flush_count: usize,
}

impl VolatileMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_flushed(&self) -> Option<&ConsensusMetadata> {
        self.last_flushed.as_ref()
    }

    pub fn flush_count(&self) -> usize {
        self.flush_count
    }
}

impl MetadataStore for VolatileMetadataStore {
    fn flush(&mut self, metadata: &ConsensusMetadata) -> io::Result<()> {
        self.last_flushed = Some(metadata.clone());
        self.flush_count += 1;
        Ok(())
    }
}
