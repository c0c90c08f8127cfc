use std::fmt;

/// OpId identifies one replicated operation: the term it was proposed in and
/// its index within the log. Ordering is lexicographic, term first. The derive
/// relies on field declaration order, so keep `term` above `index`.
#[derive(Debug, Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct OpId {
    term: u64,
    index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> Self {
        OpId { term, index }
    }

    /// The zero id, ordered before any assignable op.
    pub fn initial() -> Self {
        OpId { term: 0, index: 0 }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}
