//! Protocol outcomes that end a search or drop a packet.
//!
//! None of these abort a run. Each is scoped to one search handler or one
//! connection, is logged, and is either reported to the originator of the
//! search or recovered by the transport.

use thiserror::Error;

use crate::types::{Address, SearchId};

/// Which timer gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Next hop never accepted the search.
    Accepted,
    /// Accepted search never produced an outcome.
    Search,
    /// Data transfer never completed.
    Transfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("search {0} already seen here")]
    LoopDetected(SearchId),

    #[error("search {0} rejected: overloaded")]
    Overloaded(SearchId),

    #[error("search {0} ran out of hops")]
    HopsExhausted(SearchId),

    #[error("search {0} has no untried route left")]
    RouteNotFound(SearchId),

    #[error("search {0} found no data")]
    DataNotFound(SearchId),

    #[error("sequence {seq} from {from} is beyond the receive window ending at {limit}")]
    SequenceOutOfRange { from: Address, seq: u32, limit: u32 },

    #[error("sequence {seq} from {from} dropped: {buffered} out-of-order packets already tracked")]
    ReassemblyOverflow {
        from: Address,
        seq: u32,
        buffered: usize,
    },

    #[error("search {id} timed out waiting for {kind:?}")]
    Timeout { id: SearchId, kind: TimeoutKind },
}
