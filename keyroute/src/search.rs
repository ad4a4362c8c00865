//! Per-search state.
//!
//! A node keeps one [`SearchHandler`] for every search passing through it,
//! whether it originated the search or forwards it. The four search kinds
//! share one handler type; kind-specific behavior hangs off [`SearchKind`].
//!
//! Handlers never hold references to connections. Predecessor, next hop and
//! candidates are [`PeerId`]s into the node's connection arena.

use hashbrown::HashSet;

use crate::error::ProtocolError;
use crate::message::{Message, Search};
use crate::time::Timestamp;
use crate::types::{Key, Location, PeerId, SearchId, BLOCKS_PER_CHK};

/// Bitmap value once every block of a CHK has arrived.
const ALL_BLOCKS: u32 = if BLOCKS_PER_CHK >= 32 {
    u32::MAX
} else {
    (1u32 << BLOCKS_PER_CHK) - 1
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchKind {
    ChkRequest,
    ChkInsert,
    SskRequest,
    SskInsert,
}

impl SearchKind {
    pub fn is_insert(self) -> bool {
        matches!(self, SearchKind::ChkInsert | SearchKind::SskInsert)
    }

    pub fn is_ssk(self) -> bool {
        matches!(self, SearchKind::SskRequest | SearchKind::SskInsert)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
    /// Created, not yet forwarded (or waiting for insert data).
    Started,
    /// Forwarded, waiting for the next hop to accept.
    Sent,
    /// Next hop accepted, waiting for an outcome.
    Accepted,
    /// Request data is arriving.
    Transferring,
    Completed,
}

/// How a locally originated search ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    Success,
    /// An SSK insert found an older, different value under its key.
    Collision { value: u64 },
    Failed(ProtocolError),
}

impl SearchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SearchOutcome::Success)
    }
}

/// Emitted when a locally originated search finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchReport {
    pub id: SearchId,
    pub kind: SearchKind,
    pub key: Key,
    pub outcome: SearchOutcome,
    /// SSK value found or inserted, if any.
    pub value: Option<u64>,
    pub started: Timestamp,
    pub finished: Timestamp,
}

#[derive(Debug, Clone)]
pub struct SearchHandler {
    pub id: SearchId,
    pub kind: SearchKind,
    pub key: Key,
    /// Closest location to the key on the path so far, this node included.
    pub closest: Location,
    pub htl: u8,
    /// `None` for a locally originated search.
    pub prev: Option<PeerId>,
    pub next: Option<PeerId>,
    /// Peers not yet tried.
    pub candidates: Vec<PeerId>,
    pub state: SearchState,
    /// Bumped on every transition that arms a timer; older timers are stale.
    pub epoch: u32,
    pub started: Timestamp,

    /// Header of the data (found message or insert announcement) has arrived.
    pub header: bool,
    blocks: u32,

    /// SSK value carried by this search.
    pub value: Option<u64>,
    /// The predecessor asked for the public key.
    pub upstream_needs_pub_key: bool,
    /// The value was replaced by an older one found downstream.
    pub collision: bool,

    /// Insert data has fully arrived and the search may be forwarded.
    pub data_ready: bool,
    /// Downstream peers still transferring insert data.
    pub receivers: HashSet<PeerId>,
    /// The downstream path has answered.
    pub reply_received: bool,
    /// The downstream answer was that no route exists.
    pub route_not_found: bool,
}

impl SearchHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: SearchId,
        kind: SearchKind,
        key: Key,
        closest: Location,
        htl: u8,
        prev: Option<PeerId>,
        candidates: Vec<PeerId>,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            kind,
            key,
            closest,
            htl,
            prev,
            next: None,
            candidates,
            state: SearchState::Started,
            epoch: 0,
            started: now,
            header: false,
            blocks: 0,
            value: None,
            upstream_needs_pub_key: false,
            collision: false,
            data_ready: false,
            receivers: HashSet::new(),
            reply_received: false,
            route_not_found: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.prev.is_none()
    }

    /// Advance the epoch, invalidating every timer armed so far.
    pub fn bump_epoch(&mut self) -> u32 {
        self.epoch = self.epoch.wrapping_add(1);
        self.epoch
    }

    /// Record a block. Returns `false` if it had already arrived.
    pub fn set_block(&mut self, index: u8) -> bool {
        if index as usize >= BLOCKS_PER_CHK {
            return false;
        }
        let bit = 1u32 << index;
        let fresh = self.blocks & bit == 0;
        self.blocks |= bit;
        fresh
    }

    pub fn has_block(&self, index: u8) -> bool {
        (index as usize) < BLOCKS_PER_CHK && self.blocks & (1u32 << index) != 0
    }

    pub fn all_blocks(&self) -> bool {
        self.blocks == ALL_BLOCKS
    }

    /// Mark every block present, for content this node already holds.
    pub fn fill_blocks(&mut self) {
        self.header = true;
        self.blocks = ALL_BLOCKS;
    }

    /// The search message to send to the next hop.
    pub fn search_message(&self, need_pub_key: bool) -> Message {
        let search = Search {
            id: self.id,
            key: self.key,
            closest: self.closest,
            htl: self.htl,
        };
        match self.kind {
            SearchKind::ChkRequest => Message::ChkRequest(search),
            SearchKind::ChkInsert => Message::ChkInsert(search),
            SearchKind::SskRequest => Message::SskRequest {
                search,
                need_pub_key,
            },
            SearchKind::SskInsert => Message::SskInsert {
                search,
                value: self.value.unwrap_or_default(),
            },
        }
    }
}
