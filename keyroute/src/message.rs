//! Protocol messages and packets.
//!
//! Messages are a closed set matched exhaustively by the node. Each declares
//! its byte size, which the transport sums against the congestion window and
//! bandwidth budget. Nothing is serialized: packets travel by value through the
//! simulator, but their declared sizes follow the wire layout.

use crate::types::{
    Address, Key, Location, SearchId, ACK_SIZE, BLOCK_SIZE, KEY_SIZE, MESSAGE_HEADER_SIZE,
    PACKET_HEADER_SIZE, PUB_KEY_SIZE, SSK_DATA_SIZE,
};

/// Fields shared by every search message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Search {
    pub id: SearchId,
    pub key: Key,
    /// Closest location to the key seen so far on this search's path.
    pub closest: Location,
    pub htl: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ChkRequest(Search),
    ChkInsert(Search),
    SskRequest {
        search: Search,
        need_pub_key: bool,
    },
    SskInsert {
        search: Search,
        value: u64,
    },
    Accepted {
        id: SearchId,
    },
    /// Accepts an SSK insert; asks for the public key if this node lacks it.
    SskAccepted {
        id: SearchId,
        need_pub_key: bool,
    },
    RejectedLoop {
        id: SearchId,
    },
    /// `local` is set by the overloaded node itself and cleared when relayed.
    RejectedOverload {
        id: SearchId,
        local: bool,
    },
    RouteNotFound {
        id: SearchId,
        htl: u8,
    },
    DataNotFound {
        id: SearchId,
    },
    ChkDataFound {
        id: SearchId,
    },
    /// Answers an SSK request, or reports a collision to an SSK insert.
    SskDataFound {
        id: SearchId,
        value: u64,
        pub_key: bool,
    },
    Block {
        id: SearchId,
        index: u8,
    },
    /// Announces the data of an insert; for SSKs it carries the public key.
    DataInsert {
        id: SearchId,
        pub_key: bool,
    },
    InsertReply {
        id: SearchId,
    },
    TransfersCompleted {
        id: SearchId,
    },
    Token {
        count: u32,
    },
}

impl Message {
    /// Declared size in bytes.
    pub fn size(&self) -> usize {
        MESSAGE_HEADER_SIZE
            + match self {
                Message::ChkRequest(_) | Message::ChkInsert(_) => KEY_SIZE,
                Message::SskRequest { .. } => KEY_SIZE,
                Message::SskInsert { .. } => KEY_SIZE + SSK_DATA_SIZE,
                Message::SskDataFound { pub_key, .. } => {
                    SSK_DATA_SIZE + if *pub_key { PUB_KEY_SIZE } else { 0 }
                }
                Message::DataInsert { pub_key: true, .. } => PUB_KEY_SIZE,
                Message::Block { .. } => BLOCK_SIZE,
                Message::Accepted { .. }
                | Message::SskAccepted { .. }
                | Message::RejectedLoop { .. }
                | Message::RejectedOverload { .. }
                | Message::RouteNotFound { .. }
                | Message::DataNotFound { .. }
                | Message::ChkDataFound { .. }
                | Message::DataInsert { pub_key: false, .. }
                | Message::InsertReply { .. }
                | Message::TransfersCompleted { .. }
                | Message::Token { .. } => 0,
            }
    }

    /// Blocks travel on the transfer queue; everything else on the search queue.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Message::Block { .. })
    }

    /// Search this message belongs to, if any.
    pub fn search_id(&self) -> Option<SearchId> {
        match self {
            Message::ChkRequest(s) | Message::ChkInsert(s) => Some(s.id),
            Message::SskRequest { search, .. } | Message::SskInsert { search, .. } => {
                Some(search.id)
            }
            Message::Accepted { id }
            | Message::SskAccepted { id, .. }
            | Message::RejectedLoop { id }
            | Message::RejectedOverload { id, .. }
            | Message::RouteNotFound { id, .. }
            | Message::DataNotFound { id }
            | Message::ChkDataFound { id }
            | Message::SskDataFound { id, .. }
            | Message::Block { id, .. }
            | Message::DataInsert { id, .. }
            | Message::InsertReply { id }
            | Message::TransfersCompleted { id } => Some(*id),
            Message::Token { .. } => None,
        }
    }
}

/// Wire-level unit between two directly connected nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub src: Address,
    pub dst: Address,
    /// Present only on packets carrying messages.
    pub seq: Option<u32>,
    pub acks: Vec<u32>,
    pub messages: Vec<Message>,
}

impl Packet {
    /// Header, acks and messages.
    pub fn size(&self) -> usize {
        PACKET_HEADER_SIZE
            + self.acks.len() * ACK_SIZE
            + self.messages.iter().map(Message::size).sum::<usize>()
    }

    pub fn is_ack_only(&self) -> bool {
        self.messages.is_empty()
    }
}
