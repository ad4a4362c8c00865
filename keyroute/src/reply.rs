//! Replies to searches and insert data transfer.
//!
//! Everything a next hop sends back (acceptance, rejections, data, outcomes)
//! arrives here, as does insert data flowing down from the predecessor and
//! transfer completions from downstream receivers.

use tracing::{debug, trace, warn};

use crate::config::NodeConfig;
use crate::error::ProtocolError;
use crate::message::Message;
use crate::node::{Node, Timer};
use crate::routing::SearchExtra;
use crate::search::{SearchKind, SearchOutcome, SearchState};
use crate::time::Timestamp;
use crate::types::{Key, PeerId, SearchId, BLOCKS_PER_CHK};

impl<Cfg: NodeConfig> Node<Cfg> {
    /// Dispatch one message delivered by the transport.
    pub(crate) fn handle_message(&mut self, from: PeerId, message: Message, now: Timestamp) {
        match message {
            Message::ChkRequest(search) => {
                self.handle_search(from, SearchKind::ChkRequest, search, SearchExtra::None, now)
            }
            Message::ChkInsert(search) => {
                self.handle_search(from, SearchKind::ChkInsert, search, SearchExtra::None, now)
            }
            Message::SskRequest {
                search,
                need_pub_key,
            } => self.handle_search(
                from,
                SearchKind::SskRequest,
                search,
                SearchExtra::NeedPubKey(need_pub_key),
                now,
            ),
            Message::SskInsert { search, value } => self.handle_search(
                from,
                SearchKind::SskInsert,
                search,
                SearchExtra::Value(value),
                now,
            ),
            Message::Token { count } => {
                if Cfg::USE_TOKENS {
                    self.peers[from.0].add_tokens(count);
                }
            }
            reply => self.handle_reply(from, reply, now),
        }
    }

    fn handle_reply(&mut self, from: PeerId, message: Message, now: Timestamp) {
        let Some(id) = message.search_id() else {
            return;
        };
        let Some(handler) = self.searches.get(&id) else {
            warn!(
                node = %self.address,
                peer = %self.remote(from),
                search = %id,
                ?message,
                "message for unknown search"
            );
            self.stats.stale_messages += 1;
            return;
        };
        let from_prev = handler.prev == Some(from);
        let (kind, next, state) = (handler.kind, handler.next, handler.state);

        // Insert data comes from upstream, completions from any receiver.
        match message {
            Message::TransfersCompleted { .. } => {
                self.transfers_completed(id, from, now);
                return;
            }
            Message::DataInsert { .. } if from_prev => {
                self.insert_data(id, None, now);
                return;
            }
            Message::Block { index, .. } if from_prev && kind.is_insert() => {
                self.insert_data(id, Some(index), now);
                return;
            }
            _ => {}
        }

        if next != Some(from) {
            debug!(
                node = %self.address,
                peer = %self.remote(from),
                search = %id,
                ?message,
                "ignoring reply from a peer that is not the next hop"
            );
            self.stats.stale_messages += 1;
            return;
        }

        // Anything but a rejection from the next hop means it accepted.
        let rejection = matches!(
            message,
            Message::RejectedLoop { .. } | Message::RejectedOverload { local: true, .. }
        );
        if state == SearchState::Sent && !rejection {
            let need_pub_key = matches!(
                message,
                Message::SskAccepted {
                    need_pub_key: true,
                    ..
                }
            );
            self.next_hop_accepted(id, from, need_pub_key, now);
            if matches!(message, Message::Accepted { .. } | Message::SskAccepted { .. }) {
                return;
            }
        }

        match message {
            Message::Accepted { .. } | Message::SskAccepted { .. } => {
                trace!(node = %self.address, search = %id, "duplicate acceptance");
            }
            Message::RejectedLoop { .. } => self.next_hop_rejected(id, from, false, now),
            Message::RejectedOverload { local: true, .. } => {
                self.relay_overload(id, now);
                self.next_hop_rejected(id, from, true, now);
            }
            Message::RejectedOverload { local: false, .. } => self.relay_overload(id, now),
            Message::RouteNotFound { htl, .. } => {
                if let Some(handler) = self.searches.get_mut(&id) {
                    handler.htl = handler.htl.min(htl);
                }
                self.forward_search(id, now);
            }
            Message::DataNotFound { .. } => {
                debug_assert!(!kind.is_insert(), "data-not-found for an insert");
                self.data_not_found(id, now);
            }
            Message::ChkDataFound { .. } => {
                debug_assert_eq!(kind, SearchKind::ChkRequest);
                if let Some(handler) = self.searches.get_mut(&id) {
                    handler.header = true;
                }
                self.enter_transfer(id, now);
                self.relay_upstream(id, Message::ChkDataFound { id }, now);
                self.check_request_complete(id, now);
            }
            Message::Block { index, .. } if kind == SearchKind::ChkRequest => {
                let fresh = self
                    .searches
                    .get_mut(&id)
                    .is_some_and(|handler| handler.set_block(index));
                if fresh {
                    self.enter_transfer(id, now);
                    self.relay_upstream(id, Message::Block { id, index }, now);
                    self.check_request_complete(id, now);
                }
            }
            Message::SskDataFound { value, .. } if kind == SearchKind::SskRequest => {
                self.ssk_found(id, value, now);
            }
            Message::SskDataFound { value, .. } if kind == SearchKind::SskInsert => {
                self.collision_downstream(id, value, now);
            }
            Message::InsertReply { .. } => {
                debug_assert!(kind.is_insert(), "insert reply for a request");
                if let Some(handler) = self.searches.get_mut(&id) {
                    handler.reply_received = true;
                }
                self.maybe_finish_insert(id, now);
            }
            other => {
                warn!(
                    node = %self.address,
                    search = %id,
                    ?kind,
                    message = ?other,
                    "unexpected message for search"
                );
            }
        }
    }

    // ---------------------------------------------------------------------
    // Acceptance and rejection
    // ---------------------------------------------------------------------

    fn next_hop_accepted(&mut self, id: SearchId, next: PeerId, need_pub_key: bool, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        handler.state = SearchState::Accepted;
        let epoch = handler.bump_epoch();
        let kind = handler.kind;
        let transfer = match kind {
            SearchKind::ChkInsert => true,
            SearchKind::SskInsert => need_pub_key,
            _ => false,
        };
        if transfer {
            handler.receivers.insert(next);
        }
        trace!(node = %self.address, search = %id, peer = %self.peers[next.0].remote(), "accepted");

        if Cfg::USE_BACKOFF {
            self.peers[next.0].reset_backoff(Cfg::INITIAL_BACKOFF);
        }
        self.set_timer(now + Cfg::SEARCH_TIMEOUT, Timer::Search { id, epoch });

        if transfer {
            self.send(
                next,
                Message::DataInsert {
                    id,
                    pub_key: kind == SearchKind::SskInsert,
                },
                now,
            );
            if kind == SearchKind::ChkInsert {
                for index in 0..BLOCKS_PER_CHK as u8 {
                    self.send(next, Message::Block { id, index }, now);
                }
            }
        }
    }

    /// The next hop refused the search: try the next candidate.
    fn next_hop_rejected(&mut self, id: SearchId, next: PeerId, overload: bool, now: Timestamp) {
        let Some(handler) = self.searches.get(&id) else {
            return;
        };
        if handler.state != SearchState::Sent {
            debug!(node = %self.address, search = %id, "rejection after acceptance ignored");
            return;
        }
        if Cfg::USE_TOKENS {
            // The rejected search never consumed the peer's credit.
            self.peers[next.0].add_tokens(1);
        }
        if overload && Cfg::USE_BACKOFF {
            self.peers[next.0].back_off(now, Cfg::MAX_BACKOFF, &mut self.rng);
        }
        self.forward_search(id, now);
    }

    /// Pass an overload notice upstream, or slow down if this node originated the search.
    fn relay_overload(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get(&id) else {
            return;
        };
        let prev = handler.prev;
        match prev {
            Some(prev) => self.send(prev, Message::RejectedOverload { id, local: false }, now),
            None => self.throttle_overloaded(),
        }
    }

    fn relay_upstream(&mut self, id: SearchId, message: Message, now: Timestamp) {
        if let Some(prev) = self.searches.get(&id).and_then(|handler| handler.prev) {
            self.send(prev, message, now);
        }
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    fn data_not_found(&mut self, id: SearchId, now: Timestamp) {
        self.relay_upstream(id, Message::DataNotFound { id }, now);
        self.finish(id, SearchOutcome::Failed(ProtocolError::DataNotFound(id)), now);
    }

    fn enter_transfer(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        if handler.state == SearchState::Transferring {
            return;
        }
        handler.state = SearchState::Transferring;
        let epoch = handler.bump_epoch();
        self.set_timer(now + Cfg::TRANSFER_TIMEOUT, Timer::Transfer { id, epoch });
    }

    fn check_request_complete(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get(&id) else {
            return;
        };
        if handler.header && handler.all_blocks() {
            let key = handler.key;
            self.remember_chk(key);
            self.finish(id, SearchOutcome::Success, now);
        }
    }

    fn ssk_found(&mut self, id: SearchId, value: u64, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        handler.value = Some(value);
        let (key, pub_key) = (handler.key, handler.upstream_needs_pub_key);
        self.remember_ssk(key, value);
        self.relay_upstream(id, Message::SskDataFound { id, value, pub_key }, now);
        self.finish(id, SearchOutcome::Success, now);
    }

    // ---------------------------------------------------------------------
    // Inserts
    // ---------------------------------------------------------------------

    /// Part of an insert's data arrived from upstream.
    fn insert_data(&mut self, id: SearchId, block: Option<u8>, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        if handler.data_ready {
            trace!(node = %self.address, search = %id, "insert data already complete");
            return;
        }
        match block {
            Some(index) => {
                handler.set_block(index);
            }
            None => handler.header = true,
        }
        let complete = match handler.kind {
            SearchKind::ChkInsert => handler.header && handler.all_blocks(),
            _ => handler.header,
        };
        if complete {
            self.insert_data_complete(id, true, now);
        }
    }

    /// All insert data is here: store it and forward the insert.
    pub(crate) fn insert_data_complete(&mut self, id: SearchId, transferred: bool, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        handler.data_ready = true;
        let (kind, key, value, prev) = (handler.kind, handler.key, handler.value, handler.prev);
        if let (true, Some(prev)) = (transferred, prev) {
            self.send(prev, Message::TransfersCompleted { id }, now);
        }

        match kind {
            SearchKind::ChkInsert => self.remember_chk(key),
            SearchKind::SskInsert => {
                self.store_ssk_insert(id, key, value.unwrap_or_default(), now)
            }
            _ => {}
        }
        self.forward_search(id, now);
    }

    /// Store an SSK insert's value unless a different one is already held.
    ///
    /// On a collision the handler continues with the stored value and reports
    /// it upstream.
    pub(crate) fn store_ssk_insert(&mut self, id: SearchId, key: Key, value: u64, now: Timestamp) {
        match self.store.ssk(key) {
            Some(old) if old != value => {
                debug!(
                    node = %self.address,
                    search = %id,
                    %key,
                    old,
                    new = value,
                    "collision, continuing with stored value"
                );
                if let Some(handler) = self.searches.get_mut(&id) {
                    handler.value = Some(old);
                    handler.collision = true;
                }
                self.relay_upstream(
                    id,
                    Message::SskDataFound {
                        id,
                        value: old,
                        pub_key: false,
                    },
                    now,
                );
            }
            _ => self.remember_ssk(key, value),
        }
    }

    /// A node downstream already held a different value for this SSK.
    fn collision_downstream(&mut self, id: SearchId, value: u64, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        handler.value = Some(value);
        handler.collision = true;
        let key = handler.key;
        self.remember_ssk(key, value);
        self.relay_upstream(
            id,
            Message::SskDataFound {
                id,
                value,
                pub_key: false,
            },
            now,
        );
    }

    fn transfers_completed(&mut self, id: SearchId, from: PeerId, now: Timestamp) {
        let removed = self
            .searches
            .get_mut(&id)
            .is_some_and(|handler| handler.receivers.remove(&from));
        if removed {
            self.maybe_finish_insert(id, now);
        } else {
            debug!(node = %self.address, search = %id, "completion from unknown receiver");
        }
    }

    /// Finish an insert once the path has answered and every receiver has its data.
    pub(crate) fn maybe_finish_insert(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        if !handler.reply_received {
            return;
        }
        if !handler.receivers.is_empty() {
            // Path is done; only the transfers remain.
            handler.state = SearchState::Transferring;
            let epoch = handler.bump_epoch();
            self.set_timer(now + Cfg::TRANSFER_TIMEOUT, Timer::Transfer { id, epoch });
            return;
        }

        let (prev, htl) = (handler.prev, handler.htl);
        // A collision is final even if the path ran out of peers afterwards.
        let outcome = if handler.collision {
            SearchOutcome::Collision {
                value: handler.value.unwrap_or_default(),
            }
        } else if handler.route_not_found {
            SearchOutcome::Failed(ProtocolError::RouteNotFound(id))
        } else {
            SearchOutcome::Success
        };
        if let Some(prev) = prev {
            let reply = if handler.route_not_found {
                Message::RouteNotFound { id, htl }
            } else {
                Message::InsertReply { id }
            };
            self.send(prev, reply, now);
        }
        self.finish(id, outcome, now);
    }
}
