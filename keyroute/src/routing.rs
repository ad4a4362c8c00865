//! Greedy key routing with hops-to-live backtracking.
//!
//! A search is forwarded to the untried peer whose location is closest to the
//! key. Each hop that fails to get closer than the best location seen so far
//! costs one HTL; a node that is itself closer than anything on the path so
//! far grants the search a fresh `MAX_HTL`. When a next hop rejects the search
//! or runs out of routes, the node backtracks to its next candidate.

use tracing::{debug, trace};

use crate::config::NodeConfig;
use crate::error::{ProtocolError, TimeoutKind};
use crate::message::{Message, Search};
use crate::node::{Node, Timer};
use crate::search::{SearchHandler, SearchKind, SearchOutcome, SearchState};
use crate::time::Timestamp;
use crate::types::{PeerId, SearchId, BLOCKS_PER_CHK};

/// Kind-specific fields of an incoming search message.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SearchExtra {
    None,
    NeedPubKey(bool),
    Value(u64),
}

impl<Cfg: NodeConfig> Node<Cfg> {
    // ---------------------------------------------------------------------
    // Incoming searches
    // ---------------------------------------------------------------------

    /// Handle a request or insert arriving from `from`.
    pub(crate) fn handle_search(
        &mut self,
        from: PeerId,
        kind: SearchKind,
        search: Search,
        extra: SearchExtra,
        now: Timestamp,
    ) {
        let id = search.id;

        // A live handler counts even if its ID has aged out of `recent`.
        if self.recent.contains(&id) || self.searches.contains_key(&id) {
            debug!(
                node = %self.address,
                peer = %self.remote(from),
                error = %ProtocolError::LoopDetected(id),
                "rejecting search"
            );
            self.stats.loops_rejected += 1;
            self.send(from, Message::RejectedLoop { id }, now);
            // Never offer the search back to a peer that already has it.
            if let Some(handler) = self.searches.get_mut(&id) {
                handler.candidates.retain(|&p| p != from);
            }
            return;
        }

        let over_limit = self.searches.len() >= Cfg::MAX_ACTIVE_SEARCHES;
        if over_limit || (Cfg::USE_TOKENS && !self.peers[from.0].accept_token()) {
            debug!(
                node = %self.address,
                peer = %self.remote(from),
                error = %ProtocolError::Overloaded(id),
                "rejecting search"
            );
            self.stats.overloads_rejected += 1;
            self.send(from, Message::RejectedOverload { id, local: true }, now);
            return;
        }

        self.recent.put(id, ());
        let target = search.key.location();
        let (closest, htl) = if self.location.distance(target) < search.closest.distance(target) {
            (self.location, Cfg::MAX_HTL)
        } else {
            (search.closest, search.htl)
        };
        let candidates = (0..self.peers.len())
            .map(PeerId)
            .filter(|&p| p != from)
            .collect();
        let mut handler = SearchHandler::new(
            id,
            kind,
            search.key,
            closest,
            htl,
            Some(from),
            candidates,
            now,
        );
        trace!(
            node = %self.address,
            search = %id,
            ?kind,
            htl_in = search.htl,
            htl,
            "search accepted"
        );

        match (kind, extra) {
            (SearchKind::ChkRequest, _) => {
                self.searches.insert(id, handler);
                self.send(from, Message::Accepted { id }, now);
                if self.store.has_chk(search.key) {
                    self.send(from, Message::ChkDataFound { id }, now);
                    for index in 0..BLOCKS_PER_CHK as u8 {
                        self.send(from, Message::Block { id, index }, now);
                    }
                    self.finish(id, SearchOutcome::Success, now);
                } else {
                    self.forward_search(id, now);
                }
            }
            (SearchKind::SskRequest, extra) => {
                handler.upstream_needs_pub_key = matches!(extra, SearchExtra::NeedPubKey(true));
                let need_pub_key = handler.upstream_needs_pub_key;
                self.searches.insert(id, handler);
                self.send(from, Message::Accepted { id }, now);
                if let Some(value) = self.store.ssk(search.key) {
                    self.send(
                        from,
                        Message::SskDataFound {
                            id,
                            value,
                            pub_key: need_pub_key,
                        },
                        now,
                    );
                    if let Some(h) = self.searches.get_mut(&id) {
                        h.value = Some(value);
                    }
                    self.finish(id, SearchOutcome::Success, now);
                } else {
                    self.forward_search(id, now);
                }
            }
            (SearchKind::ChkInsert, _) => {
                self.searches.insert(id, handler);
                self.send(from, Message::Accepted { id }, now);
                self.await_insert_data(id, now);
            }
            (SearchKind::SskInsert, extra) => {
                if let SearchExtra::Value(value) = extra {
                    handler.value = Some(value);
                }
                let need_pub_key = !self.store.has_pub_key(search.key);
                // Without a key to fetch, the insert already has all its data.
                handler.header = !need_pub_key;
                self.searches.insert(id, handler);
                self.send(from, Message::SskAccepted { id, need_pub_key }, now);
                if need_pub_key {
                    self.await_insert_data(id, now);
                } else {
                    self.insert_data_complete(id, false, now);
                }
            }
        }
    }

    /// Wait for an insert's data to arrive from upstream.
    fn await_insert_data(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        let epoch = handler.bump_epoch();
        self.set_timer(now + Cfg::TRANSFER_TIMEOUT, Timer::Transfer { id, epoch });
    }

    // ---------------------------------------------------------------------
    // Local searches
    // ---------------------------------------------------------------------

    /// Begin a locally generated search, consulting the local datastore first.
    pub(crate) fn start_local(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get(&id) else {
            return;
        };
        let (kind, key, value) = (handler.kind, handler.key, handler.value);
        match kind {
            SearchKind::ChkRequest => {
                if self.store.has_chk(key) {
                    self.finish(id, SearchOutcome::Success, now);
                    return;
                }
            }
            SearchKind::SskRequest => {
                if let Some(found) = self.store.ssk(key) {
                    if let Some(h) = self.searches.get_mut(&id) {
                        h.value = Some(found);
                    }
                    self.finish(id, SearchOutcome::Success, now);
                    return;
                }
            }
            SearchKind::ChkInsert => {
                self.remember_chk(key);
                if let Some(h) = self.searches.get_mut(&id) {
                    h.fill_blocks();
                    h.data_ready = true;
                }
            }
            SearchKind::SskInsert => {
                if let Some(h) = self.searches.get_mut(&id) {
                    h.header = true;
                    h.data_ready = true;
                }
                self.store_ssk_insert(id, key, value.unwrap_or_default(), now);
            }
        }
        self.forward_search(id, now);
    }

    // ---------------------------------------------------------------------
    // Forwarding
    // ---------------------------------------------------------------------

    /// Closest untried candidate allowed by the enabled policies.
    fn select_candidate(&self, handler: &SearchHandler, now: Timestamp) -> Option<PeerId> {
        let target = handler.key.location();
        let closest = |respect_backoff: bool| {
            handler
                .candidates
                .iter()
                .copied()
                .filter(|&p| {
                    let peer = &self.peers[p.0];
                    !(Cfg::USE_TOKENS && peer.tokens_out() == 0)
                        && !(respect_backoff && peer.is_backed_off(now))
                })
                .min_by(|&a, &b| {
                    let da = self.peers[a.0].location().distance(target);
                    let db = self.peers[b.0].location().distance(target);
                    da.total_cmp(&db).then(a.cmp(&b))
                })
        };
        if Cfg::USE_BACKOFF {
            closest(true).or_else(|| closest(false))
        } else {
            closest(false)
        }
    }

    /// Send the search to its next candidate, or end it if none is left.
    pub(crate) fn forward_search(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get(&id) else {
            return;
        };

        if handler.htl == 0 {
            debug!(
                node = %self.address,
                search = %id,
                error = %ProtocolError::HopsExhausted(id),
                "search stops here"
            );
            self.hops_exhausted(id, now);
            return;
        }

        let Some(next) = self.select_candidate(handler, now) else {
            debug!(
                node = %self.address,
                search = %id,
                error = %ProtocolError::RouteNotFound(id),
                "search stops here"
            );
            self.route_not_found(id, now);
            return;
        };

        let (kind, key) = (handler.kind, handler.key);
        let target = key.location();
        let improves =
            self.peers[next.0].location().distance(target) < handler.closest.distance(target);
        let need_pub_key = kind == SearchKind::SskRequest && !self.store.has_pub_key(key);

        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        handler.candidates.retain(|&p| p != next);
        if !improves {
            handler.htl -= 1;
        }
        handler.next = Some(next);
        handler.state = SearchState::Sent;
        let epoch = handler.bump_epoch();
        let message = handler.search_message(need_pub_key);
        trace!(
            node = %self.address,
            search = %id,
            peer = %self.peers[next.0].remote(),
            htl = handler.htl,
            "forwarding search"
        );

        if Cfg::USE_TOKENS {
            self.peers[next.0].spend_token();
        }
        self.stats.searches_forwarded += 1;
        self.send(next, message, now);
        self.set_timer(now + Cfg::ACCEPTED_TIMEOUT, Timer::Accepted { id, epoch });
    }

    /// HTL reached zero: requests fail, inserts have gone far enough.
    fn hops_exhausted(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        if handler.kind.is_insert() {
            handler.reply_received = true;
            self.maybe_finish_insert(id, now);
            return;
        }
        let prev = handler.prev;
        match prev {
            Some(prev) => {
                self.send(prev, Message::DataNotFound { id }, now);
                self.finish(id, SearchOutcome::Failed(ProtocolError::DataNotFound(id)), now);
            }
            None => self.finish(id, SearchOutcome::Failed(ProtocolError::HopsExhausted(id)), now),
        }
    }

    /// No candidate left to try.
    fn route_not_found(&mut self, id: SearchId, now: Timestamp) {
        let Some(handler) = self.searches.get_mut(&id) else {
            return;
        };
        if handler.kind.is_insert() {
            handler.reply_received = true;
            handler.route_not_found = true;
            self.maybe_finish_insert(id, now);
            return;
        }
        if let Some(prev) = handler.prev {
            let htl = handler.htl;
            self.send(prev, Message::RouteNotFound { id, htl }, now);
        }
        self.finish(id, SearchOutcome::Failed(ProtocolError::RouteNotFound(id)), now);
    }

    // ---------------------------------------------------------------------
    // Timeouts
    // ---------------------------------------------------------------------

    /// Looks up a handler for a timer, returning `None` if the timer is stale.
    fn live_handler(&mut self, id: SearchId, epoch: u32) -> Option<&mut SearchHandler> {
        self.searches
            .get_mut(&id)
            .filter(|handler| handler.epoch == epoch)
    }

    pub(crate) fn handle_accepted_timeout(&mut self, id: SearchId, epoch: u32, now: Timestamp) {
        let Some(handler) = self.live_handler(id, epoch) else {
            return;
        };
        if handler.state != SearchState::Sent {
            return;
        }
        let next = handler.next;
        debug!(
            node = %self.address,
            search = %id,
            error = %ProtocolError::Timeout { id, kind: TimeoutKind::Accepted },
            "trying next candidate"
        );
        if let (true, Some(next)) = (Cfg::USE_BACKOFF, next) {
            let peer = &mut self.peers[next.0];
            peer.back_off(now, Cfg::MAX_BACKOFF, &mut self.rng);
        }
        self.forward_search(id, now);
    }

    pub(crate) fn handle_search_timeout(&mut self, id: SearchId, epoch: u32, now: Timestamp) {
        let Some(handler) = self.live_handler(id, epoch) else {
            return;
        };
        if handler.state != SearchState::Accepted {
            return;
        }
        let error = ProtocolError::Timeout {
            id,
            kind: TimeoutKind::Search,
        };
        debug!(node = %self.address, search = %id, %error, "search abandoned");
        self.finish(id, SearchOutcome::Failed(error), now);
    }

    pub(crate) fn handle_transfer_timeout(&mut self, id: SearchId, epoch: u32, now: Timestamp) {
        if self.live_handler(id, epoch).is_none() {
            return;
        }
        let error = ProtocolError::Timeout {
            id,
            kind: TimeoutKind::Transfer,
        };
        debug!(node = %self.address, search = %id, %error, "search abandoned");
        self.finish(id, SearchOutcome::Failed(error), now);
    }
}
