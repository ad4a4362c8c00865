//! Reliable, congestion-controlled transport for one direction of a link.
//!
//! A `Connection` belongs to the node at its local end and talks to exactly
//! one peer. It coalesces outgoing messages into packets, numbers packets that
//! carry messages, keeps them until acknowledged and retransmits them on
//! timeout or when a later acknowledgement shows they were lost. On the
//! receive side it acknowledges every data packet, delivers messages as soon
//! as they arrive (the search layer tolerates reordering) and suppresses
//! redelivery of duplicates.
//!
//! The connection never schedules anything itself: callers pass the current
//! time, collect the packets it produces, and ask [`Connection::next_wake`]
//! when it next needs attention.

use std::collections::BTreeSet;

use rand::Rng;
use tracing::{trace, warn};

use crate::bandwidth::TokenBucket;
use crate::congestion::CongestionWindow;
use crate::error::ProtocolError;
use crate::message::{Message, Packet};
use crate::queue::{AckQueue, MessageQueue};
use crate::time::{Duration, Timestamp};
use crate::types::{
    Address, Location, ACK_DELAY_MS, ACK_SIZE, FRTO, LINK_IDLE, MAX_DELAY_MS, MAX_PACKET_SIZE,
    MAX_PAYLOAD, PACKET_HEADER_SIZE, RTO, RTT_DECAY, RX_REORDER_LIMIT, SENSIBLE_PAYLOAD, SEQ_RANGE,
};

/// Counters for one connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub packets_sent: u64,
    pub data_packets_sent: u64,
    pub bytes_sent: u64,
    pub retransmissions: u64,
    pub acks_received: u64,
    pub duplicates_received: u64,
    pub packets_dropped: u64,
    pub messages_delivered: u64,
}

/// A data packet awaiting acknowledgement.
#[derive(Debug, Clone)]
struct Unacked {
    seq: u32,
    /// Stored without acks; retransmissions carry only the data.
    packet: Packet,
    size: usize,
    sent: Timestamp,
    /// An ack for a resent packet cannot tell which copy it answers.
    retransmitted: bool,
}

#[derive(Debug)]
pub struct Connection {
    local: Address,
    remote: Address,
    location: Location,
    latency: Duration,

    // Sending
    cwnd: CongestionWindow,
    acks: AckQueue,
    searches: MessageQueue,
    transfers: MessageQueue,
    prefer_search: bool,
    tx_seq: u32,
    unacked: Vec<Unacked>,
    last_transmission: Timestamp,
    /// Smoothed round-trip time in milliseconds.
    rtt: f64,

    // Receiving
    rx_seq: u32,
    rx_seen: BTreeSet<u32>,

    // Load management (used only when the node enables the policy)
    backoff_until: Timestamp,
    backoff_length: Duration,
    tokens_out: u32,
    tokens_in: u32,

    stats: ConnectionStats,
}

impl Connection {
    /// `latency` is the one-way link latency; the RTT estimate starts at twice it.
    pub fn new(
        local: Address,
        remote: Address,
        location: Location,
        latency: Duration,
        now: Timestamp,
    ) -> Self {
        Self {
            local,
            remote,
            location,
            latency,
            cwnd: CongestionWindow::new(),
            acks: AckQueue::new(Duration::from_millis(ACK_DELAY_MS)),
            searches: MessageQueue::new(Duration::from_millis(MAX_DELAY_MS)),
            transfers: MessageQueue::new(Duration::from_millis(MAX_DELAY_MS)),
            prefer_search: true,
            tx_seq: 0,
            unacked: Vec::new(),
            last_transmission: now,
            // Seeded from the configured link latency so the first timeouts
            // fit the path. Acks refine it from there.
            rtt: latency.as_millis_f64() * 2.0,
            rx_seq: 0,
            rx_seen: BTreeSet::new(),
            backoff_until: Timestamp::ZERO,
            backoff_length: Duration::ZERO,
            tokens_out: 0,
            tokens_in: 0,
            stats: ConnectionStats::default(),
        }
    }

    /// Set the initial flow-control credit in both directions and the
    /// starting backoff length.
    pub fn with_load_limits(mut self, flow_tokens: u32, initial_backoff: Duration) -> Self {
        self.tokens_out = flow_tokens;
        self.tokens_in = flow_tokens;
        self.backoff_length = initial_backoff;
        self
    }

    pub fn remote(&self) -> Address {
        self.remote
    }

    pub fn location(&self) -> Location {
        self.location
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Smoothed round-trip estimate.
    pub fn rtt(&self) -> Duration {
        Duration::from_millis_f64(self.rtt)
    }

    pub fn rtt_millis(&self) -> f64 {
        self.rtt
    }

    pub fn cwnd(&self) -> &CongestionWindow {
        &self.cwnd
    }

    /// Next in-order sequence number expected from the peer.
    pub fn rx_seq(&self) -> u32 {
        self.rx_seq
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Nothing queued and nothing awaiting acknowledgement.
    pub fn is_quiet(&self) -> bool {
        self.queues_empty() && self.unacked.is_empty()
    }

    fn queues_empty(&self) -> bool {
        self.acks.is_empty() && self.searches.is_empty() && self.transfers.is_empty()
    }

    fn retransmission_timeout(&self) -> Duration {
        Duration::from_millis_f64(RTO * self.rtt + MAX_DELAY_MS as f64)
    }

    fn fast_retransmission_age(&self) -> Duration {
        Duration::from_millis_f64(FRTO * self.rtt + MAX_DELAY_MS as f64)
    }

    /// Sequence numbers at or above this are withheld until older packets are acked.
    fn tx_ceiling(&self) -> u32 {
        let lowest = self.unacked.first().map_or(self.tx_seq, |u| u.seq);
        lowest.saturating_add(SEQ_RANGE)
    }

    fn can_send_data(&self) -> bool {
        self.tx_seq < self.tx_ceiling()
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Queue a message and send whatever the coalescing policy allows.
    pub fn send_message(
        &mut self,
        message: Message,
        now: Timestamp,
        bandwidth: &mut TokenBucket,
        out: &mut Vec<Packet>,
    ) {
        debug_assert!(message.size() <= MAX_PAYLOAD, "message cannot fit a packet");
        if message.is_transfer() {
            self.transfers.push(message, now);
        } else {
            self.searches.push(message, now);
        }
        self.flush(now, bandwidth, out);
    }

    /// Send as many packets as the coalescing, window and bandwidth rules allow.
    pub fn flush(&mut self, now: Timestamp, bandwidth: &mut TokenBucket, out: &mut Vec<Packet>) {
        if self.queues_empty() {
            return;
        }
        let idle = now.saturating_sub(self.last_transmission).as_millis_f64();
        if idle > LINK_IDLE * self.rtt {
            trace!(local = %self.local, remote = %self.remote, "link idle, resetting window");
            self.cwnd.reset();
        }
        while let Some(packet) = self.next_packet(now, bandwidth) {
            out.push(packet);
        }
    }

    fn next_packet(&mut self, now: Timestamp, bandwidth: &mut TokenBucket) -> Option<Packet> {
        if self.queues_empty() {
            return None;
        }

        let budget = (MAX_PACKET_SIZE as i64)
            .min(self.cwnd.available())
            .min(bandwidth.available(now));
        let fits = |bytes: usize| ((PACKET_HEADER_SIZE + bytes) as i64) <= budget;
        let due = |deadline: Option<Timestamp>| deadline.is_some_and(|d| d <= now);
        let data_ok = self.can_send_data();

        let urgent_ack = due(self.acks.deadline());
        let search_due = data_ok
            && due(self.searches.deadline())
            && self.searches.head_size().is_some_and(fits);
        let transfer_due = data_ok
            && due(self.transfers.deadline())
            && self.transfers.head_size().is_some_and(fits);
        let queued = self.searches.bytes() + self.transfers.bytes();
        let bulk = data_ok && queued >= SENSIBLE_PAYLOAD && fits(SENSIBLE_PAYLOAD);

        if !(urgent_ack || search_due || transfer_due || bulk) {
            return None;
        }

        let acks = self.acks.drain(MAX_PAYLOAD / ACK_SIZE);
        let mut messages = Vec::new();
        if data_ok {
            let room = budget - (PACKET_HEADER_SIZE + acks.len() * ACK_SIZE) as i64;
            if room > 0 {
                let mut room = room as usize;
                let (first, second) = if self.prefer_search {
                    (&mut self.searches, &mut self.transfers)
                } else {
                    (&mut self.transfers, &mut self.searches)
                };
                for queue in [first, second] {
                    while let Some(message) = queue.pop_if_fits(room) {
                        room -= message.size();
                        messages.push(message);
                    }
                }
            }
        }
        if acks.is_empty() && messages.is_empty() {
            return None;
        }

        let seq = if messages.is_empty() {
            None
        } else {
            let seq = self.tx_seq;
            self.tx_seq += 1;
            self.prefer_search = !self.prefer_search;
            Some(seq)
        };
        let packet = Packet {
            src: self.local,
            dst: self.remote,
            seq,
            acks,
            messages,
        };
        let size = packet.size();
        bandwidth.remove(size, now);

        if let Some(seq) = seq {
            let data = Packet {
                acks: Vec::new(),
                ..packet.clone()
            };
            let data_size = data.size();
            self.cwnd.bytes_sent(data_size);
            self.unacked.push(Unacked {
                seq,
                packet: data,
                size: data_size,
                sent: now,
                retransmitted: false,
            });
            self.stats.data_packets_sent += 1;
        }
        self.last_transmission = now;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += size as u64;
        trace!(
            local = %self.local,
            remote = %self.remote,
            seq = ?packet.seq,
            acks = packet.acks.len(),
            messages = packet.messages.len(),
            size,
            "packet sent"
        );
        Some(packet)
    }

    fn retransmit(
        &mut self,
        index: usize,
        now: Timestamp,
        bandwidth: &mut TokenBucket,
        out: &mut Vec<Packet>,
    ) {
        let entry = &mut self.unacked[index];
        entry.sent = now;
        entry.retransmitted = true;
        bandwidth.remove(entry.size, now);
        out.push(entry.packet.clone());
        self.last_transmission = now;
        self.stats.retransmissions += 1;
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += entry.size as u64;
        trace!(local = %self.local, remote = %self.remote, seq = entry.seq, "retransmitted");
    }

    /// Retransmit packets older than the retransmission timeout, then flush.
    pub fn check_timeouts(
        &mut self,
        now: Timestamp,
        bandwidth: &mut TokenBucket,
        out: &mut Vec<Packet>,
    ) {
        let rto = self.retransmission_timeout();
        let mut lost = false;
        for index in 0..self.unacked.len() {
            if self.unacked[index].sent + rto <= now {
                self.retransmit(index, now, bandwidth, out);
                lost = true;
            }
        }
        if lost {
            self.cwnd.timeout();
        }
        self.flush(now, bandwidth, out);
    }

    /// Earliest time this connection needs attention, if it needs any.
    ///
    /// Covers coalescing deadlines, retransmission deadlines and, for a message
    /// that is due but waiting for bandwidth, the moment enough tokens accrue.
    /// Messages waiting for window space are woken by acks or retransmissions.
    pub fn next_wake(&self, now: Timestamp, bandwidth: &mut TokenBucket) -> Option<Timestamp> {
        let mut wake: Option<Timestamp> = None;
        let mut consider = |t: Timestamp| wake = Some(wake.map_or(t, |w| w.min(t)));

        if let Some(deadline) = self.acks.deadline() {
            consider(deadline.max(now));
        }
        for queue in [&self.searches, &self.transfers] {
            let (Some(deadline), Some(head)) = (queue.deadline(), queue.head_size()) else {
                continue;
            };
            if deadline > now {
                consider(deadline);
            } else if self.can_send_data()
                && self.cwnd.available() >= (PACKET_HEADER_SIZE + head) as i64
            {
                if let Some(wait) = bandwidth.time_until(PACKET_HEADER_SIZE + head, now) {
                    consider(now + wait.max(Duration::from_millis(1)));
                }
            }
        }
        let rto = self.retransmission_timeout();
        for entry in &self.unacked {
            consider(entry.sent + rto);
        }
        wake
    }

    // ---------------------------------------------------------------------
    // Receiving
    // ---------------------------------------------------------------------

    /// Process an incoming packet and return the messages to deliver upward.
    pub fn receive(
        &mut self,
        packet: Packet,
        now: Timestamp,
        bandwidth: &mut TokenBucket,
        out: &mut Vec<Packet>,
    ) -> Vec<Message> {
        if !packet.acks.is_empty() {
            self.handle_acks(&packet.acks, now, bandwidth, out);
        }
        let delivered = match packet.seq {
            Some(seq) => self.handle_data(seq, packet.messages, now),
            None => Vec::new(),
        };
        self.flush(now, bandwidth, out);
        delivered
    }

    fn handle_acks(
        &mut self,
        acks: &[u32],
        now: Timestamp,
        bandwidth: &mut TokenBucket,
        out: &mut Vec<Packet>,
    ) {
        for &ack in acks {
            self.stats.acks_received += 1;
            if let Some(pos) = self.unacked.iter().position(|u| u.seq == ack) {
                let acked = self.unacked.remove(pos);
                if !acked.retransmitted {
                    let sample = now.saturating_sub(acked.sent).as_millis_f64();
                    self.rtt = self.rtt * RTT_DECAY + sample * (1.0 - RTT_DECAY);
                }
                self.cwnd.bytes_acked(acked.size);
            }

            // Anything older than an acked packet that has been out for a
            // while was probably lost.
            let age = self.fast_retransmission_age();
            let mut lost = false;
            for index in 0..self.unacked.len() {
                let entry = &self.unacked[index];
                if entry.seq < ack && now.saturating_sub(entry.sent) > age {
                    self.retransmit(index, now, bandwidth, out);
                    lost = true;
                }
            }
            if lost {
                self.cwnd.fast_retransmission();
            }
        }
    }

    fn handle_data(&mut self, seq: u32, messages: Vec<Message>, now: Timestamp) -> Vec<Message> {
        if seq < self.rx_seq || self.rx_seen.contains(&seq) {
            trace!(local = %self.local, remote = %self.remote, seq, "duplicate packet");
            self.stats.duplicates_received += 1;
            self.acks.push(seq, now);
            return Vec::new();
        }

        let limit = self.rx_seq.saturating_add(SEQ_RANGE);
        if seq >= limit {
            let error = ProtocolError::SequenceOutOfRange {
                from: self.remote,
                seq,
                limit,
            };
            warn!(local = %self.local, %error, "dropping packet");
            self.stats.packets_dropped += 1;
            return Vec::new();
        }

        if seq == self.rx_seq {
            self.rx_seq += 1;
            while self.rx_seen.remove(&self.rx_seq) {
                self.rx_seq += 1;
            }
        } else {
            if self.rx_seen.len() >= RX_REORDER_LIMIT {
                let error = ProtocolError::ReassemblyOverflow {
                    from: self.remote,
                    seq,
                    buffered: self.rx_seen.len(),
                };
                warn!(local = %self.local, %error, "dropping packet");
                self.stats.packets_dropped += 1;
                return Vec::new();
            }
            self.rx_seen.insert(seq);
        }

        self.acks.push(seq, now);
        self.stats.messages_delivered += messages.len() as u64;
        messages
    }

    // ---------------------------------------------------------------------
    // Load management
    // ---------------------------------------------------------------------

    pub fn is_backed_off(&self, now: Timestamp) -> bool {
        now < self.backoff_until
    }

    /// Double the backoff length and back off for a random part of it.
    pub fn back_off<R: Rng>(&mut self, now: Timestamp, max: Duration, rng: &mut R) {
        self.backoff_length = (self.backoff_length.saturating_mul(2)).min(max);
        let span = self.backoff_length.as_millis().max(1);
        self.backoff_until = now + Duration::from_millis(rng.gen_range(0..span));
        trace!(
            local = %self.local,
            remote = %self.remote,
            until = %self.backoff_until,
            "backing off"
        );
    }

    pub fn reset_backoff(&mut self, initial: Duration) {
        self.backoff_length = initial;
    }

    pub fn backoff_length(&self) -> Duration {
        self.backoff_length
    }

    /// Credit left for sending searches to the peer.
    pub fn tokens_out(&self) -> u32 {
        self.tokens_out
    }

    pub fn spend_token(&mut self) {
        self.tokens_out = self.tokens_out.saturating_sub(1);
    }

    pub fn add_tokens(&mut self, count: u32) {
        self.tokens_out = self.tokens_out.saturating_add(count);
    }

    /// Charge an incoming search against the credit granted to the peer.
    /// Returns `false` if the peer has none left.
    pub fn accept_token(&mut self) -> bool {
        if self.tokens_in == 0 {
            return false;
        }
        self.tokens_in -= 1;
        true
    }

    /// Grant one credit back to the peer.
    pub fn grant_token(&mut self) {
        self.tokens_in = self.tokens_in.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SearchId, MIN_CWIND};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    const A: Address = Address(0);
    const B: Address = Address(1);

    fn pair(latency_ms: u64) -> (Connection, Connection) {
        let latency = Duration::from_millis(latency_ms);
        (
            Connection::new(A, B, Location::new(0.5), latency, Timestamp::ZERO),
            Connection::new(B, A, Location::new(0.1), latency, Timestamp::ZERO),
        )
    }

    fn big_message() -> Message {
        Message::SskDataFound {
            id: SearchId(1),
            value: 7,
            pub_key: true,
        }
    }

    fn ms(n: u64) -> Timestamp {
        Timestamp::from_millis(n)
    }

    fn ack_from_b(seq: u32) -> Packet {
        Packet {
            src: B,
            dst: A,
            seq: None,
            acks: vec![seq],
            messages: Vec::new(),
        }
    }

    #[test]
    fn test_large_message_sent_immediately_and_acked() {
        let (mut a, mut b) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        assert_eq!(out.len(), 1, "above the sensible payload, no coalescing delay");
        let packet = out.pop().unwrap();
        assert_eq!(packet.seq, Some(0));
        assert_eq!(a.unacked_count(), 1);
        assert!(a.cwnd().in_flight() <= MIN_CWIND as usize);

        // B receives one latency later; the ack waits for its short deadline.
        let delivered = b.receive(packet, ms(100), &mut bw, &mut out);
        assert_eq!(delivered, vec![big_message()]);
        assert!(out.is_empty());
        let wake = b.next_wake(ms(100), &mut bw).unwrap();
        assert_eq!(wake, ms(100 + ACK_DELAY_MS));

        b.flush(wake, &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        let ack = out.pop().unwrap();
        assert!(ack.is_ack_only());
        assert_eq!(ack.seq, None);
        assert_eq!(ack.acks, vec![0]);

        a.receive(ack, wake + Duration::from_millis(100), &mut bw, &mut out);
        assert!(out.is_empty());
        assert_eq!(a.unacked_count(), 0);
        assert_eq!(a.cwnd().in_flight(), 0);
        assert!((a.rtt_millis() - 201.0).abs() < 1e-6);
        assert!(a.is_quiet());
    }

    #[test]
    fn test_small_messages_coalesce_until_deadline() {
        let (mut a, _) = pair(50);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(Message::Accepted { id: SearchId(1) }, ms(0), &mut bw, &mut out);
        a.send_message(Message::Accepted { id: SearchId(2) }, ms(20), &mut bw, &mut out);
        assert!(out.is_empty());
        assert_eq!(a.next_wake(ms(20), &mut bw), Some(ms(MAX_DELAY_MS)));

        a.flush(ms(MAX_DELAY_MS), &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].messages.len(), 2, "both messages share one packet");
    }

    #[test]
    fn test_duplicate_is_acked_but_not_redelivered() {
        let (mut a, mut b) = pair(10);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        let packet = out.pop().unwrap();

        let first = b.receive(packet.clone(), ms(10), &mut bw, &mut out);
        assert_eq!(first.len(), 1);
        let again = b.receive(packet, ms(11), &mut bw, &mut out);
        assert!(again.is_empty());
        assert_eq!(b.stats().duplicates_received, 1);

        b.flush(ms(30), &mut bw, &mut out);
        let ack = out.pop().unwrap();
        assert_eq!(ack.acks, vec![0, 0]);
    }

    #[test]
    fn test_out_of_order_delivery_and_rx_seq() {
        let (mut a, mut b) = pair(10);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        assert_eq!(out.len(), 2);
        let second = out.pop().unwrap();
        let first = out.pop().unwrap();
        assert_eq!(second.seq, Some(1));

        assert_eq!(b.receive(second, ms(10), &mut bw, &mut out).len(), 1);
        assert_eq!(b.rx_seq(), 0);
        assert_eq!(b.receive(first, ms(11), &mut bw, &mut out).len(), 1);
        assert_eq!(b.rx_seq(), 2);
    }

    #[test]
    fn test_rx_seq_never_decreases() {
        let (_, mut b) = pair(10);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();
        let mut last = 0;
        for seq in [3u32, 0, 0, 2, 1, 5, 4, 1, 9, 6, 8, 7, 2] {
            let packet = Packet {
                src: A,
                dst: B,
                seq: Some(seq),
                acks: Vec::new(),
                messages: vec![Message::Token { count: 1 }],
            };
            b.receive(packet, ms(seq as u64), &mut bw, &mut out);
            assert!(b.rx_seq() >= last);
            last = b.rx_seq();
        }
        assert_eq!(b.rx_seq(), 10);
    }

    #[test]
    fn test_sequence_beyond_range_dropped() {
        let (_, mut b) = pair(10);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();
        let packet = Packet {
            src: A,
            dst: B,
            seq: Some(SEQ_RANGE + 5),
            acks: Vec::new(),
            messages: vec![Message::Token { count: 1 }],
        };
        assert!(b.receive(packet, ms(0), &mut bw, &mut out).is_empty());
        assert_eq!(b.stats().packets_dropped, 1);
        assert_eq!(b.next_wake(ms(0), &mut bw), None, "nothing to ack");
    }

    #[test]
    fn test_retransmission_timeout() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        out.clear();
        // RTO * 200ms + 100ms
        let deadline = a.next_wake(ms(0), &mut bw).unwrap();
        assert_eq!(deadline, ms(900));

        a.check_timeouts(ms(899), &mut bw, &mut out);
        assert!(out.is_empty());
        a.check_timeouts(deadline, &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].seq, Some(0));
        assert_eq!(a.stats().retransmissions, 1);
        assert!(!a.cwnd().in_slow_start(), "first timeout ends slow start");
    }

    #[test]
    fn test_fast_retransmission_on_later_ack() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        a.send_message(big_message(), ms(500), &mut bw, &mut out);
        assert_eq!(out.len(), 2);
        out.clear();

        a.receive(ack_from_b(1), ms(700), &mut bw, &mut out);
        assert_eq!(out.len(), 1, "seq 0 is older than FRTO * rtt");
        assert_eq!(out[0].seq, Some(0));
        assert!(!a.cwnd().in_slow_start());
    }

    #[test]
    fn test_idle_link_resets_window_grown_in_slow_start() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        for round in 0..20u64 {
            let t = round * 300;
            a.send_message(big_message(), ms(t), &mut bw, &mut out);
            let seq = out.pop().unwrap().seq.unwrap();
            a.receive(ack_from_b(seq), ms(t + 200), &mut bw, &mut out);
        }
        assert!(out.is_empty());
        assert!(a.cwnd().in_slow_start());
        assert!(a.cwnd().size() > 2.0 * MIN_CWIND, "window {}", a.cwnd().size());

        // Far longer than LINK_IDLE round trips since the last transmission.
        a.send_message(big_message(), ms(100_000), &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(a.cwnd().size(), MIN_CWIND);
        assert!(a.cwnd().in_slow_start());
    }

    #[test]
    fn test_short_pause_keeps_window() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        let seq = out.pop().unwrap().seq.unwrap();
        a.receive(ack_from_b(seq), ms(200), &mut bw, &mut out);
        let grown = a.cwnd().size();
        assert!(grown > MIN_CWIND);

        a.send_message(big_message(), ms(1000), &mut bw, &mut out);
        assert_eq!(a.cwnd().size(), grown);
    }

    #[test]
    fn test_ack_for_retransmitted_packet_leaves_rtt() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        a.check_timeouts(ms(900), &mut bw, &mut out);
        assert_eq!(a.stats().retransmissions, 1);

        // Could answer either copy, so no sample.
        a.receive(ack_from_b(0), ms(950), &mut bw, &mut out);
        assert_eq!(a.unacked_count(), 0);
        assert!((a.rtt_millis() - 200.0).abs() < 1e-9, "rtt {}", a.rtt_millis());

        a.send_message(big_message(), ms(1000), &mut bw, &mut out);
        a.receive(ack_from_b(1), ms(1300), &mut bw, &mut out);
        assert!((a.rtt_millis() - 210.0).abs() < 1e-9, "rtt {}", a.rtt_millis());
    }

    #[test]
    fn test_window_limits_in_flight_bytes() {
        let (mut a, _) = pair(100);
        let mut bw = TokenBucket::unlimited();
        let mut out = Vec::new();

        for _ in 0..5 {
            a.send_message(big_message(), ms(0), &mut bw, &mut out);
        }
        // 1372-byte packets in a 3000-byte window.
        assert_eq!(out.len(), 2);
        assert!(a.cwnd().in_flight() as f64 <= a.cwnd().size());
        assert_eq!(a.next_wake(ms(0), &mut bw), Some(ms(MAX_DELAY_MS)));
        // Once due, waiting for window space needs no timer beyond retransmission.
        assert_eq!(a.next_wake(ms(MAX_DELAY_MS), &mut bw), Some(ms(900)));
    }

    #[test]
    fn test_bandwidth_wait_schedules_wake() {
        let (mut a, _) = pair(10);
        let mut bw = TokenBucket::new(100, 1400, ms(0));
        let mut out = Vec::new();

        a.send_message(big_message(), ms(0), &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        a.send_message(Message::Accepted { id: SearchId(9) }, ms(0), &mut bw, &mut out);
        assert_eq!(out.len(), 1);

        // Deadline passes while the bucket is still short of 92 bytes.
        let wake = a.next_wake(ms(MAX_DELAY_MS), &mut bw).unwrap();
        assert!(wake > ms(MAX_DELAY_MS));
        a.flush(ms(200), &mut bw, &mut out);
        assert_eq!(out.len(), 1);
        // 54 missing bytes at 100 B/s
        a.flush(ms(650), &mut bw, &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_backoff_doubles_and_resets() {
        let mut a = Connection::new(A, B, Location::new(0.5), Duration::from_millis(10), ms(0))
            .with_load_limits(2, Duration::from_secs(1));
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        a.back_off(ms(0), Duration::from_secs(3), &mut rng);
        assert_eq!(a.backoff_length(), Duration::from_secs(2));
        a.back_off(ms(0), Duration::from_secs(3), &mut rng);
        assert_eq!(a.backoff_length(), Duration::from_secs(3));
        assert!(!a.is_backed_off(ms(3000)));

        a.reset_backoff(Duration::from_secs(1));
        assert_eq!(a.backoff_length(), Duration::from_secs(1));
    }

    #[test]
    fn test_flow_tokens() {
        let mut a = Connection::new(A, B, Location::new(0.5), Duration::from_millis(10), ms(0))
            .with_load_limits(1, Duration::from_secs(1));
        assert_eq!(a.tokens_out(), 1);
        a.spend_token();
        assert_eq!(a.tokens_out(), 0);
        a.add_tokens(1);
        assert_eq!(a.tokens_out(), 1);

        assert!(a.accept_token());
        assert!(!a.accept_token());
        a.grant_token();
        assert!(a.accept_token());
    }
}
