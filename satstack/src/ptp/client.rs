//! PTP port state machine
//!
//! One [Client] is one PTP port. The caller owns the transport and the
//! timers: received frames are pushed in together with their hardware
//! receive timestamps, transmit timestamps come back through
//! [Client::handle_send_timestamp], and every method returns the list of
//! frames to put on the wire. Role selection (the BMCA decision or a
//! static assignment) is commanded through [Client::set_role].
//!
//! In the slave role the port runs the two-step exchange: Sync records
//! t2, Follow-Up supplies t1, a Delay-Req goes out (t3 from its transmit
//! timestamp), and Delay-Resp closes the exchange with t4. A Delay-Resp
//! whose exchange never saw the Sync pair is discarded.

use arrayvec::ArrayVec;
use rand::Rng;

use super::measurement::{Measurement, MeasurementCache};
use super::messages::{
    AnnounceMessage, DelayReqMessage, DelayRespMessage, FollowUpMessage, Header, Message,
    MessageBody, PortIdentity, SyncMessage,
};
use crate::time::{Time, ONE_SECOND};

/// Largest frame the client will compose.
pub const MAX_MSG_LEN: usize = 128;

/// Port role, commanded externally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Disabled,
    Listening,
    Master,
    Slave,
    Passive,
}

/// Ties a transmit timestamp back to the message it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampContext {
    kind: TsKind,
    seq: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TsKind {
    Sync,
    DelayReq,
}

/// One frame for the caller to transmit.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientAction<'a> {
    /// Send on the event path and report the hardware transmit timestamp
    /// via [Client::handle_send_timestamp].
    SendEvent {
        context: TimestampContext,
        data: &'a [u8],
    },
    /// Send on the general path; no timestamp needed.
    SendGeneral { data: &'a [u8] },
}

pub type ActionList<'a> = ArrayVec<ClientAction<'a>, 2>;

/// Static port configuration.
#[derive(Debug, Clone, Copy)]
pub struct ClientConfig {
    pub domain: u8,
    pub sync_interval: Time,
    pub announce_interval: Time,
    pub priority1: u8,
    pub priority2: u8,
    pub clock_quality: u32,
    pub current_utc_offset: i16,
    pub time_source: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            domain: 0,
            sync_interval: ONE_SECOND,
            announce_interval: ONE_SECOND * 2,
            priority1: 128,
            priority2: 128,
            clock_quality: 0xF8FE_FFFF,
            current_utc_offset: 37,
            time_source: 0xA0, // internal oscillator
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub rx_count: u32,
    pub measurement_count: u32,
    /// Frames ignored because of the current role or a foreign sender.
    pub ignored: u32,
    /// Out-of-sequence or unmatched exchange messages.
    pub out_of_sequence: u32,
    pub malformed: u32,
}

/// One PTP port.
pub struct Client {
    role: Role,
    cfg: ClientConfig,
    port_identity: PortIdentity,
    remote_master: Option<PortIdentity>,
    sync_pairs: MeasurementCache,
    exchanges: MeasurementCache,
    measurements: ArrayVec<Measurement, 8>,
    delay_seq: u16,
    sync_seq: u16,
    announce_seq: u16,
    last_announce: Option<(PortIdentity, AnnounceMessage)>,
    stats: ClientStats,
}

impl Client {
    /// The random generator seeds the delay-request sequence ids, so two
    /// restarts do not replay the same exchange numbers.
    pub fn new(port_identity: PortIdentity, cfg: ClientConfig, rng: &mut impl Rng) -> Self {
        Client {
            role: Role::Disabled,
            cfg,
            port_identity,
            remote_master: None,
            sync_pairs: MeasurementCache::new(),
            exchanges: MeasurementCache::new(),
            measurements: ArrayVec::new(),
            delay_seq: rng.gen(),
            sync_seq: 0,
            announce_seq: 0,
            last_announce: None,
            stats: ClientStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    pub fn port_identity(&self) -> PortIdentity {
        self.port_identity
    }

    pub fn sync_interval(&self) -> Time {
        self.cfg.sync_interval
    }

    pub fn announce_interval(&self) -> Time {
        self.cfg.announce_interval
    }

    /// The most recent Announce heard, for the external BMCA.
    pub fn last_announce(&self) -> Option<(PortIdentity, AnnounceMessage)> {
        self.last_announce
    }

    /// Command a role change. Moving out of the slave role abandons all
    /// in-flight exchanges.
    pub fn set_role(&mut self, role: Role, remote_master: Option<PortIdentity>) {
        self.role = role;
        self.remote_master = remote_master;
        self.sync_pairs.clear();
        self.exchanges.clear();
    }

    /// Next completed measurement, if any.
    pub fn poll_measurement(&mut self) -> Option<Measurement> {
        if self.measurements.is_empty() {
            None
        } else {
            Some(self.measurements.remove(0))
        }
    }

    /// An event-path frame arrived with its hardware timestamp.
    pub fn handle_event_frame<'a>(
        &mut self,
        data: &[u8],
        rx_time: Time,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        let Ok(msg) = Message::deserialize(data) else {
            self.stats.malformed = self.stats.malformed.wrapping_add(1);
            return ActionList::new();
        };
        if msg.header.domain() != self.cfg.domain {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return ActionList::new();
        }
        self.stats.rx_count = self.stats.rx_count.wrapping_add(1);

        match (self.role, msg.body) {
            (Role::Slave, MessageBody::Sync(sync)) => self.handle_sync(&msg.header, sync, rx_time, buf),
            (Role::Master, MessageBody::DelayReq(_)) => {
                self.answer_delay_req(&msg.header, rx_time, buf)
            }
            _ => {
                self.stats.ignored = self.stats.ignored.wrapping_add(1);
                ActionList::new()
            }
        }
    }

    /// A general-path frame arrived.
    pub fn handle_general_frame<'a>(&mut self, data: &[u8], buf: &'a mut [u8]) -> ActionList<'a> {
        let Ok(msg) = Message::deserialize(data) else {
            self.stats.malformed = self.stats.malformed.wrapping_add(1);
            return ActionList::new();
        };
        if msg.header.domain() != self.cfg.domain {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return ActionList::new();
        }
        self.stats.rx_count = self.stats.rx_count.wrapping_add(1);

        match (self.role, msg.body) {
            (Role::Slave, MessageBody::FollowUp(fu)) => self.handle_follow_up(&msg.header, fu, buf),
            (Role::Slave, MessageBody::DelayResp(resp)) => {
                self.handle_delay_resp(&msg.header, resp);
                ActionList::new()
            }
            (_, MessageBody::Announce(ann)) if self.role != Role::Disabled => {
                self.last_announce = Some((msg.header.source_port_identity(), ann));
                ActionList::new()
            }
            _ => {
                self.stats.ignored = self.stats.ignored.wrapping_add(1);
                ActionList::new()
            }
        }
    }

    /// The hardware reported the transmit timestamp for an event frame.
    pub fn handle_send_timestamp<'a>(
        &mut self,
        context: TimestampContext,
        tx_time: Time,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        match context.kind {
            TsKind::DelayReq => {
                match self.exchanges.get_mut(context.seq) {
                    Some(b) if b.t3.is_none() => b.t3 = Some(tx_time),
                    _ => {
                        log::warn!("Stray delay-request timestamp (seq {})", context.seq);
                        self.stats.out_of_sequence = self.stats.out_of_sequence.wrapping_add(1);
                        return ActionList::new();
                    }
                }
                self.try_finish(context.seq);
                ActionList::new()
            }
            TsKind::Sync => {
                // Two-step master: publish the precise origin time.
                if self.role != Role::Master {
                    return ActionList::new();
                }
                let msg = Message {
                    header: Header {
                        domain: self.cfg.domain,
                        sequence_id: context.seq,
                        source_port_identity: self.port_identity,
                        correction: super::messages::residual_correction(tx_time),
                        ..Header::default()
                    },
                    body: MessageBody::FollowUp(FollowUpMessage {
                        precise_origin_timestamp: tx_time,
                    }),
                    suffix: &[],
                };
                self.send_general(msg, buf)
            }
        }
    }

    /// Master only: emit the next Sync. Call from the sync timer.
    pub fn timer_sync<'a>(&mut self, buf: &'a mut [u8]) -> ActionList<'a> {
        if self.role != Role::Master {
            return ActionList::new();
        }
        self.sync_seq = self.sync_seq.wrapping_add(1);
        let seq = self.sync_seq;
        let msg = Message {
            header: Header {
                domain: self.cfg.domain,
                two_step: true,
                sequence_id: seq,
                source_port_identity: self.port_identity,
                ..Header::default()
            },
            body: MessageBody::Sync(SyncMessage {
                origin_timestamp: Time::ZERO,
            }),
            suffix: &[],
        };
        self.send_event(msg, TimestampContext { kind: TsKind::Sync, seq }, buf)
    }

    /// Master only: emit the next Announce. Call from the announce timer.
    pub fn timer_announce<'a>(&mut self, buf: &'a mut [u8]) -> ActionList<'a> {
        if self.role != Role::Master {
            return ActionList::new();
        }
        self.announce_seq = self.announce_seq.wrapping_add(1);
        let msg = Message {
            header: Header {
                domain: self.cfg.domain,
                sequence_id: self.announce_seq,
                source_port_identity: self.port_identity,
                ..Header::default()
            },
            body: MessageBody::Announce(AnnounceMessage {
                origin_timestamp: Time::ZERO,
                current_utc_offset: self.cfg.current_utc_offset,
                grandmaster_priority_1: self.cfg.priority1,
                grandmaster_clock_quality: self.cfg.clock_quality,
                grandmaster_priority_2: self.cfg.priority2,
                grandmaster_identity: self.port_identity.clock_identity,
                steps_removed: 0,
                time_source: self.cfg.time_source,
            }),
            suffix: &[],
        };
        self.send_general(msg, buf)
    }

    fn from_master(&self, header: &Header) -> bool {
        match self.remote_master {
            Some(master) => header.source_port_identity() == master,
            None => true,
        }
    }

    fn handle_sync<'a>(
        &mut self,
        header: &Header,
        sync: SyncMessage,
        rx_time: Time,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        if !self.from_master(header) {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return ActionList::new();
        }
        log::debug!("Sync seq {}", header.sequence_id());
        // Subtracting the correction from the receive time is equivalent
        // to adding it to the send time.
        let corrected_rx = rx_time - header.correction();
        let seq = header.sequence_id();
        let peer = header.source_port_identity();

        if self.sync_pairs.get_mut(seq).is_none() {
            self.sync_pairs.insert(seq, peer);
        }
        let pair = self.sync_pairs.get_mut(seq).unwrap();
        if pair.t2.is_some() {
            log::warn!("Duplicate Sync (seq {seq})");
            return ActionList::new();
        }
        pair.t2 = Some(corrected_rx);
        if !header.two_step() {
            pair.t1 = Some(sync.origin_timestamp);
        }
        self.try_start_delay(seq, buf)
    }

    fn handle_follow_up<'a>(
        &mut self,
        header: &Header,
        fu: FollowUpMessage,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        if !self.from_master(header) {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return ActionList::new();
        }
        log::debug!("FollowUp seq {}", header.sequence_id());
        let t1 = fu.precise_origin_timestamp + header.correction();
        let seq = header.sequence_id();
        let peer = header.source_port_identity();

        if self.sync_pairs.get_mut(seq).is_none() {
            // Follow-Up overtook its Sync in the network; keep it.
            self.sync_pairs.insert(seq, peer);
        }
        let pair = self.sync_pairs.get_mut(seq).unwrap();
        if pair.t1.is_some() {
            log::warn!("Duplicate FollowUp (seq {seq})");
            return ActionList::new();
        }
        pair.t1 = Some(t1);
        self.try_start_delay(seq, buf)
    }

    /// When a sync pair is complete, open the delay exchange.
    fn try_start_delay<'a>(&mut self, sync_seq: u16, buf: &'a mut [u8]) -> ActionList<'a> {
        let Some(pair) = self.sync_pairs.get_mut(sync_seq) else {
            return ActionList::new();
        };
        let (Some(t1), Some(t2)) = (pair.t1, pair.t2) else {
            return ActionList::new();
        };
        let peer = pair.peer;
        self.sync_pairs.discard(sync_seq);

        self.delay_seq = self.delay_seq.wrapping_add(1);
        let seq = self.delay_seq;
        let exch = self.exchanges.insert(seq, peer);
        exch.t1 = Some(t1);
        exch.t2 = Some(t2);

        let msg = Message {
            header: Header {
                domain: self.cfg.domain,
                sequence_id: seq,
                source_port_identity: self.port_identity,
                ..Header::default()
            },
            body: MessageBody::DelayReq(DelayReqMessage {
                origin_timestamp: Time::ZERO,
            }),
            suffix: &[],
        };
        self.send_event(msg, TimestampContext { kind: TsKind::DelayReq, seq }, buf)
    }

    fn handle_delay_resp(&mut self, header: &Header, resp: DelayRespMessage) {
        if resp.requesting_port_identity != self.port_identity {
            self.stats.ignored = self.stats.ignored.wrapping_add(1);
            return;
        }
        let seq = header.sequence_id();
        let t4 = resp.receive_timestamp - header.correction();
        match self.exchanges.get_mut(seq) {
            Some(b) if b.t4.is_none() => b.t4 = Some(t4),
            _ => {
                log::warn!("Unmatched DelayResp (seq {seq})");
                self.stats.out_of_sequence = self.stats.out_of_sequence.wrapping_add(1);
                return;
            }
        }
        self.try_finish(seq);
    }

    fn try_finish(&mut self, seq: u16) {
        if let Some(m) = self.exchanges.take_complete(seq) {
            log::debug!(
                "Measurement seq {}: offset {}, delay {}",
                seq,
                m.offset_from_master(),
                m.mean_path_delay()
            );
            self.stats.measurement_count = self.stats.measurement_count.wrapping_add(1);
            if self.measurements.is_full() {
                self.measurements.remove(0);
            }
            self.measurements.push(m);
        }
    }

    fn answer_delay_req<'a>(
        &mut self,
        header: &Header,
        rx_time: Time,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        log::debug!("DelayReq from {:?}", header.source_port_identity());
        let msg = Message {
            header: Header {
                domain: self.cfg.domain,
                sequence_id: header.sequence_id(),
                source_port_identity: self.port_identity,
                // The receiver computes t4 = receiveTimestamp - correction,
                // so the sub-ns residual rides along negated.
                correction: -super::messages::residual_correction(rx_time),
                ..Header::default()
            },
            body: MessageBody::DelayResp(DelayRespMessage {
                receive_timestamp: rx_time,
                requesting_port_identity: header.source_port_identity(),
            }),
            suffix: &[],
        };
        self.send_general(msg, buf)
    }

    fn send_event<'a>(
        &mut self,
        msg: Message<'_>,
        context: TimestampContext,
        buf: &'a mut [u8],
    ) -> ActionList<'a> {
        let mut actions = ActionList::new();
        match msg.serialize(buf) {
            Ok(len) => actions.push(ClientAction::SendEvent {
                context,
                data: &buf[..len],
            }),
            Err(e) => log::error!("Could not serialize event message: {e:?}"),
        }
        actions
    }

    fn send_general<'a>(&mut self, msg: Message<'_>, buf: &'a mut [u8]) -> ActionList<'a> {
        let mut actions = ActionList::new();
        match msg.serialize(buf) {
            Ok(len) => actions.push(ClientAction::SendGeneral { data: &buf[..len] }),
            Err(e) => log::error!("Could not serialize general message: {e:?}"),
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ptp::messages::ClockIdentity;
    use rand::rngs::mock::StepRng;

    fn master_identity() -> PortIdentity {
        PortIdentity {
            clock_identity: ClockIdentity([0xA0; 8]),
            port_number: 1,
        }
    }

    fn slave() -> Client {
        let mut rng = StepRng::new(100, 1);
        let mut c = Client::new(
            PortIdentity {
                clock_identity: ClockIdentity([0x51; 8]),
                port_number: 1,
            },
            ClientConfig::default(),
            &mut rng,
        );
        c.set_role(Role::Slave, Some(master_identity()));
        c
    }

    fn serialize(msg: &Message) -> alloc::vec::Vec<u8> {
        let mut buf = [0u8; MAX_MSG_LEN];
        let n = msg.serialize(&mut buf).unwrap();
        buf[..n].to_vec()
    }

    fn sync_msg(seq: u16, two_step: bool, correction: Time, origin: Time) -> alloc::vec::Vec<u8> {
        serialize(&Message {
            header: Header {
                two_step,
                sequence_id: seq,
                correction,
                source_port_identity: master_identity(),
                ..Header::default()
            },
            body: MessageBody::Sync(SyncMessage { origin_timestamp: origin }),
            suffix: &[],
        })
    }

    fn follow_up(seq: u16, correction: Time, precise: Time) -> alloc::vec::Vec<u8> {
        serialize(&Message {
            header: Header {
                sequence_id: seq,
                correction,
                source_port_identity: master_identity(),
                ..Header::default()
            },
            body: MessageBody::FollowUp(FollowUpMessage { precise_origin_timestamp: precise }),
            suffix: &[],
        })
    }

    fn delay_resp(seq: u16, requesting: PortIdentity, receive: Time) -> alloc::vec::Vec<u8> {
        serialize(&Message {
            header: Header {
                sequence_id: seq,
                source_port_identity: master_identity(),
                ..Header::default()
            },
            body: MessageBody::DelayResp(DelayRespMessage {
                receive_timestamp: receive,
                requesting_port_identity: requesting,
            }),
            suffix: &[],
        })
    }

    /// Drive a complete two-step exchange; returns the measurement.
    #[test]
    fn two_step_exchange() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];

        // Sync, two-step, correction of 1 us on the path.
        let actions = c.handle_event_frame(
            &sync_msg(15, true, Time::from_micros(1), Time::ZERO),
            Time::from_micros(1050),
            &mut buf,
        );
        assert!(actions.is_empty());
        drop(actions);

        // FollowUp carries t1.
        let actions = c.handle_general_frame(
            &follow_up(15, Time::from_micros(2), Time::from_micros(1000)),
            &mut buf,
        );
        // The pair is complete: a DelayReq goes out on the event path.
        assert_eq!(actions.len(), 1);
        let ClientAction::SendEvent { context, data } = &actions[0] else {
            panic!("expected event send");
        };
        let req = Message::deserialize(data).unwrap();
        assert!(matches!(req.body, MessageBody::DelayReq(_)));
        let req_seq = req.header.sequence_id();
        let ctx = *context;
        drop(actions);

        // Transmit timestamp for the DelayReq.
        let actions = c.handle_send_timestamp(ctx, Time::from_micros(2000), &mut buf);
        assert!(actions.is_empty());
        drop(actions);
        assert!(c.poll_measurement().is_none());

        // DelayResp closes the exchange.
        let actions = c.handle_general_frame(
            &delay_resp(req_seq, c.port_identity(), Time::from_micros(2080)),
            &mut buf,
        );
        assert!(actions.is_empty());

        let m = c.poll_measurement().unwrap();
        // t1 = 1000us + 2us correction; t2 = 1050us - 1us correction.
        assert_eq!(m.t1, Time::from_micros(1002));
        assert_eq!(m.t2, Time::from_micros(1049));
        assert_eq!(m.t3, Time::from_micros(2000));
        assert_eq!(m.t4, Time::from_micros(2080));
        assert_eq!(m.mean_path_delay(), Time::from_subns((47 + 80) * crate::time::SUBNS_PER_USEC / 2));
        assert_eq!(c.stats().measurement_count, 1);
    }

    #[test]
    fn one_step_sync_starts_delay_immediately() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let actions = c.handle_event_frame(
            &sync_msg(7, false, Time::ZERO, Time::from_micros(500)),
            Time::from_micros(520),
            &mut buf,
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(actions[0], ClientAction::SendEvent { .. }));
    }

    #[test]
    fn follow_up_before_sync() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let actions = c.handle_general_frame(
            &follow_up(21, Time::ZERO, Time::from_micros(10)),
            &mut buf,
        );
        assert!(actions.is_empty());
        drop(actions);
        let actions = c.handle_event_frame(
            &sync_msg(21, true, Time::ZERO, Time::ZERO),
            Time::from_micros(60),
            &mut buf,
        );
        // Pair completed in the other order: DelayReq goes out now.
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn delay_resp_without_sync_discarded() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let actions = c.handle_general_frame(
            &delay_resp(999, c.port_identity(), Time::from_micros(1)),
            &mut buf,
        );
        assert!(actions.is_empty());
        assert!(c.poll_measurement().is_none());
        assert_eq!(c.stats().out_of_sequence, 1);
    }

    #[test]
    fn delay_resp_for_other_port_ignored() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        c.handle_event_frame(
            &sync_msg(1, false, Time::ZERO, Time::ZERO),
            Time::from_micros(5),
            &mut buf,
        );
        let other = PortIdentity {
            clock_identity: ClockIdentity([0x77; 8]),
            port_number: 9,
        };
        let resp = delay_resp(c.delay_seq, other, Time::from_micros(9));
        let actions = c.handle_general_frame(&resp, &mut buf);
        assert!(actions.is_empty());
        assert!(c.poll_measurement().is_none());
    }

    #[test]
    fn foreign_master_ignored() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let foreign = Message {
            header: Header {
                sequence_id: 3,
                source_port_identity: PortIdentity {
                    clock_identity: ClockIdentity([0x66; 8]),
                    port_number: 4,
                },
                ..Header::default()
            },
            body: MessageBody::Sync(SyncMessage { origin_timestamp: Time::ZERO }),
            suffix: &[],
        };
        let actions = c.handle_event_frame(&serialize(&foreign), Time::ZERO, &mut buf);
        assert!(actions.is_empty());
        assert!(c.stats().ignored > 0);
    }

    #[test]
    fn wrong_domain_ignored() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let mut frame = sync_msg(2, false, Time::ZERO, Time::ZERO);
        frame[4] = 9; // domain
        let actions = c.handle_event_frame(&frame, Time::ZERO, &mut buf);
        assert!(actions.is_empty());
        assert_eq!(c.stats().rx_count, 0);
    }

    #[test]
    fn master_answers_delay_req() {
        let mut rng = StepRng::new(0, 1);
        let mut master = Client::new(master_identity(), ClientConfig::default(), &mut rng);
        master.set_role(Role::Master, None);
        let mut buf = [0u8; MAX_MSG_LEN];

        let requester = PortIdentity {
            clock_identity: ClockIdentity([0x51; 8]),
            port_number: 1,
        };
        let req = Message {
            header: Header {
                sequence_id: 42,
                source_port_identity: requester,
                ..Header::default()
            },
            body: MessageBody::DelayReq(DelayReqMessage { origin_timestamp: Time::ZERO }),
            suffix: &[],
        };
        let rx = Time::from_fields(10, 500, 123);
        let actions = master.handle_event_frame(&serialize(&req), rx, &mut buf);
        assert_eq!(actions.len(), 1);
        let ClientAction::SendGeneral { data } = &actions[0] else {
            panic!("expected general send");
        };
        let resp = Message::deserialize(data).unwrap();
        let MessageBody::DelayResp(body) = resp.body else {
            panic!("expected DelayResp");
        };
        assert_eq!(resp.header.sequence_id(), 42);
        assert_eq!(body.requesting_port_identity, requester);
        // Timestamp fields round to the nanosecond; the residual rides in
        // the (negated) correction field so that t4 = ts - correction.
        assert_eq!(body.receive_timestamp - resp.header.correction(), rx);
    }

    #[test]
    fn master_two_step_sync_flow() {
        let mut rng = StepRng::new(0, 1);
        let mut master = Client::new(master_identity(), ClientConfig::default(), &mut rng);
        master.set_role(Role::Master, None);
        let mut buf = [0u8; MAX_MSG_LEN];

        let actions = master.timer_sync(&mut buf);
        assert_eq!(actions.len(), 1);
        let ClientAction::SendEvent { context, data } = &actions[0] else {
            panic!("expected event send");
        };
        let sync = Message::deserialize(data).unwrap();
        assert!(sync.header.two_step());
        let seq = sync.header.sequence_id();
        let ctx = *context;
        drop(actions);

        let mut buf2 = [0u8; MAX_MSG_LEN];
        let actions = master.handle_send_timestamp(ctx, Time::from_micros(777), &mut buf2);
        assert_eq!(actions.len(), 1);
        let ClientAction::SendGeneral { data } = &actions[0] else {
            panic!("expected follow-up");
        };
        let fu = Message::deserialize(data).unwrap();
        assert_eq!(fu.header.sequence_id(), seq);
        let MessageBody::FollowUp(body) = fu.body else {
            panic!("expected FollowUp body");
        };
        assert_eq!(body.precise_origin_timestamp, Time::from_micros(777));
    }

    #[test]
    fn disabled_ignores_everything() {
        let mut rng = StepRng::new(0, 1);
        let mut c = Client::new(PortIdentity::default(), ClientConfig::default(), &mut rng);
        let mut buf = [0u8; MAX_MSG_LEN];
        let actions = c.handle_event_frame(
            &sync_msg(1, false, Time::ZERO, Time::ZERO),
            Time::ZERO,
            &mut buf,
        );
        assert!(actions.is_empty());
        drop(actions);
        let actions = c.timer_sync(&mut buf);
        assert!(actions.is_empty());
    }

    #[test]
    fn announce_recorded_for_bmca() {
        let mut c = slave();
        let mut buf = [0u8; MAX_MSG_LEN];
        let ann = Message {
            header: Header {
                sequence_id: 5,
                source_port_identity: master_identity(),
                ..Header::default()
            },
            body: MessageBody::Announce(AnnounceMessage {
                origin_timestamp: Time::ZERO,
                current_utc_offset: 37,
                grandmaster_priority_1: 10,
                grandmaster_clock_quality: 0,
                grandmaster_priority_2: 10,
                grandmaster_identity: ClockIdentity([1; 8]),
                steps_removed: 0,
                time_source: 0x20,
            }),
            suffix: &[],
        };
        c.handle_general_frame(&serialize(&ann), &mut buf);
        let (from, msg) = c.last_announce().unwrap();
        assert_eq!(from, master_identity());
        assert_eq!(msg.grandmaster_priority_1, 10);
    }
}
