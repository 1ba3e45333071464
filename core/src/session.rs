//! Link session: the per-connection protocol engine
//!
//! The session is sans-IO. The platform feeds it notifications, write acknowledgements,
//! clock readings and disconnects, and pulls [`LinkRequest`]s out of it:
//!
//! ```text
//! platform --notify--> on_notification --> Reassembler --> Handshake / CryptoSession --> LinkEvent
//! platform <--poll_request-- OutboundWriter <-- handshake actions / control commands
//! ```
//!
//! Fatal errors tear everything down (buffers, crypto session, pending command) and
//! queue a [`LinkRequest::Disconnect`] before they are returned.

use crate::config::SessionConfig;
use crate::control::{ControlChannel, ControlCommand, PendingControl, ReplyOutcome};
use crate::crypto::{CryptoProvider, CryptoSession, PacketType};
use crate::security::{Handshake, HandshakeAction, HandshakeState};
use crate::telemetry::{decode_packet, TelemetryRecord};
use crate::transport::{
    Characteristic, CompletePayload, GattLink, LinkRequest, OutboundWriter, Reassembler,
    WriterError,
};
use crate::LinkError;
use rand::RngCore;
use tracing::{debug, error, info, warn};
use web_time::Instant;

/// What the engine reports back to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The handshake completed and the session keys are in place
    Authenticated,
    /// A decrypted, decoded inbound packet
    Telemetry {
        packet_type: PacketType,
        sequence: u16,
        record: TelemetryRecord,
    },
    /// The sensor answered the outstanding control command
    ControlCompleted {
        command: ControlCommand,
        enqueued_id: u16,
        status: [u8; 4],
    },
    /// Input nothing accounted for; dropped without affecting state
    Discarded {
        characteristic: Characteristic,
        reason: &'static str,
    },
}

pub struct LinkSession<P: CryptoProvider> {
    config: SessionConfig,
    provider: P,
    reassembler: Reassembler,
    writer: OutboundWriter,
    handshake: Handshake,
    crypto: Option<CryptoSession>,
    control: ControlChannel,
    deadline: Option<Instant>,
}

impl<P: CryptoProvider> LinkSession<P> {
    pub fn new(config: SessionConfig, provider: P) -> Result<Self, LinkError> {
        config.validate()?;
        let handshake = Handshake::new(config.security_version, config.ble_pin)?;
        Ok(Self {
            writer: OutboundWriter::new(config.write_queue_capacity),
            config,
            provider,
            reassembler: Reassembler::new(),
            handshake,
            crypto: None,
            control: ControlChannel::new(),
            deadline: None,
        })
    }

    /// Replace the random source used during the challenge
    pub fn with_rng<R: RngCore + Send + 'static>(mut self, rng: R) -> Self {
        self.handshake = self.handshake.with_rng(rng);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn is_authenticated(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn crypto_session(&self) -> Option<&CryptoSession> {
        self.crypto.as_ref()
    }

    pub fn reassembler(&self) -> &Reassembler {
        &self.reassembler
    }

    pub fn writer(&self) -> &OutboundWriter {
        &self.writer
    }

    pub fn pending_control(&self) -> Option<&PendingControl> {
        self.control.pending()
    }

    /// When the engine gives up waiting, if it is waiting
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Start full pairing with a freshly activated sensor
    pub fn pair(&mut self, now: Instant) -> Result<(), LinkError> {
        let actions = self.handshake.start_pairing()?;
        self.start(actions, now)
    }

    /// Re-establish the session with an already paired sensor
    pub fn reconnect(&mut self, now: Instant) -> Result<(), LinkError> {
        let actions = self.handshake.start_reconnect()?;
        self.start(actions, now)
    }

    /// Queue the opening handshake writes; a partial opening is abandoned
    fn start(&mut self, actions: Vec<HandshakeAction>, now: Instant) -> Result<(), LinkError> {
        let mut events = Vec::new();
        if let Err(e) = self.apply(actions, &mut events) {
            let err = self.fail(e);
            if !err.is_fatal() {
                self.teardown();
                self.writer.clear();
            }
            return Err(err);
        }
        self.refresh_deadline(now);
        Ok(())
    }

    /// Feed one raw notification
    pub fn on_notification(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
        now: Instant,
    ) -> Result<Vec<LinkEvent>, LinkError> {
        let mut events = Vec::new();
        let result = self.handle_notification(characteristic, data, &mut events);
        if let Err(e) = result {
            return Err(self.fail(e));
        }
        self.refresh_deadline(now);
        Ok(events)
    }

    /// The platform acknowledged the write in flight
    pub fn on_write_complete(&mut self) -> Result<(), LinkError> {
        match self.writer.complete_write() {
            Ok(write) => {
                debug!(
                    "{}: write acknowledged ({} bytes)",
                    write.characteristic,
                    write.data.len()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Write completion with nothing in flight");
                Err(e.into())
            }
        }
    }

    /// Next request for the platform, if one may be issued now
    pub fn poll_request(&mut self) -> Option<LinkRequest> {
        let request = self.writer.poll_request()?;
        match &request {
            LinkRequest::Write(write) => debug!(
                "{}: write {}",
                write.characteristic,
                hex::encode(&write.data)
            ),
            LinkRequest::EnableNotifications(c) => debug!("{}: enable notifications", c),
            LinkRequest::Disconnect => debug!("Requesting disconnect"),
        }
        Some(request)
    }

    /// Issue every request that may be issued now through `link`
    ///
    /// Stops at the first write, which has to be acknowledged before the next one.
    /// A request the platform refuses goes back to the head of the queue.
    pub fn drive<L: GattLink + ?Sized>(&mut self, link: &mut L) -> Result<usize, LinkError> {
        let mut issued = 0;
        while let Some(request) = self.poll_request() {
            let result = match &request {
                LinkRequest::Write(write) => {
                    link.write_with_response(write.characteristic, &write.data)
                }
                LinkRequest::EnableNotifications(c) => link.enable_notifications(*c),
                LinkRequest::Disconnect => link.disconnect(),
            };
            if let Err(e) = result {
                warn!("Transport refused {:?}: {}", request, e);
                self.writer.requeue(request);
                return Err(e.into());
            }
            issued += 1;
        }
        Ok(issued)
    }

    /// Ask the sensor for data; returns the enqueued id
    pub fn send_control(
        &mut self,
        command: ControlCommand,
        now: Instant,
    ) -> Result<u16, LinkError> {
        let Some(crypto) = self.crypto.as_mut() else {
            return Err(LinkError::InvalidState(format!(
                "cannot send {} before authentication",
                command
            )));
        };

        // Framing consumes an id and an outbound sequence, so only frame what can be queued
        if !self.writer.has_room(1) {
            warn!("Control command {} refused: write queue full", command);
            self.refresh_deadline(now);
            return Err(WriterError::QueueFull.into());
        }

        let frame = match self.control.frame(crypto, &self.provider, command) {
            Ok(frame) => frame,
            Err(e) => return Err(self.fail(e.into())),
        };
        if let Err(e) = self.writer.write(Characteristic::PatchControl, frame) {
            self.control.reset();
            self.refresh_deadline(now);
            return Err(self.fail(e.into()));
        }

        let enqueued_id = self
            .control
            .pending()
            .map(|p| p.enqueued_id)
            .unwrap_or_default();
        info!("Control command {} sent as #{}", command, enqueued_id);
        self.refresh_deadline(now);
        Ok(enqueued_id)
    }

    /// Check the response deadline
    pub fn poll_timeout(&mut self, now: Instant) -> Result<(), LinkError> {
        match self.deadline {
            Some(deadline) if now >= deadline => Err(self.fail(LinkError::Timeout)),
            _ => Ok(()),
        }
    }

    /// The connection dropped; nothing survives it
    pub fn on_disconnect(&mut self) {
        info!("Disconnected in state {:?}", self.handshake.state());
        self.teardown();
        self.writer.clear();
    }

    fn handle_notification(
        &mut self,
        characteristic: Characteristic,
        data: &[u8],
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), LinkError> {
        let Some(payload) = self.reassembler.accept(characteristic, data)? else {
            return Ok(());
        };

        match payload {
            CompletePayload::Ignored {
                characteristic,
                reason,
            } => events.push(LinkEvent::Discarded {
                characteristic,
                reason,
            }),

            CompletePayload::SecurityNotification { data } => {
                let actions = self.handshake.on_security_notification(&data)?;
                self.apply(actions, events)?;
            }

            CompletePayload::Stream {
                characteristic,
                payload,
            } => {
                let actions = self
                    .handshake
                    .on_stream(&mut self.provider, characteristic, &payload)?;
                self.apply(actions, events)?;
            }

            CompletePayload::ControlReply { body, enqueued_id } => {
                let Some(crypto) = self.crypto.as_mut() else {
                    events.push(discarded(
                        Characteristic::PatchControl,
                        "control reply before authentication",
                    ));
                    return Ok(());
                };
                match self
                    .control
                    .on_reply(crypto, &self.provider, &body, enqueued_id)?
                {
                    ReplyOutcome::Completed {
                        command,
                        enqueued_id,
                        status,
                    } => {
                        info!("Control command {} #{} completed", command, enqueued_id);
                        events.push(LinkEvent::ControlCompleted {
                            command,
                            enqueued_id,
                            status,
                        });
                    }
                    ReplyOutcome::Unattributed { reason, .. } => {
                        events.push(LinkEvent::Discarded {
                            characteristic: Characteristic::PatchControl,
                            reason,
                        });
                    }
                }
            }

            CompletePayload::Sequenced {
                characteristic,
                payload,
                sequence,
            } => {
                let Some(crypto) = self.crypto.as_mut() else {
                    events.push(discarded(characteristic, "data frame before authentication"));
                    return Ok(());
                };
                let Some(packet_type) = PacketType::inbound_for(characteristic) else {
                    events.push(discarded(characteristic, "no packet type for characteristic"));
                    return Ok(());
                };

                let plaintext = crypto.decrypt(&self.provider, packet_type, sequence, &payload)?;
                debug!(
                    "{:?} #{} plaintext: {}",
                    packet_type,
                    sequence,
                    hex::encode(&plaintext)
                );
                match decode_packet(packet_type, &plaintext)? {
                    Some(record) => {
                        info!("{:?} #{} decoded", packet_type, sequence);
                        events.push(LinkEvent::Telemetry {
                            packet_type,
                            sequence,
                            record,
                        });
                    }
                    None => events.push(discarded(characteristic, "control packet on a data characteristic")),
                }
            }
        }
        Ok(())
    }

    fn apply(
        &mut self,
        actions: Vec<HandshakeAction>,
        events: &mut Vec<LinkEvent>,
    ) -> Result<(), LinkError> {
        for action in actions {
            match action {
                HandshakeAction::Send(command) => {
                    debug!("Sending {} (0x{:02X})", command, command.as_u8());
                    self.writer
                        .write(Characteristic::SecurityCommands, vec![command.as_u8()])?;
                }
                HandshakeAction::Write {
                    characteristic,
                    payload,
                } => {
                    self.writer.write_fragmented(characteristic, &payload)?;
                }
                HandshakeAction::EnableNotifications(characteristic) => {
                    self.writer
                        .enqueue(LinkRequest::EnableNotifications(characteristic))?;
                }
                HandshakeAction::ExpectStream {
                    characteristic,
                    size,
                } => self.reassembler.expect_stream(characteristic, size),
                HandshakeAction::Established(session) => {
                    self.crypto = Some(session);
                    events.push(LinkEvent::Authenticated);
                }
                HandshakeAction::Discarded {
                    characteristic,
                    reason,
                } => events.push(LinkEvent::Discarded {
                    characteristic,
                    reason,
                }),
            }
        }
        Ok(())
    }

    /// Something is owed by the sensor: a handshake step or a control reply
    fn awaiting_answer(&self) -> bool {
        self.handshake.pending_command().is_some() || self.control.pending().is_some()
    }

    fn refresh_deadline(&mut self, now: Instant) {
        self.deadline = if self.awaiting_answer() {
            Some(now + self.config.response_timeout)
        } else {
            None
        };
    }

    /// Tear down on fatal errors; returns the error for propagation
    fn fail(&mut self, err: LinkError) -> LinkError {
        if err.is_fatal() {
            error!("Fatal link error: {}", err);
            self.teardown();
            self.writer.clear();
            if let Err(e) = self.writer.enqueue(LinkRequest::Disconnect) {
                warn!("Could not queue disconnect: {}", e);
            }
        } else {
            warn!("Link error: {}", err);
        }
        err
    }

    fn teardown(&mut self) {
        self.reassembler.reset();
        self.handshake.reset();
        self.crypto = None;
        self.control.reset();
        self.deadline = None;
    }
}

fn discarded(characteristic: Characteristic, reason: &'static str) -> LinkEvent {
    warn!("{}: discarding: {}", characteristic, reason);
    LinkEvent::Discarded {
        characteristic,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CcmProvider;
    use crate::transport::GattError;
    use std::time::Duration;

    fn session() -> LinkSession<CcmProvider> {
        LinkSession::new(SessionConfig::new([1, 2, 3, 4]), CcmProvider::new([0x5A; 16])).unwrap()
    }

    fn drain(session: &mut LinkSession<CcmProvider>) -> Vec<LinkRequest> {
        let mut requests = Vec::new();
        while let Some(request) = session.poll_request() {
            let is_write = matches!(request, LinkRequest::Write(_));
            requests.push(request);
            if is_write {
                session.on_write_complete().unwrap();
            }
        }
        requests
    }

    #[derive(Default)]
    struct RecordingLink {
        issued: Vec<LinkRequest>,
        fail_writes: bool,
    }

    impl GattLink for RecordingLink {
        fn write_with_response(
            &mut self,
            characteristic: Characteristic,
            data: &[u8],
        ) -> Result<(), GattError> {
            if self.fail_writes {
                return Err(GattError::WriteFailed("link busy".into()));
            }
            self.issued.push(LinkRequest::Write(
                crate::transport::GattWrite::new(characteristic, data.to_vec())?,
            ));
            Ok(())
        }

        fn enable_notifications(&mut self, characteristic: Characteristic) -> Result<(), GattError> {
            self.issued.push(LinkRequest::EnableNotifications(characteristic));
            Ok(())
        }

        fn disconnect(&mut self) -> Result<(), GattError> {
            self.issued.push(LinkRequest::Disconnect);
            Ok(())
        }
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = SessionConfig::default();
        config.security_version = 5;
        assert!(matches!(
            LinkSession::new(config, CcmProvider::new([0; 16])),
            Err(LinkError::Config(_))
        ));
    }

    #[test]
    fn test_reconnect_queues_challenge_request() {
        let mut session = session();
        let now = Instant::now();
        session.reconnect(now).unwrap();

        let requests = drain(&mut session);
        assert_eq!(requests.len(), 4);
        assert_eq!(
            requests[0],
            LinkRequest::EnableNotifications(Characteristic::SecurityCommands)
        );
        assert!(matches!(
            &requests[3],
            LinkRequest::Write(w) if w.characteristic == Characteristic::SecurityCommands
                && w.data == vec![0x11]
        ));
        assert_eq!(session.deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_timeout_tears_down() {
        let mut session = session();
        let now = Instant::now();
        session.reconnect(now).unwrap();
        drain(&mut session);

        assert!(session.poll_timeout(now + Duration::from_secs(9)).is_ok());
        assert_eq!(
            session.poll_timeout(now + Duration::from_secs(10)),
            Err(LinkError::Timeout)
        );
        assert_eq!(session.handshake_state(), HandshakeState::Idle);
        assert_eq!(session.poll_request(), Some(LinkRequest::Disconnect));
    }

    #[test]
    fn test_notification_refreshes_deadline() {
        let mut session = session();
        let start = Instant::now();
        session.reconnect(start).unwrap();
        drain(&mut session);

        let later = start + Duration::from_secs(8);
        session
            .on_notification(Characteristic::SecurityCommands, &[0x08, 23], later)
            .unwrap();
        assert_eq!(session.deadline(), Some(later + Duration::from_secs(10)));
        assert_eq!(
            session.reassembler().expected_stream_size(Characteristic::ChallengeData),
            23
        );
    }

    #[test]
    fn test_unknown_size_hint_queues_disconnect() {
        let mut session = session();
        let now = Instant::now();
        session.reconnect(now).unwrap();
        drain(&mut session);

        assert_eq!(
            session.on_notification(Characteristic::SecurityCommands, &[0x08, 99], now),
            Err(LinkError::UnknownStreamSize(99))
        );
        assert_eq!(session.poll_request(), Some(LinkRequest::Disconnect));
        assert!(session.deadline().is_none());
    }

    #[test]
    fn test_counted_data_without_size_is_desync() {
        let mut session = session();
        let now = Instant::now();
        session.reconnect(now).unwrap();
        drain(&mut session);

        let result = session.on_notification(Characteristic::ChallengeData, &[0x00; 20], now);
        assert!(matches!(result, Err(LinkError::ProtocolDesync(_))));
        assert!(session.reassembler().is_idle());
        assert_eq!(session.poll_request(), Some(LinkRequest::Disconnect));
    }

    #[test]
    fn test_data_before_authentication_is_discarded() {
        let mut session = session();
        let events = session
            .on_notification(Characteristic::PatchStatus, &[0u8; 18], Instant::now())
            .unwrap();
        assert!(matches!(
            events.as_slice(),
            [LinkEvent::Discarded {
                characteristic: Characteristic::PatchStatus,
                ..
            }]
        ));
    }

    #[test]
    fn test_control_requires_authentication() {
        let mut session = session();
        assert!(matches!(
            session.send_control(ControlCommand::EventLog, Instant::now()),
            Err(LinkError::InvalidState(_))
        ));
        assert!(session.writer().is_idle());
    }

    #[test]
    fn test_stray_write_completion() {
        let mut session = session();
        assert_eq!(
            session.on_write_complete(),
            Err(LinkError::Writer(crate::transport::WriterError::NothingInFlight))
        );
    }

    #[test]
    fn test_drive_stops_at_write_and_retries_refused() {
        let mut session = session();
        session.reconnect(Instant::now()).unwrap();

        let mut link = RecordingLink {
            fail_writes: true,
            ..Default::default()
        };
        assert!(matches!(
            session.drive(&mut link),
            Err(LinkError::Transport(GattError::WriteFailed(_)))
        ));
        assert_eq!(link.issued.len(), 3);

        link.fail_writes = false;
        assert_eq!(session.drive(&mut link).unwrap(), 1);
        assert_eq!(link.issued.len(), 4);
        assert!(session.drive(&mut link).unwrap() == 0);

        session.on_write_complete().unwrap();
        assert!(session.writer().is_idle());
    }

    #[test]
    fn test_disconnect_resets_everything() {
        let mut session = session();
        let now = Instant::now();
        session.pair(now).unwrap();
        session.poll_request();

        session.on_disconnect();
        assert_eq!(session.handshake_state(), HandshakeState::Idle);
        assert!(session.writer().is_idle());
        assert!(session.reassembler().is_idle());
        assert!(session.crypto_session().is_none());
        assert!(session.deadline().is_none());

        session.reconnect(now).unwrap();
    }

    #[test]
    fn test_full_queue_leaves_control_channel_usable() {
        let now = Instant::now();
        let mut sensor = crate::sim::SimulatedSensor::new([0x5A; 16], [1, 2, 3, 4], 21);
        let mut session = session();
        session.reconnect(now).unwrap();
        assert_eq!(
            sensor.exchange(&mut session, now).unwrap(),
            vec![LinkEvent::Authenticated]
        );

        while session.writer.has_room(1) {
            session
                .writer
                .enqueue(LinkRequest::EnableNotifications(Characteristic::PatchStatus))
                .unwrap();
        }
        assert_eq!(
            session.send_control(ControlCommand::EventLog, now),
            Err(LinkError::Writer(WriterError::QueueFull))
        );
        assert!(session.pending_control().is_none());
        assert!(session.deadline().is_none());
        assert!(session.is_authenticated());

        session.writer.clear();
        assert_eq!(session.send_control(ControlCommand::EventLog, now), Ok(1));
        assert_eq!(session.deadline(), Some(now + Duration::from_secs(10)));

        let events = sensor.exchange(&mut session, now).unwrap();
        assert!(events.contains(&LinkEvent::ControlCompleted {
            command: ControlCommand::EventLog,
            enqueued_id: 1,
            status: [0; 4],
        }));
    }

    #[test]
    fn test_partial_opening_is_abandoned() {
        let mut config = SessionConfig::new([1, 2, 3, 4]);
        config.write_queue_capacity = 2;
        let mut session = LinkSession::new(config, CcmProvider::new([0x5A; 16])).unwrap();
        let now = Instant::now();

        assert_eq!(
            session.reconnect(now),
            Err(LinkError::Writer(WriterError::QueueFull))
        );
        assert_eq!(session.handshake_state(), HandshakeState::Idle);
        assert!(session.writer().is_idle());
        assert!(session.deadline().is_none());

        // Not stuck in a half-started handshake
        assert_eq!(
            session.pair(now),
            Err(LinkError::Writer(WriterError::QueueFull))
        );
        assert_eq!(session.handshake_state(), HandshakeState::Idle);
    }

    #[test]
    fn test_pair_twice_is_invalid_but_not_fatal() {
        let mut session = session();
        let now = Instant::now();
        session.pair(now).unwrap();
        assert!(matches!(session.pair(now), Err(LinkError::InvalidState(_))));
        assert_eq!(session.handshake_state(), HandshakeState::AwaitingCertAccepted);
    }
}
