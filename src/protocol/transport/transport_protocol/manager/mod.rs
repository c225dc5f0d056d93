//! The transport protocol state machine driver.
//!
//! The manager owns the fixed session pool and is driven from exactly two
//! entry points: [`process_message`](TransportProtocolManager::process_message)
//! dispatches one inbound CAN frame, and
//! [`update`](TransportProtocolManager::update) advances every active session
//! by one cooperative tick. Both are synchronous and non-blocking; the only
//! I/O during an update is a clock read, and the frame sink's return value is
//! the only back-pressure signal.
use crate::error::TransmitError;
use crate::protocol::control_function::ControlFunction;
use crate::protocol::transport::can_id::{PRIORITY_DEFAULT, PRIORITY_LOWEST};
use crate::protocol::transport::traits::korri_clock::KorriClock;
use crate::protocol::transport::traits::sinks::{FrameSink, MessageSink};
use crate::protocol::transport::transport_protocol::connection::{
    ConnectionAbortReason, ConnectionManagement,
};
use crate::protocol::transport::transport_protocol::session::{
    Direction, StateMachineState, TransportProtocolSession,
};
use crate::protocol::transport::transport_protocol::{
    AddressedFrame, ReassembledMessage, TransmitCompleteCallback, TransmitResult, TransportConfig,
    MAX_CONCURRENT_SESSIONS, MAX_PACKETS_PER_CTS, MAX_TRANSPORT_MESSAGE_LENGTH,
    MIN_TRANSPORT_MESSAGE_LENGTH, PROTOCOL_BYTES_PER_FRAME,
    TRANSPORT_CONNECTION_MANAGEMENT_PGN, TRANSPORT_DATA_TRANSFER_PGN,
};
use crate::protocol::transport::{MESSAGE_TR_TIMEOUT_MS, T1_TIMEOUT_MS, T2_T3_TIMEOUT_MS};

/// Driver for every active multi-packet transfer of one node.
///
/// Sessions borrow their control function handles for `'m`, the lifetime of
/// the peer registry the handles live in.
pub struct TransportProtocolManager<'m, F, M, K>
where
    F: FrameSink,
    M: MessageSink,
    K: KorriClock,
{
    frame_sink: F,
    message_sink: M,
    clock: K,
    configuration: TransportConfig,
    sessions: [Option<TransportProtocolSession<'m>>; MAX_CONCURRENT_SESSIONS],
}

impl<'m, F, M, K> TransportProtocolManager<'m, F, M, K>
where
    F: FrameSink,
    M: MessageSink,
    K: KorriClock,
{
    /// Instantiate the manager with an empty session pool.
    pub fn new(frame_sink: F, message_sink: M, clock: K, configuration: TransportConfig) -> Self {
        Self {
            frame_sink,
            message_sink,
            clock,
            configuration,
            sessions: [const { None }; MAX_CONCURRENT_SESSIONS],
        }
    }

    //==================================================================================Receive path

    fn process_broadcast_announce_message(
        &mut self,
        source: &'m ControlFunction,
        pgn: u32,
        total_size: u16,
        total_packets: u8,
    ) {
        if !(MIN_TRANSPORT_MESSAGE_LENGTH..=MAX_TRANSPORT_MESSAGE_LENGTH)
            .contains(&(total_size as usize))
        {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: ignoring Broadcast Announce Message (BAM) for {} announcing {} bytes",
                pgn,
                total_size
            );
            return;
        }
        // The standard forbids aborting a global transfer; at the session
        // limit the BAM can only be ignored.
        if self.active_session_count() >= self.session_limit() {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: ignoring Broadcast Announce Message (BAM) for {}, session limit reached",
                pgn
            );
            return;
        }
        if let Some(old_index) = self.find_session(source, None) {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: BAM received while a broadcast session already existed for source {}, overwriting with {}",
                source.address(),
                pgn
            );
            self.close_session(old_index, false);
        }

        let now_ms = self.clock.now_ms();
        let mut session = TransportProtocolSession::create_receive_session(
            pgn,
            total_size,
            total_packets,
            u8::MAX, // Arbitrary - unused for broadcast
            source,
            None,
            now_ms,
        );
        session.set_state(StateMachineState::RxDataSession, now_ms);
        self.insert_session(session);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "[TP]: new rx broadcast session for {} from source {}",
            pgn,
            source.address()
        );
    }

    fn process_request_to_send(
        &mut self,
        source: &'m ControlFunction,
        destination: &'m ControlFunction,
        pgn: u32,
        total_size: u16,
        total_packets: u8,
        packet_limit: u8,
    ) {
        if !(MIN_TRANSPORT_MESSAGE_LENGTH..=MAX_TRANSPORT_MESSAGE_LENGTH)
            .contains(&(total_size as usize))
        {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: ignoring Request To Send (RTS) for {} announcing {} bytes",
                pgn,
                total_size
            );
            return;
        }
        if self.active_session_count() >= self.session_limit() {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: aborting Request To Send (RTS) for {}, session limit reached",
                pgn
            );
            self.send_abort(
                destination,
                source,
                pgn,
                ConnectionAbortReason::AlreadyInCMSession,
            );
            return;
        }
        if let Some(old_index) = self.find_session(source, Some(destination)) {
            let old_pgn = self.sessions[old_index].as_ref().map(|s| s.pgn);
            if old_pgn != Some(pgn) {
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "[TP]: RTS received while a session already existed for this source and destination, aborting for {}",
                    pgn
                );
                self.abort_session(old_index, ConnectionAbortReason::AlreadyInCMSession);
                return;
            }
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: RTS received while a session already existed for this source, destination and PGN, overwriting for {}",
                pgn
            );
            self.close_session(old_index, false);
        }

        let now_ms = self.clock.now_ms();
        let mut session = TransportProtocolSession::create_receive_session(
            pgn,
            total_size,
            total_packets,
            packet_limit,
            source,
            Some(destination),
            now_ms,
        );
        session.set_state(StateMachineState::ClearToSend, now_ms);
        self.insert_session(session);
    }

    fn process_clear_to_send(
        &mut self,
        source: &'m ControlFunction,
        destination: &'m ControlFunction,
        pgn: u32,
        packets_to_send: u8,
        next_packet_number: u8,
    ) {
        // The CTS comes from the receiving side, so our transmit session is
        // keyed the other way around.
        let Some(index) = self.find_session(destination, Some(source)) else {
            // Aborting clears the peer up faster than waiting for its timeout
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: CTS received for {} while no session existed for this source and destination, sending abort",
                pgn
            );
            self.send_abort(destination, source, pgn, ConnectionAbortReason::AnyOtherError);
            return;
        };
        let (session_pgn, state, last_packet_number) = {
            let session = self.sessions[index].as_ref().unwrap();
            (session.pgn, session.state, session.last_packet_number)
        };
        if session_pgn != pgn {
            #[cfg(feature = "defmt")]
            defmt::error!(
                "[TP]: CTS received for {} while a session for {} existed for this source and destination, aborting both",
                pgn,
                session_pgn
            );
            self.abort_session(index, ConnectionAbortReason::AnyOtherError);
            self.send_abort(destination, source, pgn, ConnectionAbortReason::AnyOtherError);
        } else if u16::from(next_packet_number) != u16::from(last_packet_number) + 1 {
            #[cfg(feature = "defmt")]
            defmt::error!(
                "[TP]: CTS received for {} with a bad next packet number, aborting",
                pgn
            );
            self.abort_session(index, ConnectionAbortReason::BadSequenceNumber);
        } else if state != StateMachineState::WaitForClearToSend {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: CTS received for {} while not expecting one, aborting",
                pgn
            );
            self.abort_session(
                index,
                ConnectionAbortReason::ClearToSendReceivedWhileTransferInProgress,
            );
        } else {
            let now_ms = self.clock.now_ms();
            let session = self.sessions[index].as_mut().unwrap();
            session.cts_packet_count = packets_to_send;
            session.timestamp_ms = now_ms;
            // A zero packet window means the peer wants us to hold; stay
            // here until a non-zero window arrives.
            if packets_to_send != 0 {
                session.window_packet_count = 0;
                session.set_state(StateMachineState::TxDataSession, now_ms);
            }
        }
    }

    fn process_end_of_message_acknowledgement(
        &mut self,
        source: &'m ControlFunction,
        destination: &'m ControlFunction,
        pgn: u32,
    ) {
        let Some(index) = self.find_session(destination, Some(source)) else {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: EOMA received for {} while no session existed for this source and destination, sending abort",
                pgn
            );
            self.send_abort(destination, source, pgn, ConnectionAbortReason::AnyOtherError);
            return;
        };
        let state = self.sessions[index].as_ref().unwrap().state;
        if state == StateMachineState::WaitForEndOfMessageAcknowledge {
            #[cfg(feature = "defmt")]
            defmt::debug!("[TP]: completed tx session for {}", pgn);
            self.close_session(index, true);
        } else {
            // Not waiting for an EOMA; the standard says to ignore it
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: EOMA received for {} while not expecting one, ignoring",
                pgn
            );
        }
    }

    fn process_abort(
        &mut self,
        source: &'m ControlFunction,
        destination: &'m ControlFunction,
        pgn: u32,
        _reason: ConnectionAbortReason,
    ) {
        let mut found_session = false;

        if let Some(index) = self.find_session(source, Some(destination)) {
            if self.sessions[index].as_ref().map(|s| s.pgn) == Some(pgn) {
                found_session = true;
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "[TP]: abort received (reason={}) for an rx session for {}",
                    _reason.to_wire(),
                    pgn
                );
                self.close_session(index, false);
            }
        }
        if let Some(index) = self.find_session(destination, Some(source)) {
            if self.sessions[index].as_ref().map(|s| s.pgn) == Some(pgn) {
                found_session = true;
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "[TP]: abort received (reason={}) for a tx session for {}",
                    _reason.to_wire(),
                    pgn
                );
                self.close_session(index, false);
            }
        }

        if !found_session {
            #[cfg(feature = "defmt")]
            defmt::warn!("[TP]: abort received with no matching session for {}", pgn);
        }
    }

    fn process_connection_management_message(&mut self, message: &AddressedFrame<'m>) {
        if message.frame.len != 8 {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: received a connection management message of invalid length {}",
                message.frame.len
            );
            return;
        }
        let Some(command) = ConnectionManagement::decode(&message.frame.data) else {
            #[cfg(feature = "defmt")]
            defmt::warn!("[TP]: bad multiplexor in connection management message");
            return;
        };

        match command {
            ConnectionManagement::BroadcastAnnounce {
                total_size,
                total_packets,
                pgn,
            } => {
                if message.destination.is_some() {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: BAM with a non-global destination, ignoring");
                    return;
                }
                self.process_broadcast_announce_message(
                    message.source,
                    pgn,
                    total_size,
                    total_packets,
                );
            }
            ConnectionManagement::RequestToSend {
                total_size,
                total_packets,
                packet_limit,
                pgn,
            } => {
                let Some(destination) = message.destination else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: RTS with a global destination, ignoring");
                    return;
                };
                self.process_request_to_send(
                    message.source,
                    destination,
                    pgn,
                    total_size,
                    total_packets,
                    packet_limit,
                );
            }
            ConnectionManagement::ClearToSend {
                packets_to_send,
                next_packet_number,
                pgn,
            } => {
                let Some(destination) = message.destination else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: CTS with a global destination, ignoring");
                    return;
                };
                self.process_clear_to_send(
                    message.source,
                    destination,
                    pgn,
                    packets_to_send,
                    next_packet_number,
                );
            }
            ConnectionManagement::EndOfMessageAcknowledge { pgn, .. } => {
                let Some(destination) = message.destination else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: EOMA with a global destination, ignoring");
                    return;
                };
                self.process_end_of_message_acknowledgement(message.source, destination, pgn);
            }
            ConnectionManagement::Abort { reason, pgn } => {
                let Some(destination) = message.destination else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: abort with a global destination, ignoring");
                    return;
                };
                self.process_abort(message.source, destination, pgn, reason);
            }
        }
    }

    fn process_data_transfer_message(&mut self, message: &AddressedFrame<'m>) {
        if message.frame.len != 8 {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: received a data transfer message of invalid length {}",
                message.frame.len
            );
            return;
        }
        let source = message.source;
        let destination = message.destination;
        let sequence_number = message.frame.data[0];

        let Some(index) = self.find_session(source, destination) else {
            if destination.is_some() {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "[TP]: data transfer from {} with no matching session, ignoring",
                    source.address()
                );
            }
            return;
        };
        let (state, last_packet_number) = {
            let session = self.sessions[index].as_ref().unwrap();
            (session.state, session.last_packet_number)
        };

        if state != StateMachineState::RxDataSession {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: data transfer from {} while not expecting one, sending abort",
                source.address()
            );
            self.abort_session(
                index,
                ConnectionAbortReason::UnexpectedDataTransferPacketReceived,
            );
        } else if sequence_number == last_packet_number {
            #[cfg(feature = "defmt")]
            defmt::error!("[TP]: aborting rx session due to duplicate sequence number");
            self.abort_session(index, ConnectionAbortReason::DuplicateSequenceNumber);
        } else if sequence_number == last_packet_number + 1 {
            // Correct sequence number, copy the payload
            let now_ms = self.clock.now_ms();
            let (complete, window_exhausted, specific) = {
                let session = self.sessions[index].as_mut().unwrap();
                let offset = PROTOCOL_BYTES_PER_FRAME * last_packet_number as usize;
                let take = PROTOCOL_BYTES_PER_FRAME.min(session.data.len() - offset);
                session.data.as_mut_slice()[offset..offset + take]
                    .copy_from_slice(&message.frame.data[1..1 + take]);
                session.last_packet_number = sequence_number;
                session.window_packet_count += 1;
                session.timestamp_ms = now_ms;
                (
                    session.is_message_complete(),
                    session.window_packet_count >= session.cts_packet_count,
                    !session.is_broadcast(),
                )
            };
            if complete {
                // Only destination specific sessions get acknowledged
                if specific {
                    self.send_end_of_session_acknowledgement(index);
                } else {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("[TP]: completed broadcast rx session");
                }
                self.deliver_completed_session(index);
            } else if specific && window_exhausted {
                // Granted window consumed; queue the next CTS
                self.set_session_state(index, StateMachineState::ClearToSend);
            }
        } else {
            #[cfg(feature = "defmt")]
            defmt::error!("[TP]: aborting rx session due to bad sequence number");
            self.abort_session(index, ConnectionAbortReason::BadSequenceNumber);
        }
    }

    /// Dispatch one inbound CAN message by PGN. Frames that are not
    /// transport protocol traffic are ignored.
    pub fn process_message(&mut self, message: &AddressedFrame<'m>) {
        if !message.source.has_valid_address() {
            return;
        }
        if let Some(destination) = message.destination {
            if !destination.has_valid_address() {
                return;
            }
        }
        match message.frame.id.pgn() {
            TRANSPORT_CONNECTION_MANAGEMENT_PGN => {
                self.process_connection_management_message(message);
            }
            TRANSPORT_DATA_TRANSFER_PGN => {
                self.process_data_transfer_message(message);
            }
            _ => {}
        }
    }

    //==================================================================================Transmit path

    /// Open a transmit session for `data`. The payload is copied into the
    /// session's own buffer; the completion callback fires exactly once when
    /// the session ends, with the transfer outcome.
    pub fn protocol_transmit_message(
        &mut self,
        pgn: u32,
        data: &[u8],
        source: &'m ControlFunction,
        destination: Option<&'m ControlFunction>,
        complete_callback: Option<TransmitCompleteCallback>,
    ) -> Result<(), TransmitError> {
        if data.len() < MIN_TRANSPORT_MESSAGE_LENGTH {
            return Err(TransmitError::TooShort { length: data.len() });
        }
        if data.len() > MAX_TRANSPORT_MESSAGE_LENGTH {
            return Err(TransmitError::TooLong { length: data.len() });
        }
        if !source.has_valid_address() {
            return Err(TransmitError::InvalidSource);
        }
        if self.has_session(source, destination) {
            return Err(TransmitError::DuplicateSession);
        }
        if self.active_session_count() >= self.session_limit() {
            // Broadcasts are refused silently on the wire: there is no peer
            // to abort with.
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: refusing tx session for {}, session limit reached",
                pgn
            );
            return Err(TransmitError::SessionLimitReached);
        }

        let now_ms = self.clock.now_ms();
        let mut session = TransportProtocolSession::create_transmit_session(
            pgn,
            data,
            source,
            destination,
            complete_callback,
            now_ms,
        );
        let initial_state = if session.is_broadcast() {
            StateMachineState::BroadcastAnnounce
        } else {
            StateMachineState::RequestToSend
        };
        session.set_state(initial_state, now_ms);
        self.insert_session(session);

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "[TP]: new tx session for {} from source {}",
            pgn,
            source.address()
        );
        Ok(())
    }

    /// Advance every active session by one cooperative tick.
    pub fn update(&mut self) {
        for index in 0..MAX_CONCURRENT_SESSIONS {
            let Some((source_valid, destination_valid, state)) =
                self.sessions[index].as_ref().map(|session| {
                    (
                        session.source.has_valid_address(),
                        session
                            .destination
                            .map(|destination| destination.has_valid_address())
                            .unwrap_or(true),
                        session.state,
                    )
                })
            else {
                continue;
            };
            if !source_valid {
                #[cfg(feature = "defmt")]
                defmt::warn!("[TP]: closing session, source control function is no longer valid");
                self.abort_session(index, ConnectionAbortReason::AnyOtherError);
            } else if !destination_valid {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "[TP]: closing session, destination control function is no longer valid"
                );
                self.abort_session(index, ConnectionAbortReason::AnyOtherError);
            } else if state != StateMachineState::None {
                self.update_state_machine(index);
            }
        }
    }

    fn send_data_transfer_packets(&mut self, index: usize) {
        let mut frames_sent: u8 = 0;

        loop {
            let Some((source, destination, is_broadcast, buffer)) =
                self.sessions[index].as_ref().and_then(|session| {
                    if session.last_packet_number >= session.total_packets {
                        return None; // everything sent
                    }
                    if !session.is_broadcast()
                        && session.window_packet_count >= session.cts_packet_count
                    {
                        return None; // granted window exhausted
                    }
                    let mut buffer = [0xFFu8; 8];
                    buffer[0] = session.last_packet_number + 1;
                    let offset = PROTOCOL_BYTES_PER_FRAME * session.last_packet_number as usize;
                    let take = PROTOCOL_BYTES_PER_FRAME.min(session.data.len() - offset);
                    buffer[1..1 + take]
                        .copy_from_slice(&session.data.as_slice()[offset..offset + take]);
                    Some((
                        session.source,
                        session.destination,
                        session.is_broadcast(),
                        buffer,
                    ))
                })
            else {
                break;
            };

            if !self.frame_sink.send_frame(
                TRANSPORT_DATA_TRANSFER_PGN,
                &buffer,
                source,
                destination,
                PRIORITY_LOWEST,
            ) {
                // Back-pressure; resume on the next update
                break;
            }

            let now_ms = self.clock.now_ms();
            let session = self.sessions[index].as_mut().unwrap();
            session.last_packet_number += 1;
            session.window_packet_count += 1;
            session.timestamp_ms = now_ms;
            frames_sent += 1;

            if is_broadcast {
                // One frame per tick; the inter-frame gap paces the rest
                break;
            }
            if frames_sent >= self.configuration.frames_per_update {
                break; // throttle the session
            }
        }

        let Some((complete, is_broadcast, window_exhausted, _pgn)) =
            self.sessions[index].as_ref().map(|session| {
                (
                    session.is_message_complete(),
                    session.is_broadcast(),
                    session.window_packet_count >= session.cts_packet_count,
                    session.pgn,
                )
            })
        else {
            return;
        };
        if complete {
            if is_broadcast {
                #[cfg(feature = "defmt")]
                defmt::debug!("[TP]: completed broadcast tx session for {}", _pgn);
                self.close_session(index, true);
            } else {
                self.set_session_state(index, StateMachineState::WaitForEndOfMessageAcknowledge);
            }
        } else if !is_broadcast && window_exhausted && frames_sent > 0 {
            self.set_session_state(index, StateMachineState::WaitForClearToSend);
        }
    }

    fn update_state_machine(&mut self, index: usize) {
        let now_ms = self.clock.now_ms();
        let Some((state, is_broadcast, timestamp_ms, _pgn)) =
            self.sessions[index].as_ref().map(|session| {
                (
                    session.state,
                    session.is_broadcast(),
                    session.timestamp_ms,
                    session.pgn,
                )
            })
        else {
            return;
        };

        match state {
            StateMachineState::None => {}

            StateMachineState::ClearToSend => {
                if self.send_clear_to_send(index) {
                    self.set_session_state(index, StateMachineState::RxDataSession);
                }
            }

            StateMachineState::WaitForClearToSend
            | StateMachineState::WaitForEndOfMessageAcknowledge => {
                if now_ms.saturating_sub(timestamp_ms) >= T2_T3_TIMEOUT_MS {
                    #[cfg(feature = "defmt")]
                    defmt::error!("[TP]: timeout of tx session for {}", _pgn);
                    self.abort_session(index, ConnectionAbortReason::Timeout);
                }
            }

            StateMachineState::RequestToSend => {
                if self.send_request_to_send(index) {
                    self.set_session_state(index, StateMachineState::WaitForClearToSend);
                }
            }

            StateMachineState::BroadcastAnnounce => {
                if self.send_broadcast_announce_message(index) {
                    self.set_session_state(index, StateMachineState::TxDataSession);
                }
            }

            StateMachineState::TxDataSession => {
                let gap_ms = self.configuration.bam_frame_gap_ms as u64;
                if is_broadcast && now_ms.saturating_sub(timestamp_ms) < gap_ms {
                    // Waiting out the broadcast inter-frame gap
                } else {
                    self.send_data_transfer_packets(index);
                }
            }

            StateMachineState::RxDataSession => {
                if is_broadcast {
                    if now_ms.saturating_sub(timestamp_ms) >= T1_TIMEOUT_MS {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("[TP]: broadcast rx session timeout for {}", _pgn);
                        self.close_session(index, false);
                    }
                } else if now_ms.saturating_sub(timestamp_ms) >= MESSAGE_TR_TIMEOUT_MS {
                    #[cfg(feature = "defmt")]
                    defmt::error!("[TP]: rx session timeout for {}", _pgn);
                    self.abort_session(index, ConnectionAbortReason::Timeout);
                }
            }
        }
    }

    //==================================================================================Session lifecycle

    /// Send an abort for the session (connection mode only; broadcasts have
    /// no peer to abort with), then close it as unsuccessful.
    fn abort_session(&mut self, index: usize, reason: ConnectionAbortReason) -> bool {
        let Some((direction, pgn, source, destination)) =
            self.sessions[index].as_ref().map(|session| {
                (
                    session.direction,
                    session.pgn,
                    session.source,
                    session.destination,
                )
            })
        else {
            return false;
        };
        let sent = match (direction, destination) {
            (Direction::Transmit, Some(peer)) => self.send_abort(source, peer, pgn, reason),
            (Direction::Receive, Some(ours)) => self.send_abort(ours, source, pgn, reason),
            _ => false,
        };
        self.close_session(index, false);
        sent
    }

    fn send_abort(
        &mut self,
        sender: &ControlFunction,
        receiver: &ControlFunction,
        pgn: u32,
        reason: ConnectionAbortReason,
    ) -> bool {
        let buffer = ConnectionManagement::Abort { reason, pgn }.encode();
        self.frame_sink.send_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            &buffer,
            sender,
            Some(receiver),
            PRIORITY_LOWEST,
        )
    }

    /// Drop the session from the pool. Transmit sessions fire their
    /// completion callback exactly here, so every admitted transmission
    /// reports its outcome exactly once.
    fn close_session(&mut self, index: usize, successful: bool) {
        let Some(session) = self.sessions[index].take() else {
            return;
        };
        if session.direction == Direction::Transmit {
            if let Some(callback) = session.complete_callback {
                let result = TransmitResult {
                    pgn: session.pgn,
                    length: session.total_size(),
                    source: session.source,
                    destination: session.destination,
                    successful,
                };
                callback(&result);
            }
        }
        #[cfg(feature = "defmt")]
        defmt::debug!("[TP]: session closed");
    }

    /// Hand the reassembled message upward, then drop the session. Delivery
    /// failures never inhibit the close.
    fn deliver_completed_session(&mut self, index: usize) {
        let Some(session) = self.sessions[index].take() else {
            return;
        };
        let message = ReassembledMessage {
            pgn: session.pgn,
            priority: PRIORITY_DEFAULT,
            source: session.source,
            destination: session.destination,
            payload: session.data.as_slice(),
        };
        self.message_sink.message_received(&message);
        #[cfg(feature = "defmt")]
        defmt::debug!("[TP]: session closed");
    }

    fn set_session_state(&mut self, index: usize, state: StateMachineState) {
        let now_ms = self.clock.now_ms();
        if let Some(session) = self.sessions[index].as_mut() {
            session.set_state(state, now_ms);
        }
    }

    //==================================================================================Frame emitters

    fn send_broadcast_announce_message(&mut self, index: usize) -> bool {
        let Some(session) = self.sessions[index].as_ref() else {
            return false;
        };
        let buffer = ConnectionManagement::BroadcastAnnounce {
            total_size: session.total_size(),
            total_packets: session.total_packets,
            pgn: session.pgn,
        }
        .encode();
        let source = session.source;
        self.frame_sink.send_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            &buffer,
            source,
            None,
            PRIORITY_LOWEST,
        )
    }

    fn send_request_to_send(&mut self, index: usize) -> bool {
        let Some(session) = self.sessions[index].as_ref() else {
            return false;
        };
        let buffer = ConnectionManagement::RequestToSend {
            total_size: session.total_size(),
            total_packets: session.total_packets,
            packet_limit: MAX_PACKETS_PER_CTS,
            pgn: session.pgn,
        }
        .encode();
        let (source, destination) = (session.source, session.destination);
        self.frame_sink.send_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            &buffer,
            source,
            destination,
            PRIORITY_LOWEST,
        )
    }

    fn send_clear_to_send(&mut self, index: usize) -> bool {
        let Some((pgn, source, ours, packets_this_window, next_packet_number)) =
            self.sessions[index].as_ref().and_then(|session| {
                // We are the receiving side, so our identity is the
                // session's destination.
                let ours = session.destination?;
                Some((
                    session.pgn,
                    session.source,
                    ours,
                    session.cts_packet_count_max.min(session.remaining_packets()),
                    session.last_packet_number + 1,
                ))
            })
        else {
            return false;
        };
        let buffer = ConnectionManagement::ClearToSend {
            packets_to_send: packets_this_window,
            next_packet_number,
            pgn,
        }
        .encode();
        let sent = self.frame_sink.send_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            &buffer,
            ours,
            Some(source),
            PRIORITY_LOWEST,
        );
        if sent {
            let session = self.sessions[index].as_mut().unwrap();
            session.cts_packet_count = packets_this_window;
            session.window_packet_count = 0;
        }
        sent
    }

    fn send_end_of_session_acknowledgement(&mut self, index: usize) -> bool {
        let Some((pgn, total_size, total_packets, source, ours)) =
            self.sessions[index].as_ref().and_then(|session| {
                let ours = session.destination?;
                Some((
                    session.pgn,
                    session.total_size(),
                    session.total_packets,
                    session.source,
                    ours,
                ))
            })
        else {
            return false;
        };
        let buffer = ConnectionManagement::EndOfMessageAcknowledge {
            total_size,
            total_packets,
            pgn,
        }
        .encode();
        self.frame_sink.send_frame(
            TRANSPORT_CONNECTION_MANAGEMENT_PGN,
            &buffer,
            ours,
            Some(source),
            PRIORITY_LOWEST,
        )
    }

    //==================================================================================Lookup

    /// Whether a session exists for this exact (source, destination) pair.
    pub fn has_session(
        &self,
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
    ) -> bool {
        self.find_session(source, destination).is_some()
    }

    /// Number of currently active sessions, transmit and receive combined.
    pub fn active_session_count(&self) -> usize {
        self.sessions.iter().filter(|slot| slot.is_some()).count()
    }

    fn session_limit(&self) -> usize {
        self.configuration.max_sessions.min(MAX_CONCURRENT_SESSIONS)
    }

    fn find_session(
        &self,
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
    ) -> Option<usize> {
        self.sessions.iter().position(|slot| {
            slot.as_ref()
                .map(|session| session.matches(source, destination))
                .unwrap_or(false)
        })
    }

    fn insert_session(&mut self, session: TransportProtocolSession<'m>) -> bool {
        match self.sessions.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(session);
                true
            }
            None => {
                #[cfg(feature = "defmt")]
                defmt::warn!("[TP]: session pool exhausted, dropping session");
                false
            }
        }
    }
}
