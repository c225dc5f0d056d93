//! Transport supervisor built on top of
//! [`TransportProtocolManager`].
//!
//! It keeps the tick-driven protocol core alive on an asynchronous CAN bus
//! and optionally offers:
//!
//! * a command channel to queue raw frames or multi-packet transmissions;
//! * a frame channel forwarding non-transport traffic to the application.
//!
//! Firmware decides which features it needs by providing pre-allocated
//! [`embassy_sync::channel::Channel`] instances. No allocation is performed
//! by the library and there is no dependency on a particular BSP.

use core::fmt::Debug;

use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, channel::Channel};
use futures_util::{
    future::{select, Either},
    pin_mut,
};

use crate::protocol::control_function::{ControlFunction, PeerRegistry, GLOBAL_ADDRESS};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::can_id::CanId;
use crate::protocol::transport::traits::can_bus::CanBus;
use crate::protocol::transport::traits::korri_clock::KorriClock;
use crate::protocol::transport::traits::korri_timer::KorriTimer;
use crate::protocol::transport::traits::sinks::{FrameSink, MessageSink};
use crate::protocol::transport::transport_protocol::manager::TransportProtocolManager;
use crate::protocol::transport::transport_protocol::{
    AddressedFrame, TransmitCompleteCallback, TransmitResult, TransportConfig,
    MAX_TRANSPORT_MESSAGE_LENGTH, TRANSPORT_CONNECTION_MANAGEMENT_PGN,
    TRANSPORT_DATA_TRANSFER_PGN,
};

/// Interval between two protocol ticks (ms).
///
/// Comfortably finer than the 50 ms BAM pacing floor, coarse enough to stay
/// negligible next to the frame time of a 250 kbit/s bus.
pub const UPDATE_PERIOD_MS: u32 = 5;

//==================================================================================Frame sink

/// Non-blocking frame sink backed by a firmware-provided outbound queue.
///
/// A full queue is the back-pressure signal: `send_frame` returns `false`
/// and the protocol core retries on its next tick, while the supervisor
/// drains the queue into the bus between ticks.
pub struct ChannelFrameSink<'q, const OUT_CAP: usize> {
    queue: &'q Channel<CriticalSectionRawMutex, CanFrame, OUT_CAP>,
}

impl<'q, const OUT_CAP: usize> FrameSink for ChannelFrameSink<'q, OUT_CAP> {
    fn send_frame(
        &mut self,
        pgn: u32,
        data: &[u8; 8],
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
        priority: u8,
    ) -> bool {
        let destination_address = destination
            .map(|control_function| control_function.address())
            .unwrap_or(GLOBAL_ADDRESS);
        let id = match CanId::builder(pgn, source.address())
            .with_priority(priority)
            .to_destination(destination_address)
            .build()
        {
            Ok(id) => id,
            Err(_) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("[TP]: refusing to queue frame with malformed identifier");
                return false;
            }
        };
        self.queue
            .try_send(CanFrame {
                id,
                data: *data,
                len: 8,
            })
            .is_ok()
    }
}

//==================================================================================Commands

/// Commands queued by producer tasks.
#[derive(Clone)]
pub enum TransportCommand {
    /// Pass a single frame straight through to the bus.
    SendFrame(CanFrame),
    /// Open a multi-packet transmit session from the supervisor's own
    /// control function.
    SendMessage {
        /// PGN of the transported message.
        pgn: u32,
        /// Peer address, or `None` for a broadcast.
        destination: Option<u8>,
        /// Number of valid payload bytes.
        length: usize,
        /// Payload storage; only the first `length` bytes are sent.
        payload: [u8; MAX_TRANSPORT_MESSAGE_LENGTH],
        /// Invoked exactly once with the transfer outcome.
        complete_callback: Option<TransmitCompleteCallback>,
    },
}

#[derive(Debug)]
/// Fatal bus errors terminating the supervisor loop.
pub enum TransportSupervisorError<E: Debug> {
    Receive(E),
    Send(E),
}

//==================================================================================Supervisor

/// Service driving a [`TransportProtocolManager`] over an asynchronous CAN
/// bus: it resolves inbound addresses through the peer registry, pumps the
/// protocol tick, and drains the outbound queue.
pub struct TransportSupervisor<
    'a,
    C,
    T,
    K,
    M,
    const PEERS: usize,
    const OUT_CAP: usize,
    const CMD_CAP: usize,
    const FRAME_CAP: usize,
> where
    C: CanBus,
    C::Error: Debug,
    T: KorriTimer,
    K: KorriClock,
    M: MessageSink,
{
    can_bus: C,
    timer: T,
    internal: &'a ControlFunction,
    peers: &'a PeerRegistry<PEERS>,
    out_queue: &'a Channel<CriticalSectionRawMutex, CanFrame, OUT_CAP>,
    command_channel: Option<&'a Channel<CriticalSectionRawMutex, TransportCommand, CMD_CAP>>,
    frame_channel: Option<&'a Channel<CriticalSectionRawMutex, CanFrame, FRAME_CAP>>,
    manager: TransportProtocolManager<'a, ChannelFrameSink<'a, OUT_CAP>, M, K>,
}

impl<
        'a,
        C,
        T,
        K,
        M,
        const PEERS: usize,
        const OUT_CAP: usize,
        const CMD_CAP: usize,
        const FRAME_CAP: usize,
    > TransportSupervisor<'a, C, T, K, M, PEERS, OUT_CAP, CMD_CAP, FRAME_CAP>
where
    C: CanBus,
    C::Error: Debug,
    T: KorriTimer,
    K: KorriClock,
    M: MessageSink,
{
    /// Assemble the supervisor around caller-owned shared state: the node's
    /// own control function, the peer registry, and the channels.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        can_bus: C,
        timer: T,
        clock: K,
        message_sink: M,
        configuration: TransportConfig,
        internal: &'a ControlFunction,
        peers: &'a PeerRegistry<PEERS>,
        out_queue: &'a Channel<CriticalSectionRawMutex, CanFrame, OUT_CAP>,
        command_channel: Option<&'a Channel<CriticalSectionRawMutex, TransportCommand, CMD_CAP>>,
        frame_channel: Option<&'a Channel<CriticalSectionRawMutex, CanFrame, FRAME_CAP>>,
    ) -> Self {
        Self {
            can_bus,
            timer,
            internal,
            peers,
            out_queue,
            command_channel,
            frame_channel,
            manager: TransportProtocolManager::new(
                ChannelFrameSink { queue: out_queue },
                message_sink,
                clock,
                configuration,
            ),
        }
    }

    /// Drive the supervisor loop forever, or until the bus fails.
    pub async fn run(mut self) -> Result<(), TransportSupervisorError<C::Error>> {
        loop {
            // Producer commands first so fresh sessions are served this tick.
            if let Some(commands) = self.command_channel {
                while let Ok(command) = commands.try_receive() {
                    self.handle_command(command);
                }
            }

            // Flush frames queued by the protocol core.
            while let Ok(frame) = self.out_queue.try_receive() {
                self.can_bus
                    .send(&frame)
                    .await
                    .map_err(TransportSupervisorError::Send)?;
            }

            let mut received_frame = None;
            let mut receive_error = None;
            let mut tick = false;

            {
                let receive_future = self.can_bus.recv();
                let delay_future = self.timer.delay_ms(UPDATE_PERIOD_MS);
                pin_mut!(receive_future);
                pin_mut!(delay_future);

                match select(receive_future, delay_future).await {
                    Either::Left((Ok(frame), pending_delay)) => {
                        received_frame = Some(frame);
                        drop(pending_delay);
                    }
                    Either::Left((Err(error), pending_delay)) => {
                        receive_error = Some(error);
                        drop(pending_delay);
                    }
                    Either::Right((_, pending_receive)) => {
                        tick = true;
                        drop(pending_receive);
                    }
                }
            }

            if let Some(error) = receive_error {
                return Err(TransportSupervisorError::Receive(error));
            }
            if let Some(frame) = received_frame {
                self.dispatch_frame(frame);
            }
            if tick {
                self.manager.update();
            }
        }
    }

    fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::SendFrame(frame) => {
                if self.out_queue.try_send(frame).is_err() {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: outbound queue full, dropping frame");
                }
            }
            TransportCommand::SendMessage {
                pgn,
                destination,
                length,
                payload,
                complete_callback,
            } => {
                let internal = self.internal;
                let length = length.min(MAX_TRANSPORT_MESSAGE_LENGTH);
                let resolved = match destination {
                    Some(address) => match self.peers.claim(address) {
                        Some(control_function) => Some(control_function),
                        None => {
                            #[cfg(feature = "defmt")]
                            defmt::warn!(
                                "[TP]: peer registry full, cannot transmit {} to {}",
                                pgn,
                                address
                            );
                            Self::report_failure(pgn, length, internal, None, complete_callback);
                            return;
                        }
                    },
                    None => None,
                };
                if self
                    .manager
                    .protocol_transmit_message(
                        pgn,
                        &payload[..length],
                        internal,
                        resolved,
                        complete_callback,
                    )
                    .is_err()
                {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: transmit request for {} rejected", pgn);
                    Self::report_failure(pgn, length, internal, resolved, complete_callback);
                }
            }
        }
    }

    /// Queued transmissions have no return path for admission errors, so
    /// producers hear about them through the completion callback.
    fn report_failure(
        pgn: u32,
        length: usize,
        source: &ControlFunction,
        destination: Option<&ControlFunction>,
        complete_callback: Option<TransmitCompleteCallback>,
    ) {
        if let Some(callback) = complete_callback {
            callback(&TransmitResult {
                pgn,
                length: length as u16,
                source,
                destination,
                successful: false,
            });
        }
    }

    fn dispatch_frame(&mut self, frame: CanFrame) {
        let pgn = frame.id.pgn();
        if pgn != TRANSPORT_CONNECTION_MANAGEMENT_PGN && pgn != TRANSPORT_DATA_TRANSFER_PGN {
            // Not ours; hand it onward when the application wants it
            if let Some(channel) = self.frame_channel {
                if channel.try_send(frame).is_err() {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("[TP]: application frame queue full, dropping frame");
                }
            }
            return;
        }

        let Some(source) = self.peers.claim(frame.id.source_address()) else {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "[TP]: peer registry full, dropping transport frame from {}",
                frame.id.source_address()
            );
            return;
        };
        let destination = match frame.id.destination() {
            Some(GLOBAL_ADDRESS) | None => None,
            Some(address) => {
                if !self.internal.has_valid_address() || address != self.internal.address() {
                    return; // addressed to another node
                }
                Some(self.internal)
            }
        };

        let message = AddressedFrame {
            frame,
            source,
            destination,
        };
        self.manager.process_message(&message);
    }
}
