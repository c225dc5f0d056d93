//! Wire format tests for the connection management frames.
use super::*;

#[test]
/// Request To Send: 23 bytes of PGN 0xFEEB in 4 packets, 16 packet windows.
fn test_request_to_send_round_trip() {
    let command = ConnectionManagement::RequestToSend {
        total_size: 23,
        total_packets: 4,
        packet_limit: 16,
        pgn: 0xFEEB,
    };
    let encoded = command.encode();
    assert_eq!(encoded, [0x10, 0x17, 0x00, 0x04, 0x10, 0xEB, 0xFE, 0x00]);
    assert_eq!(ConnectionManagement::decode(&encoded), Some(command));
}

#[test]
/// Clear To Send: two packets starting at sequence number 3.
fn test_clear_to_send_round_trip() {
    let command = ConnectionManagement::ClearToSend {
        packets_to_send: 2,
        next_packet_number: 3,
        pgn: 0xFEEB,
    };
    let encoded = command.encode();
    assert_eq!(encoded, [0x11, 0x02, 0x03, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]);
    assert_eq!(ConnectionManagement::decode(&encoded), Some(command));
}

#[test]
/// End Of Message Acknowledge echoes size and packet count.
fn test_end_of_message_acknowledge_round_trip() {
    let command = ConnectionManagement::EndOfMessageAcknowledge {
        total_size: 23,
        total_packets: 4,
        pgn: 0xFEEB,
    };
    let encoded = command.encode();
    assert_eq!(encoded, [0x13, 0x17, 0x00, 0x04, 0xFF, 0xEB, 0xFE, 0x00]);
    assert_eq!(ConnectionManagement::decode(&encoded), Some(command));
}

#[test]
/// Broadcast Announce Message: 17 bytes of PGN 0xFEEC in 3 packets.
fn test_broadcast_announce_round_trip() {
    let command = ConnectionManagement::BroadcastAnnounce {
        total_size: 17,
        total_packets: 3,
        pgn: 0xFEEC,
    };
    let encoded = command.encode();
    assert_eq!(encoded, [0x20, 0x11, 0x00, 0x03, 0xFF, 0xEC, 0xFE, 0x00]);
    assert_eq!(ConnectionManagement::decode(&encoded), Some(command));
}

#[test]
/// Abort frames carry the reason code in byte 1 and pad the rest.
fn test_abort_round_trip() {
    let command = ConnectionManagement::Abort {
        reason: ConnectionAbortReason::Timeout,
        pgn: 0xFEEB,
    };
    let encoded = command.encode();
    assert_eq!(encoded, [0xFF, 0x03, 0xFF, 0xFF, 0xFF, 0xEB, 0xFE, 0x00]);
    assert_eq!(ConnectionManagement::decode(&encoded), Some(command));
}

#[test]
/// Reserved multiplexor values must not decode.
fn test_reserved_multiplexor_is_rejected() {
    let data = [0x12, 0x00, 0x00, 0x00, 0xFF, 0xEB, 0xFE, 0x00];
    assert_eq!(ConnectionManagement::decode(&data), None);
}

#[test]
/// The full abort reason table survives a wire round trip; unknown codes
/// collapse to the catch-all.
fn test_abort_reason_codes() {
    let reasons = [
        (ConnectionAbortReason::AlreadyInCMSession, 1),
        (ConnectionAbortReason::SystemResourcesNeededForAnotherTask, 2),
        (ConnectionAbortReason::Timeout, 3),
        (
            ConnectionAbortReason::ClearToSendReceivedWhileTransferInProgress,
            4,
        ),
        (
            ConnectionAbortReason::MaximumRetransmitRequestLimitReached,
            5,
        ),
        (
            ConnectionAbortReason::UnexpectedDataTransferPacketReceived,
            6,
        ),
        (ConnectionAbortReason::BadSequenceNumber, 7),
        (ConnectionAbortReason::DuplicateSequenceNumber, 8),
        (ConnectionAbortReason::AnyOtherError, 250),
    ];
    for (reason, code) in reasons {
        assert_eq!(reason.to_wire(), code);
        assert_eq!(ConnectionAbortReason::from_wire(code), reason);
    }
    assert_eq!(
        ConnectionAbortReason::from_wire(0),
        ConnectionAbortReason::AnyOtherError
    );
    assert_eq!(
        ConnectionAbortReason::from_wire(42),
        ConnectionAbortReason::AnyOtherError
    );
}
