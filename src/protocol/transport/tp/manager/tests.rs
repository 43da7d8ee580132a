//! Routing, scheduling and expiry tests on synthetic time.
extern crate std;

use super::*;
use crate::error::ResourceError;
use crate::protocol::transport::can_id::CanId;
use crate::protocol::transport::tp::config::CtsPolicy;
use crate::protocol::transport::tp::session::SessionState;
use embassy_time::Duration;

const PGN: u32 = 0x00FECA;
const A: u8 = 0x10;
const B: u8 = 0x20;

fn at(ms: u64) -> Instant {
    Instant::from_millis(ms)
}

fn cm(src: u8, dst: u8, message: ControlMessage, pgn: u32) -> CanFrame {
    let id = CanId::builder(PGN_TP_CM, src)
        .to_destination(dst)
        .build()
        .unwrap();
    CanFrame::new(id, message.encode(pgn))
}

fn dt(src: u8, dst: u8, data: [u8; 8]) -> CanFrame {
    let id = CanId::builder(PGN_TP_DT, src)
        .to_destination(dst)
        .build()
        .unwrap();
    CanFrame::new(id, data)
}

fn decode(frame: &CanFrame) -> ControlMessage {
    assert_eq!(frame.id.pgn(), PGN_TP_CM);
    let (message, pgn) = ControlMessage::decode(&frame.data).unwrap();
    assert_eq!(pgn, PGN);
    message
}

/// Write every due frame of `manager` at `now`, returning the frames in order
/// and the terminal events.
fn flush<const N: usize>(
    manager: &mut TpManager<N>,
    now: Instant,
) -> (std::vec::Vec<CanFrame>, std::vec::Vec<TpEvent>) {
    let mut frames = std::vec::Vec::new();
    let mut events = std::vec::Vec::new();
    while let Some(Transmit { key, frame }) = manager.next_transmit(now) {
        frames.push(frame);
        events.extend(manager.on_transmitted(&key, now));
    }
    (frames, events)
}

//==================================================================================SENDER
#[test]
/// Reference sender, 20 bytes: RTS(20, 3), DT1..DT3, EOM_ACK, then Sent.
fn test_twenty_byte_ignore_cts_send() {
    let config = TpConfig::default().with_cts_policy(CtsPolicy::Ignore);
    let mut manager = TpManager::<4>::new(config).unwrap();
    let payload: [u8; 20] = core::array::from_fn(|i| 0xA0 + i as u8);
    let key = manager
        .start_send::<()>(PGN, 6, A, B, &payload, at(0))
        .unwrap();

    let (frames, events) = flush(&mut manager, at(0));
    assert_eq!(frames.len(), 5);
    assert_eq!(
        decode(&frames[0]),
        ControlMessage::Rts {
            total_len: 20,
            num_packets: 3,
            max_packets_per_cts: 0xFF
        }
    );
    assert_eq!(frames[0].data, [0x10, 20, 0, 3, 0xFF, 0xCA, 0xFE, 0x00]);
    assert_eq!(frames[0].id.priority(), 6);
    for (i, frame) in frames[1..4].iter().enumerate() {
        assert_eq!(frame.id.pgn(), PGN_TP_DT);
        assert_eq!(frame.id.destination(), Some(B));
        assert_eq!(frame.id.source_address(), A);
        assert_eq!(frame.data[0], i as u8 + 1);
    }
    assert_eq!(
        frames[3].data,
        [3, 0xAE, 0xAF, 0xB0, 0xB1, 0xB2, 0xB3, 0xFF]
    );
    assert_eq!(
        decode(&frames[4]),
        ControlMessage::EndOfMsgAck {
            total_len: 20,
            num_packets: 3
        }
    );
    assert_eq!(events, [TpEvent::Sent { key, pgn: PGN }]);
    assert!(manager.sessions().is_empty());
}

#[test]
/// 50-byte broadcast: BAM(8) then eight paced packets to 0xFF.
fn test_fifty_byte_bam() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let payload = [0x42u8; 50];
    manager
        .start_send::<()>(PGN, 6, A, ADDRESS_GLOBAL, &payload, at(0))
        .unwrap();

    let (frames, events) = flush(&mut manager, at(0));
    assert_eq!(frames.len(), 1);
    assert!(events.is_empty());
    assert_eq!(
        decode(&frames[0]),
        ControlMessage::Bam {
            total_len: 50,
            num_packets: 8
        }
    );
    assert_eq!(frames[0].id.destination(), Some(ADDRESS_GLOBAL));
    assert_eq!(manager.next_wake(), Some(at(50)));

    let mut all_events = std::vec::Vec::new();
    for seq in 1..=8u64 {
        let now = at(seq * 50);
        assert!(manager.next_transmit(now - Duration::from_millis(1)).is_none());
        let (frames, events) = flush(&mut manager, now);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id.pgn(), PGN_TP_DT);
        assert_eq!(frames[0].id.destination(), Some(ADDRESS_GLOBAL));
        assert_eq!(frames[0].data[0], seq as u8);
        all_events.extend(events);
    }
    assert!(matches!(all_events.as_slice(), [TpEvent::Sent { .. }]));
    assert!(manager.sessions().is_empty());
}

#[test]
/// Payloads outside 9..=1785 bytes are refused before any session exists.
fn test_start_send_invalid_length() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    assert_eq!(
        manager.start_send::<()>(PGN, 6, A, B, &[0; 8], at(0)),
        Err(TpError::InvalidLength { len: 8 })
    );
    assert_eq!(
        manager.start_send::<()>(PGN, 6, A, B, &[0; 1786], at(0)),
        Err(TpError::InvalidLength { len: 1786 })
    );
    manager.start_send::<()>(PGN, 6, A, B, &[0; 9], at(0)).unwrap();
    assert_eq!(
        manager.start_send::<()>(PGN, 6, A, B, &[0; 9], at(0)),
        Err(TpError::Resource(ResourceError::Busy))
    );
}

#[test]
/// A CTS naming another PGN does not drive the sender.
fn test_cts_for_other_pgn_ignored() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    manager
        .start_send::<()>(PGN, 6, A, B, &[1; 20], at(0))
        .unwrap();
    flush(&mut manager, at(0));
    let cts = ControlMessage::Cts {
        num_packets: 3,
        next_packet: 1,
    };
    manager.process_frame(&cm(B, A, cts, 0x00FECB), at(1));
    assert!(manager.next_transmit(at(1)).is_none());
    manager.process_frame(&cm(B, A, cts, PGN), at(1));
    assert!(manager.next_transmit(at(1)).is_some());
}

//==================================================================================END_TO_END
#[test]
/// Two managers exchange a windowed connection-mode transfer.
fn test_connection_transfer_between_managers() {
    let mut sender = TpManager::<4>::new(TpConfig::default()).unwrap();
    let mut receiver = TpManager::<4>::new(TpConfig {
        receive_window: 4,
        ..TpConfig::default()
    })
    .unwrap();
    let payload: [u8; 100] = core::array::from_fn(|i| (i * 7) as u8);
    sender
        .start_send::<()>(PGN, 3, A, B, &payload, at(0))
        .unwrap();

    let mut now = 0;
    let mut sender_events = std::vec::Vec::new();
    let mut receiver_events = std::vec::Vec::new();
    let mut cts_count = 0;
    while !sender.sessions().is_empty() {
        now += 1;
        assert!(now < 100, "transfer stalled");
        let (frames, events) = flush(&mut sender, at(now));
        sender_events.extend(events);
        for frame in frames {
            let dispatch = receiver.process_frame(&frame, at(now));
            receiver_events.extend(dispatch.events);
            if let Some(reply) = dispatch.reply {
                if let ControlMessage::Cts { .. } = decode(&reply) {
                    cts_count += 1;
                }
                let back = sender.process_frame(&reply, at(now));
                assert!(back.reply.is_none());
                sender_events.extend(back.events);
            }
        }
    }

    assert_eq!(cts_count, 4); // 15 packets in windows of four
    assert!(matches!(sender_events.as_slice(), [TpEvent::Sent { .. }]));
    match receiver_events.as_slice() {
        [TpEvent::Received(message)] => {
            assert_eq!(message.pgn, PGN);
            assert_eq!(message.priority, 3);
            assert_eq!(message.source, A);
            assert_eq!(message.destination, B);
            assert_eq!(&message.data[..], &payload[..]);
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert!(receiver.sessions().is_empty());
}

//==================================================================================RECEIVER
fn rts(len: u16, packets: u8) -> CanFrame {
    cm(
        A,
        B,
        ControlMessage::Rts {
            total_len: len,
            num_packets: packets,
            max_packets_per_cts: 0xFF,
        },
        PGN,
    )
}

#[test]
/// A second RTS for an active pair is answered BUSY and the session survives.
fn test_busy_rejection() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let first = manager.process_frame(&rts(20, 3), at(0));
    assert_eq!(
        decode(&first.reply.unwrap()),
        ControlMessage::Cts {
            num_packets: 3,
            next_packet: 1
        }
    );
    let second = manager.process_frame(&rts(30, 5), at(1));
    let reply = second.reply.unwrap();
    assert_eq!(decode(&reply), ControlMessage::Abort(AbortReason::Busy));
    assert_eq!(reply.id.source_address(), B);
    assert_eq!(reply.id.destination(), Some(A));
    assert!(second.events.is_empty());

    let session = manager.sessions().get(&SessionKey::receiver(A, B)).unwrap();
    assert_eq!(session.total_len(), 20);
    assert_eq!(
        session.state(),
        SessionState::CtsSent {
            next_seq: 1,
            window_end: 3
        }
    );
}

#[test]
/// A full table answers Resources; an oversized RTS answers MessageTooLarge.
fn test_resource_rejections() {
    let mut manager = TpManager::<1>::new(TpConfig::default()).unwrap();
    manager.process_frame(&rts(20, 3), at(0));

    let other = cm(
        0x33,
        B,
        ControlMessage::Rts {
            total_len: 20,
            num_packets: 3,
            max_packets_per_cts: 0xFF,
        },
        PGN,
    );
    let reply = manager.process_frame(&other, at(1)).reply.unwrap();
    assert_eq!(decode(&reply), ControlMessage::Abort(AbortReason::Resources));
    assert_eq!(reply.id.destination(), Some(0x33));

    let mut manager = TpManager::<1>::new(TpConfig::default()).unwrap();
    let reply = manager.process_frame(&rts(1786, 255), at(0)).reply.unwrap();
    assert_eq!(
        decode(&reply),
        ControlMessage::Abort(AbortReason::MessageTooLarge)
    );
    assert!(manager.sessions().is_empty());
}

#[test]
/// An announce whose packet count does not match its length is dropped.
fn test_inconsistent_rts_ignored() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    assert_eq!(manager.process_frame(&rts(20, 4), at(0)), Dispatch::default());
    assert_eq!(manager.process_frame(&rts(8, 2), at(0)), Dispatch::default());
    assert!(manager.sessions().is_empty());
}

#[test]
/// Expiry aborts once, removes the session, and later packets go nowhere.
fn test_timeout_removes_session() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    manager.process_frame(&rts(20, 3), at(0));
    assert_eq!(manager.next_wake(), Some(at(1250)));
    assert_eq!(manager.expire(at(1249)), Dispatch::default());

    let dispatch = manager.expire(at(1250));
    assert_eq!(
        decode(&dispatch.reply.unwrap()),
        ControlMessage::Abort(AbortReason::Timeout)
    );
    assert_eq!(
        dispatch.events.as_slice(),
        [TpEvent::Aborted {
            key: SessionKey::receiver(A, B),
            pgn: PGN,
            cause: AbortCause::Timeout
        }]
    );
    assert!(manager.sessions().is_empty());
    assert_eq!(manager.expire(at(5000)), Dispatch::default());

    let late = dt(A, B, [1, 0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(manager.process_frame(&late, at(1300)), Dispatch::default());
}

#[test]
/// A peer Abort mid-transfer ends the sender at once.
fn test_peer_abort_mid_transfer() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let key = manager
        .start_send::<()>(PGN, 6, A, B, &[9; 100], at(0))
        .unwrap();
    flush(&mut manager, at(0));
    manager.process_frame(
        &cm(
            B,
            A,
            ControlMessage::Cts {
                num_packets: 4,
                next_packet: 1,
            },
            PGN,
        ),
        at(1),
    );
    let transmit = manager.next_transmit(at(1)).unwrap();
    manager.on_transmitted(&transmit.key, at(1));

    let dispatch = manager.process_frame(
        &cm(B, A, ControlMessage::Abort(AbortReason::Resources), PGN),
        at(2),
    );
    assert!(dispatch.reply.is_none());
    assert_eq!(
        dispatch.events.as_slice(),
        [TpEvent::Aborted {
            key,
            pgn: PGN,
            cause: AbortCause::Peer(AbortReason::Resources)
        }]
    );
    assert!(manager.next_transmit(at(2)).is_none());
}

#[test]
/// BAM from a peer is reassembled silently, and errors never produce frames.
fn test_broadcast_receive() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let payload: [u8; 12] = core::array::from_fn(|i| i as u8);
    let bam = cm(
        A,
        ADDRESS_GLOBAL,
        ControlMessage::Bam {
            total_len: 12,
            num_packets: 2,
        },
        PGN,
    );
    assert!(manager.process_frame(&bam, at(0)).reply.is_none());
    assert!(manager.process_frame(&bam, at(1)).reply.is_none());

    let segment = crate::protocol::transport::tp::dt::segment;
    manager.process_frame(&dt(A, ADDRESS_GLOBAL, segment(&payload, 1).unwrap()), at(50));
    let dispatch =
        manager.process_frame(&dt(A, ADDRESS_GLOBAL, segment(&payload, 2).unwrap()), at(100));
    assert!(dispatch.reply.is_none());
    match dispatch.events.as_slice() {
        [TpEvent::Received(message)] => {
            assert_eq!(message.destination, ADDRESS_GLOBAL);
            assert_eq!(&message.data[..], &payload[..]);
        }
        other => panic!("unexpected events {other:?}"),
    }
}

#[test]
/// Local cancel notifies a connection-mode peer and reports the cause.
fn test_local_abort() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    manager.process_frame(&rts(20, 3), at(0));
    let key = SessionKey::receiver(A, B);
    let dispatch = manager.abort(&key, AbortReason::Resources, at(5));
    assert_eq!(
        decode(&dispatch.reply.unwrap()),
        ControlMessage::Abort(AbortReason::Resources)
    );
    assert_eq!(
        dispatch.events.as_slice(),
        [TpEvent::Aborted {
            key,
            pgn: PGN,
            cause: AbortCause::Cancelled(AbortReason::Resources)
        }]
    );
    assert_eq!(
        manager.abort(&key, AbortReason::Resources, at(6)),
        Dispatch::default()
    );
}

#[test]
/// A malformed control frame is dropped.
fn test_malformed_control_ignored() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let mut frame = rts(20, 3);
    frame.data[0] = 0x42;
    assert_eq!(manager.process_frame(&frame, at(0)), Dispatch::default());
    assert!(manager.sessions().is_empty());
}

#[test]
/// A failed write drops the sender without a reply.
fn test_transmit_failure_drops_session() {
    let mut manager = TpManager::<4>::new(TpConfig::default()).unwrap();
    let key = manager
        .start_send::<()>(PGN, 6, A, B, &[0; 20], at(0))
        .unwrap();
    let transmit = manager.next_transmit(at(0)).unwrap();
    assert_eq!(transmit.key, key);
    assert!(manager.on_transmit_failed(&key).is_some());
    assert!(manager.next_transmit(at(0)).is_none());
}

#[test]
/// An invalid configuration is refused.
fn test_invalid_config() {
    let config = TpConfig {
        bam_inter_packet_delay: Duration::from_millis(10),
        ..TpConfig::default()
    };
    assert!(matches!(
        TpManager::<4>::new(config),
        Err(ConfigError::BamDelayOutOfRange { millis: 10 })
    ));
}
