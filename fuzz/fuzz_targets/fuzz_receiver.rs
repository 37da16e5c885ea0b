#![no_main]

use libfuzzer_sys::fuzz_target;

use fountain_transport::receiver::{Receiver, ReceiverConfig};
use fountain_transport::wire::Packet;

/// Fuzz the receiver state machine with arbitrary wire-format bytes.
///
/// This target exercises:
/// - `Packet::decode` feeding directly into `Receiver::intake`
/// - decoder dispatch, extraction, and reassembly across a sequence of
///   packets carved out of one arbitrary byte string
/// - duplicate and obsolete-generation handling
///
/// The receiver must never panic, even on garbage input.
fuzz_target!(|data: &[u8]| {
    let mut rx = Receiver::new(ReceiverConfig {
        k: 8,
        s: 32,
        carry_esi: true,
        intended_len: 30,
    })
    .unwrap();

    // `Packet` framing is not self-delimiting past one PDU (the payload
    // consumes the rest of the buffer), so carve the input into fixed-size
    // chunks first and decode each chunk as an independent packet.
    for chunk in data.chunks(16) {
        let mut buf = chunk;
        if let Some(pkt) = Packet::decode(&mut buf, true) {
            rx.intake(pkt);
        }
    }

    rx.dispatch();
    rx.extract();
    rx.reassemble();
    for _ in rx.drain_outbound_acks() {}

    let mut out = [0u8; 64];
    while let Some(len) = rx.next_delivery_len() {
        if len > out.len() {
            break;
        }
        let n = rx.deliver(&mut out[..len], len);
        if n == 0 {
            break;
        }
    }
});
