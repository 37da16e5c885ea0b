#![no_main]

use libfuzzer_sys::fuzz_target;

use fountain_transport::wire::{Ack, Packet};

/// Fuzz the data-plane decode paths.
///
/// `Packet::decode`/`Ack::decode` must never panic on arbitrary input,
/// regardless of the `carry_esi` variant assumed; malformed or truncated
/// bytes return `None`.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    let _ = Packet::decode(&mut buf, true);

    let mut buf = data;
    let _ = Packet::decode(&mut buf, false);

    let mut buf = data;
    let _ = Ack::decode(&mut buf, true);

    let mut buf = data;
    let _ = Ack::decode(&mut buf, false);
});
