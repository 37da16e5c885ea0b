#![no_main]

use libfuzzer_sys::fuzz_target;

use fountain_transport::wire::Datagram;

/// Fuzz the tagged [`Datagram`] decode path, which dispatches on a leading
/// byte to either `Packet` or `Ack`.
///
/// The parser must never panic on any input — only return `None` for
/// invalid data. A successful decode is re-encoded and must decode back to
/// an identical value.
fuzz_target!(|data: &[u8]| {
    let mut buf = data;
    if let Some(datagram) = Datagram::decode(&mut buf, true) {
        let encoded = datagram.encode().freeze();
        let mut reread = encoded;
        let re_decoded = Datagram::decode(&mut reread, true);
        assert_eq!(re_decoded, Some(datagram), "re-encode/decode must round-trip");
    }

    let mut buf = data;
    let _ = Datagram::decode(&mut buf, false);
});
