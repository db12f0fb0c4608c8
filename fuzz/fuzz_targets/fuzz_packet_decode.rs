//! Fuzz target for packet framing.
//!
//! Decoding arbitrary bytes must never panic, and anything that decodes
//! must re-encode to the same frame.

#![no_main]

use libfuzzer_sys::fuzz_target;
use node_engine::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        let _ = packet.route();
        assert_eq!(packet.encode().unwrap().as_ref(), data);
    }
});
