//! Fuzz target for operation decoding.
//!
//! Tests that `JsonCodec::decode` never panics on arbitrary input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use node_engine::{JsonCodec, OperationCodec};

fuzz_target!(|data: &[u8]| {
    if let Ok(op) = JsonCodec.decode(data) {
        let _ = op.wait_timeout();
        let _ = JsonCodec.encode(&op);
    }
});
