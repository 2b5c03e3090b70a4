#![no_main]

use bytes::Bytes;
use framegate::{MessageCodec, TaggedCodec};
use libfuzzer_sys::fuzz_target;

// Decoding arbitrary frame payloads must never panic, and anything that
// decodes must encode back to the original bytes.
fuzz_target!(|data: &[u8]| {
    let frame = Bytes::copy_from_slice(data);
    if let Ok(message) = TaggedCodec.decode(frame) {
        assert_eq!(TaggedCodec.encode(&message), Bytes::copy_from_slice(data));
    }
});
