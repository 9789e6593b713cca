#![no_main]
use core_codec as codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Both decoders must return a defined error on garbage, never panic.
    if let Ok((value, consumed)) = codec::decode_varlen_u14(data) {
        assert!(value <= 0x3FFF);
        assert!(consumed <= 2);
    }
    if let Ok((body, consumed)) = codec::decode_frame(data) {
        assert!(consumed <= data.len());
        assert!(body.len() <= codec::MAX_AEAD_PAYLOAD);
    }
});
