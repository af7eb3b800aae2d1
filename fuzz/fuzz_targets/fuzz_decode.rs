#![no_main]

use capture_prep::decode::decode_frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    decode_frame(data);
});
