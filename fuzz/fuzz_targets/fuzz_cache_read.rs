#![no_main]

use capture_prep::Cache;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Cache::from_be_bytes(data);
});
