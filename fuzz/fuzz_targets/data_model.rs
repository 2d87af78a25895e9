#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }
    let _ = pq_explorer::decode_data_model(data, 16 * 1024 * 1024);
});
