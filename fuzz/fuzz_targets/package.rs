#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 1_000_000 {
        return;
    }
    let config = pq_explorer::ExtractConfig::default();
    let _ = pq_explorer::process_file("fuzz.pbix", data, &config);
    let _ = pq_explorer::process_file("fuzz.xlsx", data, &config);
});
