#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let limits = pq_explorer::DataMashupLimits {
        max_inner_entries: 256,
        max_inner_part_bytes: 256 * 1024,
        max_inner_total_bytes: 2 * 1024 * 1024,
    };

    if let Ok(raw) = pq_explorer::parse_data_mashup(data) {
        let _ = pq_explorer::build_data_mashup(&raw, limits);
    }
    let _ = pq_explorer::parse_package_parts_with_limits(data, limits);
});
