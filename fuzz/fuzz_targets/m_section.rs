#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let analysis = pq_explorer::parse_section(text, "fuzz.pbix");
    for query in &analysis.queries {
        assert!(query.body.end <= text.len());
        assert!(!query.depends_on.contains(&query.name));
    }
});
