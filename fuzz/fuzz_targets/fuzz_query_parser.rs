#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parsing must never panic; a parsed query must validate or be rejected
    // cleanly and render through Display
    if let Ok(q) = shardex::query::parse_query(data) {
        let _ = q.validate();
        let _ = q.to_string();
    }
});
