#![no_main]

use libfuzzer_sys::fuzz_target;
use shardex::server::ShardName;

fuzz_target!(|data: &str| {
    let parsed = ShardName::parse(data);
    // The logical name is always a prefix of the file name
    assert!(data.starts_with(&parsed.name));
});
