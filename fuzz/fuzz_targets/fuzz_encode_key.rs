//! Fuzz target for snapshot file name escaping.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_client::failover::disk::encode_key;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;
    let ea = encode_key(a);
    let eb = encode_key(b);

    // Never a path component that escapes the directory
    assert!(!ea.contains('/') && !ea.contains('\\'));
    assert!(ea != "." && ea != "..");

    // Distinct keys map to distinct files
    if a != b {
        assert_ne!(ea, eb);
    }
});
