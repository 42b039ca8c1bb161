//! Fuzz target for snapshot file parsing.
//!
//! Snapshot files live on disk where anything can end up in them. Parsing
//! must reject, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use registry_client::failover::disk::{parse_snapshot, parse_switch};

fuzz_target!(|data: &[u8]| {
    if let Ok((_tenant, entry)) = parse_snapshot(data) {
        // A file that parses has a payload of the kind it claims
        assert!(entry.as_service().is_some() || entry.as_config().is_some());
    }

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = parse_switch(text);
    }
});
