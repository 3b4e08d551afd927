//! Fuzz testing for protocol parsing functions.
//!
//! Exercises the config-line parsing surface against arbitrary input,
//! ensuring that:
//!
//! - `categorize`/`extract_endpoint`/`semantic_hash` never panic on any input
//! - `sanitize_host_port` always rejects malformed or unsafe host/port pairs
//!   rather than propagating them downstream
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_protocol
//! cargo +nightly fuzz run fuzz_protocol -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use vpn_merger::protocol::{categorize, extract_endpoint, is_valid_config, sanitize_host_port, semantic_hash};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = categorize(s);
        let _ = is_valid_config(s);
        let _ = extract_endpoint(s);
        let _ = semantic_hash(s);

        if let Some((host, port)) = s.split_once('\u{0}') {
            let _ = sanitize_host_port(host, Some(port));
        } else {
            let _ = sanitize_host_port(s, None);
        }
    }
});
