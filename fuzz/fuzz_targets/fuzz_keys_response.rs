#![no_main]

use coinage_client::KeySet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary JSON must be rejected cleanly, never crash the merge
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        let empty = KeySet::default();
        let _ = empty.merge(&value, true);
        if let Ok(merged) = empty.merge(&value, false) {
            let _ = merged.to_cache();
        }
    }
});
