#![no_main]

use coinage_core::amount::AMOUNT_BYTES;
use coinage_core::Amount;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Text form: anything that parses must print back to the same amount
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(amount) = text.parse::<Amount>() {
            let printed = amount.to_string();
            let reparsed: Amount = printed.parse().expect("printed amount must parse");
            assert_eq!(amount, reparsed);
        }
    }

    // Binary form
    if data.len() >= AMOUNT_BYTES {
        let mut bytes = [0u8; AMOUNT_BYTES];
        bytes.copy_from_slice(&data[..AMOUNT_BYTES]);
        if let Ok(amount) = Amount::from_bytes(&bytes) {
            assert_eq!(amount.to_bytes(), bytes);
        }
    }
});
