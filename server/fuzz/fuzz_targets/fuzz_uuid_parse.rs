#![no_main]

use std::str::FromStr;

use libfuzzer_sys::fuzz_target;
use parley_server::uid::Uuid;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(id) = Uuid::from_str(text) {
            let roundtrip = Uuid::from_str(&id.to_string()).unwrap();
            assert_eq!(roundtrip, id);
        }
    }
});
