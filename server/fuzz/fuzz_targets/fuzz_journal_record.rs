#![no_main]

use libfuzzer_sys::fuzz_target;
use parley_server::journal::Record;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Parsing must never panic, and any record that parses must
        // survive a render/parse round trip.
        if let Ok(Some(record)) = Record::parse(line) {
            let rendered = record.render();
            let reparsed = Record::parse(&rendered).unwrap().unwrap();
            assert_eq!(reparsed, record);
        }
    }
});
