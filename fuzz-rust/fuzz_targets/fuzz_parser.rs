#![no_main]

use hogtail::parser;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        // Skip very large inputs to avoid timeouts
        if source.len() > 10000 {
            return;
        }

        // May fail with an error list, but must never panic
        if let Err(errors) = parser::parse("fuzz.mtail", source) {
            assert!(!errors.is_empty(), "failed parse with no errors");
            assert!(errors.len() <= 10, "error cap exceeded");
        }
    }
});
