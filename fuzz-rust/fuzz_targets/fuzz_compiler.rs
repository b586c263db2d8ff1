#![no_main]

use hogtail::parser::{self, CompileOptions};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        if source.len() > 10000 {
            return;
        }

        let options = CompileOptions::default();
        if let Ok(object) = parser::compile("fuzz.mtail", source, &options) {
            // Property: compiled objects are internally consistent
            object.validate().expect("compiler produced an invalid object");

            // Property: compilation is deterministic
            let again = parser::compile("fuzz.mtail", source, &options).expect("second compile failed");
            assert_eq!(object.to_proto_bytes(), again.to_proto_bytes());
        }
    }
});
