#![no_main]

use hogtail::executor::{Executor, ExecutorOptions};
use hogtail::parser::{self, CompileOptions};
use hogtail::{LogLine, Store};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

fuzz_target!(|data: &[u8]| {
    // program source, a blank line, then log lines
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if text.len() > 10000 {
        return;
    }
    let (source, log) = text.split_once("\n\n").unwrap_or((text, ""));

    let Ok(object) = parser::compile("fuzz.mtail", source, &CompileOptions::default()) else {
        return;
    };
    let store = Store::new();
    let Ok(executor) = Executor::new(Arc::new(object), &store, ExecutorOptions::default()) else {
        return;
    };
    for line in log.lines() {
        // runtime errors are fine, panics are not
        let _ = executor.execute(&LogLine::new("fuzz.log", line));
    }
});
