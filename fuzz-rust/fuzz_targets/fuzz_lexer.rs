#![no_main]

use hogtail::parser::{Lexer, TokenKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(source) = std::str::from_utf8(data) {
        let mut lexer = Lexer::new(source);
        let mut count = 0;
        loop {
            let token = lexer.next_token();
            count += 1;
            if token.kind == TokenKind::Eof {
                break;
            }
            // Prevent infinite loops on malformed input
            assert!(count <= 100000, "lexer stopped making progress");
        }
    }
});
