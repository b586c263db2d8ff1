//! Lexer for the hogtail log-pattern language
//!
//! Converts source text into a stream of tokens with position tracking.
//! Newlines are significant and come out as [`TokenKind::Nl`]. Whether a `/`
//! starts a regular expression or is a division is decided by the parser,
//! which calls [`Lexer::expect_regex`] before asking for the next token.

use chrono::TimeDelta;
use std::fmt;

/// Position in source code (line and column, both 1-indexed)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl Position {
    pub fn new(line: usize, column: usize, offset: usize) -> Self {
        Position {
            line,
            column,
            offset,
        }
    }

    pub fn start() -> Self {
        Position {
            line: 1,
            column: 1,
            offset: 0,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Span represents a range in source code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Span { start, end }
    }

    pub fn single(pos: Position) -> Self {
        Span {
            start: pos,
            end: pos,
        }
    }

    /// Smallest span covering both `self` and `other`
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::single(Position::start())
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start.line == self.end.line {
            write!(
                f,
                "{}:{}-{}",
                self.start.line, self.start.column, self.end.column
            )
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Token kinds
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Int(i64),
    Float(f64),
    Duration(TimeDelta),
    String(String),
    Regex(String),

    // Names
    Ident(String),
    Builtin(String),
    Capref(usize),
    CaprefNamed(String),
    Decorator(String),

    // Keywords
    As,
    By,
    Const,
    Hidden,
    Def,
    Del,
    Next,
    Otherwise,
    Else,
    Stop,
    Counter,
    Gauge,
    Timer,
    Text,
    Histogram,
    After,
    Buckets,
    Limit,

    // Arithmetic
    Plus,    // +
    Minus,   // -
    Star,    // *
    Slash,   // /  (division, or regex delimiter)
    Percent, // %
    Pow,     // **
    Inc,     // ++
    Dec,     // --

    // Assignment
    Assign,    // =
    AddAssign, // +=

    // Comparison
    Lt,       // <
    Gt,       // >
    LtEq,     // <=
    GtEq,     // >=
    EqEq,     // ==
    NotEq,    // !=
    Match,    // =~
    NotMatch, // !~

    // Logical and bitwise
    And,    // &&
    Or,     // ||
    Not,    // ! or ~
    BitAnd, // &
    BitOr,  // |
    Xor,    // ^
    Shl,    // <<
    Shr,    // >>

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBrace,   // {
    RBrace,   // }
    LBracket, // [
    RBracket, // ]
    Comma,    // ,

    /// Statement-separating newline
    Nl,

    /// Lexical error; carries the diagnostic
    Invalid(String),

    // End of file
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Int(n) => write!(f, "integer '{}'", n),
            TokenKind::Float(n) => write!(f, "float '{}'", n),
            TokenKind::Duration(d) => write!(f, "duration '{}'", d),
            TokenKind::String(s) => write!(f, "string \"{}\"", s),
            TokenKind::Regex(s) => write!(f, "regular expression /{}/", s),
            TokenKind::Ident(s) => write!(f, "identifier '{}'", s),
            TokenKind::Builtin(s) => write!(f, "builtin '{}'", s),
            TokenKind::Capref(n) => write!(f, "capture reference '${}'", n),
            TokenKind::CaprefNamed(s) => write!(f, "capture reference '${}'", s),
            TokenKind::Decorator(s) => write!(f, "decorator '@{}'", s),
            TokenKind::As => write!(f, "'as'"),
            TokenKind::By => write!(f, "'by'"),
            TokenKind::Const => write!(f, "'const'"),
            TokenKind::Hidden => write!(f, "'hidden'"),
            TokenKind::Def => write!(f, "'def'"),
            TokenKind::Del => write!(f, "'del'"),
            TokenKind::Next => write!(f, "'next'"),
            TokenKind::Otherwise => write!(f, "'otherwise'"),
            TokenKind::Else => write!(f, "'else'"),
            TokenKind::Stop => write!(f, "'stop'"),
            TokenKind::Counter => write!(f, "'counter'"),
            TokenKind::Gauge => write!(f, "'gauge'"),
            TokenKind::Timer => write!(f, "'timer'"),
            TokenKind::Text => write!(f, "'text'"),
            TokenKind::Histogram => write!(f, "'histogram'"),
            TokenKind::After => write!(f, "'after'"),
            TokenKind::Buckets => write!(f, "'buckets'"),
            TokenKind::Limit => write!(f, "'limit'"),
            TokenKind::Plus => write!(f, "'+'"),
            TokenKind::Minus => write!(f, "'-'"),
            TokenKind::Star => write!(f, "'*'"),
            TokenKind::Slash => write!(f, "'/'"),
            TokenKind::Percent => write!(f, "'%'"),
            TokenKind::Pow => write!(f, "'**'"),
            TokenKind::Inc => write!(f, "'++'"),
            TokenKind::Dec => write!(f, "'--'"),
            TokenKind::Assign => write!(f, "'='"),
            TokenKind::AddAssign => write!(f, "'+='"),
            TokenKind::Lt => write!(f, "'<'"),
            TokenKind::Gt => write!(f, "'>'"),
            TokenKind::LtEq => write!(f, "'<='"),
            TokenKind::GtEq => write!(f, "'>='"),
            TokenKind::EqEq => write!(f, "'=='"),
            TokenKind::NotEq => write!(f, "'!='"),
            TokenKind::Match => write!(f, "'=~'"),
            TokenKind::NotMatch => write!(f, "'!~'"),
            TokenKind::And => write!(f, "'&&'"),
            TokenKind::Or => write!(f, "'||'"),
            TokenKind::Not => write!(f, "'!'"),
            TokenKind::BitAnd => write!(f, "'&'"),
            TokenKind::BitOr => write!(f, "'|'"),
            TokenKind::Xor => write!(f, "'^'"),
            TokenKind::Shl => write!(f, "'<<'"),
            TokenKind::Shr => write!(f, "'>>'"),
            TokenKind::LParen => write!(f, "'('"),
            TokenKind::RParen => write!(f, "')'"),
            TokenKind::LBrace => write!(f, "'{{'"),
            TokenKind::RBrace => write!(f, "'}}'"),
            TokenKind::LBracket => write!(f, "'['"),
            TokenKind::RBracket => write!(f, "']'"),
            TokenKind::Comma => write!(f, "','"),
            TokenKind::Nl => write!(f, "newline"),
            TokenKind::Invalid(msg) => write!(f, "invalid token ({})", msg),
            TokenKind::Eof => write!(f, "end of file"),
        }
    }
}

/// A token with its kind and source location
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Token { kind, span }
    }
}

/// Names handled by the `Builtin` token
pub const BUILTINS: &[&str] = &[
    "bool",
    "float",
    "getfilename",
    "int",
    "len",
    "settime",
    "string",
    "strptime",
    "strtol",
    "subst",
    "timestamp",
    "tolower",
];

/// The lexer tokenizes program source
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::str::Chars<'a>,
    current: Option<char>,
    position: Position,
    token_start: Position,
    in_regex: bool,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source
    pub fn new(source: &'a str) -> Self {
        let mut chars = source.chars();
        let current = chars.next();
        Lexer {
            source,
            chars,
            current,
            position: Position::start(),
            token_start: Position::start(),
            in_regex: false,
        }
    }

    /// Get the source code (useful for error reporting)
    pub fn source(&self) -> &'a str {
        self.source
    }

    /// Read the next token as the body of a regular expression.
    ///
    /// The flag is cleared once that token has been produced.
    pub fn expect_regex(&mut self) {
        self.in_regex = true;
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Token {
        if self.in_regex {
            self.in_regex = false;
            self.token_start = self.position;
            return self.lex_regex();
        }

        self.skip_whitespace_and_comments();
        self.token_start = self.position;

        match self.current {
            None => self.make_token(TokenKind::Eof),
            Some(ch) => match ch {
                '\n' => self.single_char_token(TokenKind::Nl),
                '(' => self.single_char_token(TokenKind::LParen),
                ')' => self.single_char_token(TokenKind::RParen),
                '{' => self.single_char_token(TokenKind::LBrace),
                '}' => self.single_char_token(TokenKind::RBrace),
                '[' => self.single_char_token(TokenKind::LBracket),
                ']' => self.single_char_token(TokenKind::RBracket),
                ',' => self.single_char_token(TokenKind::Comma),
                '/' => self.single_char_token(TokenKind::Slash),
                '%' => self.single_char_token(TokenKind::Percent),
                '^' => self.single_char_token(TokenKind::Xor),
                '~' => self.single_char_token(TokenKind::Not),

                '+' => {
                    self.advance();
                    match self.current {
                        Some('+') => self.single_char_token(TokenKind::Inc),
                        Some('=') => self.single_char_token(TokenKind::AddAssign),
                        _ => self.make_token(TokenKind::Plus),
                    }
                }

                '-' => match self.peek() {
                    Some('-') => {
                        self.advance();
                        self.single_char_token(TokenKind::Dec)
                    }
                    Some('0'..='9') => self.lex_number(),
                    _ => self.single_char_token(TokenKind::Minus),
                },

                '*' => {
                    self.advance();
                    if self.current == Some('*') {
                        self.single_char_token(TokenKind::Pow)
                    } else {
                        self.make_token(TokenKind::Star)
                    }
                }

                '!' => {
                    self.advance();
                    match self.current {
                        Some('=') => self.single_char_token(TokenKind::NotEq),
                        Some('~') => self.single_char_token(TokenKind::NotMatch),
                        _ => self.make_token(TokenKind::Not),
                    }
                }

                '=' => {
                    self.advance();
                    match self.current {
                        Some('=') => self.single_char_token(TokenKind::EqEq),
                        Some('~') => self.single_char_token(TokenKind::Match),
                        _ => self.make_token(TokenKind::Assign),
                    }
                }

                '<' => {
                    self.advance();
                    match self.current {
                        Some('=') => self.single_char_token(TokenKind::LtEq),
                        Some('<') => self.single_char_token(TokenKind::Shl),
                        _ => self.make_token(TokenKind::Lt),
                    }
                }

                '>' => {
                    self.advance();
                    match self.current {
                        Some('=') => self.single_char_token(TokenKind::GtEq),
                        Some('>') => self.single_char_token(TokenKind::Shr),
                        _ => self.make_token(TokenKind::Gt),
                    }
                }

                '&' => {
                    self.advance();
                    if self.current == Some('&') {
                        self.single_char_token(TokenKind::And)
                    } else {
                        self.make_token(TokenKind::BitAnd)
                    }
                }

                '|' => {
                    self.advance();
                    if self.current == Some('|') {
                        self.single_char_token(TokenKind::Or)
                    } else {
                        self.make_token(TokenKind::BitOr)
                    }
                }

                '$' => self.lex_capref(),
                '@' => self.lex_decorator(),
                '"' => self.lex_string(),

                '0'..='9' => self.lex_number(),
                '.' if matches!(self.peek(), Some('0'..='9')) => self.lex_number(),

                'a'..='z' | 'A'..='Z' | '_' => self.lex_ident(),

                _ => self.unexpected(ch),
            },
        }
    }

    /// Advance to the next character
    fn advance(&mut self) {
        if let Some(ch) = self.current {
            if ch == '\n' {
                self.position.line += 1;
                self.position.column = 1;
            } else {
                self.position.column += 1;
            }
            self.position.offset += ch.len_utf8();
        }
        self.current = self.chars.next();
    }

    /// Peek at the next character without advancing
    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    /// Skip blanks and `#` comments; newlines are tokens and stay put
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current {
                Some(' ') | Some('\t') | Some('\r') => {
                    self.advance();
                }
                Some('#') => {
                    while self.current.is_some() && self.current != Some('\n') {
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Create a token from the current token_start to current position
    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(kind, Span::new(self.token_start, self.position))
    }

    /// Consume a single character and create a token
    fn single_char_token(&mut self, kind: TokenKind) -> Token {
        self.advance();
        self.make_token(kind)
    }

    fn unexpected(&mut self, ch: char) -> Token {
        self.advance();
        self.make_token(TokenKind::Invalid(format!("Unexpected input: '{}'", ch)))
    }

    /// Lex a regular expression body up to, but excluding, the closing `/`
    fn lex_regex(&mut self) -> Token {
        let mut value = String::new();

        loop {
            match self.current {
                None | Some('\n') => {
                    return self.make_token(TokenKind::Invalid(format!(
                        "Unterminated regular expression: \"/{}\"",
                        value
                    )));
                }
                Some('/') => break,
                Some('\\') => {
                    self.advance();
                    match self.current {
                        Some('/') => {
                            value.push('/');
                            self.advance();
                        }
                        Some(ch) if ch != '\n' => {
                            value.push('\\');
                            value.push(ch);
                            self.advance();
                        }
                        _ => value.push('\\'),
                    }
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }

        self.make_token(TokenKind::Regex(value))
    }

    /// Lex a double-quoted string literal
    fn lex_string(&mut self) -> Token {
        self.advance(); // consume opening quote
        let mut value = String::new();

        loop {
            match self.current {
                None | Some('\n') => {
                    return self.make_token(TokenKind::Invalid(format!(
                        "Unterminated quoted string: \"\\\"{}\"",
                        value
                    )));
                }
                Some('"') => {
                    self.advance();
                    break;
                }
                Some('\\') => {
                    self.advance();
                    match self.current {
                        Some('"') => {
                            value.push('"');
                            self.advance();
                        }
                        // Any other escape is kept verbatim.
                        Some(ch) if ch != '\n' => {
                            value.push('\\');
                            value.push(ch);
                            self.advance();
                        }
                        _ => value.push('\\'),
                    }
                }
                Some(ch) => {
                    value.push(ch);
                    self.advance();
                }
            }
        }

        self.make_token(TokenKind::String(value))
    }

    /// Lex an integer, float or duration, with an optional leading minus
    fn lex_number(&mut self) -> Token {
        let mut value = String::new();
        let mut is_float = false;

        if self.current == Some('-') {
            value.push('-');
            self.advance();
        }

        while let Some(ch @ '0'..='9') = self.current {
            value.push(ch);
            self.advance();
        }

        if self.current == Some('.') && matches!(self.peek(), Some('0'..='9')) {
            is_float = true;
            value.push('.');
            self.advance();

            while let Some(ch @ '0'..='9') = self.current {
                value.push(ch);
                self.advance();
            }
        }

        if matches!(self.current, Some('e') | Some('E')) && self.exponent_follows() {
            is_float = true;
            value.push('e');
            self.advance();

            if let Some(sign @ ('+' | '-')) = self.current {
                value.push(sign);
                self.advance();
            }

            while let Some(ch @ '0'..='9') = self.current {
                value.push(ch);
                self.advance();
            }
        } else if matches!(self.current, Some(ch) if ch.is_alphabetic()) {
            return self.lex_duration(value);
        }

        let kind = if is_float {
            match value.parse::<f64>() {
                Ok(num) => TokenKind::Float(num),
                Err(_) => TokenKind::Invalid(format!("Invalid float literal: \"{}\"", value)),
            }
        } else {
            match value.parse::<i64>() {
                Ok(num) => TokenKind::Int(num),
                Err(_) => TokenKind::Invalid(format!("Invalid integer literal: \"{}\"", value)),
            }
        };

        self.make_token(kind)
    }

    /// An `e` continues a number only when digits follow it
    fn exponent_follows(&self) -> bool {
        let mut rest = self.chars.clone();
        match rest.next() {
            Some('0'..='9') => true,
            Some('+') | Some('-') => matches!(rest.next(), Some('0'..='9')),
            _ => false,
        }
    }

    /// Continue a numeric literal that turned out to carry a unit suffix
    fn lex_duration(&mut self, mut value: String) -> Token {
        while let Some(ch) = self.current {
            if ch.is_alphanumeric() || ch == '.' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        let kind = match parse_duration(&value) {
            Some(duration) => TokenKind::Duration(duration),
            None => TokenKind::Invalid(format!("Invalid duration literal: \"{}\"", value)),
        };
        self.make_token(kind)
    }

    fn read_word(&mut self) -> String {
        let mut value = String::new();
        while let Some(ch) = self.current {
            if ch.is_alphanumeric() || ch == '_' {
                value.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        value
    }

    /// Lex an identifier, keyword or builtin name
    fn lex_ident(&mut self) -> Token {
        let value = self.read_word();

        let kind = match value.as_str() {
            "as" => TokenKind::As,
            "by" => TokenKind::By,
            "const" => TokenKind::Const,
            "hidden" => TokenKind::Hidden,
            "def" => TokenKind::Def,
            "del" => TokenKind::Del,
            "next" => TokenKind::Next,
            "otherwise" => TokenKind::Otherwise,
            "else" => TokenKind::Else,
            "stop" => TokenKind::Stop,
            "counter" => TokenKind::Counter,
            "gauge" => TokenKind::Gauge,
            "timer" => TokenKind::Timer,
            "text" => TokenKind::Text,
            "histogram" => TokenKind::Histogram,
            "after" => TokenKind::After,
            "buckets" => TokenKind::Buckets,
            "limit" => TokenKind::Limit,
            name if BUILTINS.contains(&name) => TokenKind::Builtin(value),
            _ => TokenKind::Ident(value),
        };

        self.make_token(kind)
    }

    /// Lex `$1` or `$name`
    fn lex_capref(&mut self) -> Token {
        self.advance(); // consume $

        let value = self.read_word();
        if value.is_empty() {
            return self.make_token(TokenKind::Invalid("Unexpected input: '$'".to_string()));
        }

        let kind = if value.chars().all(|c| c.is_ascii_digit()) {
            match value.parse::<usize>() {
                Ok(n) => TokenKind::Capref(n),
                Err(_) => TokenKind::Invalid(format!("Invalid capture reference: \"${}\"", value)),
            }
        } else {
            TokenKind::CaprefNamed(value)
        };

        self.make_token(kind)
    }

    /// Lex `@name`
    fn lex_decorator(&mut self) -> Token {
        self.advance(); // consume @

        let value = self.read_word();
        if value.is_empty() {
            return self.make_token(TokenKind::Invalid("Unexpected input: '@'".to_string()));
        }
        self.make_token(TokenKind::Decorator(value))
    }
}

/// Parse a duration such as `1h`, `-1.5h`, `250ms` or `24h0m0s`.
///
/// Units are `ns`, `us`, `ms`, `s`, `m`, `h` and `d`.
pub fn parse_duration(text: &str) -> Option<TimeDelta> {
    let (negative, mut rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return None;
        }
        let number: f64 = rest[..number_len].parse().ok()?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos: f64 = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "d" => 86400e9,
            _ => return None,
        };
        rest = &rest[unit_len..];
        total_nanos += number * unit_nanos;
    }

    if negative {
        total_nanos = -total_nanos;
    }
    Some(TimeDelta::nanoseconds(total_nanos.round() as i64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let tok = lexer.next_token();
            let is_eof = tok.kind == TokenKind::Eof;
            tokens.push(tok);
            if is_eof {
                break;
            }
        }
        tokens
    }

    fn kinds(tokens: &[Token]) -> Vec<TokenKind> {
        tokens.iter().map(|t| t.kind.clone()).collect()
    }

    fn ident(name: &str) -> TokenKind {
        TokenKind::Ident(name.to_string())
    }

    #[test]
    fn test_empty() {
        let tokens = lex_all("");
        assert_eq!(kinds(&tokens), vec![TokenKind::Eof]);
    }

    #[test]
    fn test_newlines_are_tokens() {
        let tokens = lex_all("  \t\n\r\n  ");
        assert_eq!(
            kinds(&tokens),
            vec![TokenKind::Nl, TokenKind::Nl, TokenKind::Eof]
        );
    }

    #[test]
    fn test_single_char_tokens() {
        let tokens = lex_all("(){}[],");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::LParen,
                TokenKind::RParen,
                TokenKind::LBrace,
                TokenKind::RBrace,
                TokenKind::LBracket,
                TokenKind::RBracket,
                TokenKind::Comma,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_operators() {
        let tokens =
            lex_all("- + = ++ += < > <= >= == != * / << >> & | ^ ~ ** % || && =~ !~ -- !");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Assign,
                TokenKind::Inc,
                TokenKind::AddAssign,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::LtEq,
                TokenKind::GtEq,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Shl,
                TokenKind::Shr,
                TokenKind::BitAnd,
                TokenKind::BitOr,
                TokenKind::Xor,
                TokenKind::Not,
                TokenKind::Pow,
                TokenKind::Percent,
                TokenKind::Or,
                TokenKind::And,
                TokenKind::Match,
                TokenKind::NotMatch,
                TokenKind::Dec,
                TokenKind::Not,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_keywords() {
        let tokens = lex_all(
            "counter gauge timer text histogram as by hidden def next const \
             otherwise else del after stop buckets limit",
        );
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Counter,
                TokenKind::Gauge,
                TokenKind::Timer,
                TokenKind::Text,
                TokenKind::Histogram,
                TokenKind::As,
                TokenKind::By,
                TokenKind::Hidden,
                TokenKind::Def,
                TokenKind::Next,
                TokenKind::Const,
                TokenKind::Otherwise,
                TokenKind::Else,
                TokenKind::Del,
                TokenKind::After,
                TokenKind::Stop,
                TokenKind::Buckets,
                TokenKind::Limit,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_builtins() {
        let tokens = lex_all("strptime timestamp tolower len strtol settime getfilename subst");
        let names: Vec<String> = tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Builtin(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            names,
            vec![
                "strptime",
                "timestamp",
                "tolower",
                "len",
                "strtol",
                "settime",
                "getfilename",
                "subst"
            ]
        );
    }

    #[test]
    fn test_identifiers() {
        let tokens = lex_all("foo bar_total _baz test123");
        assert_eq!(
            kinds(&tokens),
            vec![
                ident("foo"),
                ident("bar_total"),
                ident("_baz"),
                ident("test123"),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_integers() {
        let tokens = lex_all("0 42 -1 999");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Int(0),
                TokenKind::Int(42),
                TokenKind::Int(-1),
                TokenKind::Int(999),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_floats() {
        let tokens = lex_all("3.15 -1.0 .11 1e3 1e-3 123.456e7");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Float(3.15),
                TokenKind::Float(-1.0),
                TokenKind::Float(0.11),
                TokenKind::Float(1e3),
                TokenKind::Float(1e-3),
                TokenKind::Float(123.456e7),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_float_followed_by_float() {
        let tokens = lex_all("1.61.1");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Float(1.61),
                TokenKind::Float(0.1),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_durations() {
        let tokens = lex_all("1h 0d 3d -1.5h 15m 24h0m0s 250ms");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Duration(TimeDelta::hours(1)),
                TokenKind::Duration(TimeDelta::zero()),
                TokenKind::Duration(TimeDelta::days(3)),
                TokenKind::Duration(TimeDelta::minutes(-90)),
                TokenKind::Duration(TimeDelta::minutes(15)),
                TokenKind::Duration(TimeDelta::hours(24)),
                TokenKind::Duration(TimeDelta::milliseconds(250)),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_bad_duration() {
        let tokens = lex_all("3x");
        assert!(matches!(
            &tokens[0].kind,
            TokenKind::Invalid(msg) if msg.contains("3x")
        ));
    }

    #[test]
    fn test_strings() {
        let tokens = lex_all(r#""hello" "quote\"inside" "\d+""#);
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::String("hello".to_string()),
                TokenKind::String("quote\"inside".to_string()),
                TokenKind::String("\\d+".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_unterminated_string() {
        let tokens = lex_all("\"foo");
        assert_eq!(
            tokens[0].kind,
            TokenKind::Invalid("Unterminated quoted string: \"\\\"foo\"".to_string())
        );
    }

    #[test]
    fn test_regex_mode() {
        let mut lexer = Lexer::new("/foo\\d\\/ bar/ {");
        assert_eq!(lexer.next_token().kind, TokenKind::Slash);
        lexer.expect_regex();
        assert_eq!(
            lexer.next_token().kind,
            TokenKind::Regex("foo\\d/ bar".to_string())
        );
        assert_eq!(lexer.next_token().kind, TokenKind::Slash);
        assert_eq!(lexer.next_token().kind, TokenKind::LBrace);
    }

    #[test]
    fn test_regex_keeps_leading_space() {
        let mut lexer = Lexer::new("/ x/");
        lexer.next_token();
        lexer.expect_regex();
        assert_eq!(lexer.next_token().kind, TokenKind::Regex(" x".to_string()));
    }

    #[test]
    fn test_unterminated_regex() {
        let mut lexer = Lexer::new("/foo\n");
        lexer.next_token();
        lexer.expect_regex();
        assert_eq!(
            lexer.next_token().kind,
            TokenKind::Invalid("Unterminated regular expression: \"/foo\"".to_string())
        );
    }

    #[test]
    fn test_slash_without_regex_mode_is_division() {
        let tokens = lex_all("a / 2");
        assert_eq!(
            kinds(&tokens),
            vec![ident("a"), TokenKind::Slash, TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn test_caprefs_and_decorators() {
        let tokens = lex_all("$1 $foo @syslog");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Capref(1),
                TokenKind::CaprefNamed("foo".to_string()),
                TokenKind::Decorator("syslog".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_line_comment() {
        let tokens = lex_all("foo # this is a comment\nbar");
        assert_eq!(
            kinds(&tokens),
            vec![ident("foo"), TokenKind::Nl, ident("bar"), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unexpected_input() {
        let tokens = lex_all("?");
        assert_eq!(
            tokens[0].kind,
            TokenKind::Invalid("Unexpected input: '?'".to_string())
        );
    }

    #[test]
    fn test_position_tracking() {
        let mut lexer = Lexer::new("foo\n  bar");

        let tok1 = lexer.next_token();
        assert_eq!(tok1.kind, ident("foo"));
        assert_eq!(tok1.span.start.line, 1);
        assert_eq!(tok1.span.start.column, 1);

        assert_eq!(lexer.next_token().kind, TokenKind::Nl);

        let tok2 = lexer.next_token();
        assert_eq!(tok2.kind, ident("bar"));
        assert_eq!(tok2.span.start.line, 2);
        assert_eq!(tok2.span.start.column, 3);
    }

    #[test]
    fn test_declaration() {
        let tokens = lex_all("counter foo by a, b as \"bar\"");
        assert_eq!(
            kinds(&tokens),
            vec![
                TokenKind::Counter,
                ident("foo"),
                TokenKind::By,
                ident("a"),
                TokenKind::Comma,
                ident("b"),
                TokenKind::As,
                TokenKind::String("bar".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1h30m"), Some(TimeDelta::minutes(90)));
        assert_eq!(parse_duration("1.5s"), Some(TimeDelta::milliseconds(1500)));
        assert_eq!(parse_duration("h"), None);
        assert_eq!(parse_duration("5y"), None);
        assert_eq!(parse_duration(""), None);
    }
}
