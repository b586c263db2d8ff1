//! Compile-time diagnostics
//!
//! Every stage of the compile pipeline reports [`ParseError`]s; they are
//! collected per source file into an [`ErrorList`].

use super::lexer::{Span, Token, TokenKind};
use std::fmt;

/// Result type for parser operations
pub type ParseResult<T> = Result<T, Box<ParseError>>;

/// Error kind for categorization and better messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UnexpectedToken,
    UnexpectedEof,
    InvalidToken,
    InvalidDeclaration,
    InvalidExpression,
    InvalidStatement,
    TypeMismatch,
    UndefinedSymbol,
    Redeclaration,
    LimitExceeded,
    Other,
}

/// Compile error with location information and helpful context
#[derive(Debug, Clone)]
pub struct ParseError {
    pub kind: ErrorKind,
    pub message: String,
    pub span: Span,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl ParseError {
    /// Create an "expected token" error
    pub fn expected(expected: TokenKind, found: Token) -> Self {
        if let TokenKind::Invalid(message) = found.kind {
            return ParseError::with_kind(ErrorKind::InvalidToken, message, found.span);
        }

        let message = format!("Expected {}, found {}", expected, found.kind);
        let suggestion = Self::suggest_for_expected(&expected, &found.kind);

        ParseError {
            kind: if found.kind == TokenKind::Eof {
                ErrorKind::UnexpectedEof
            } else {
                ErrorKind::UnexpectedToken
            },
            message,
            span: found.span,
            suggestion,
            source: None,
        }
    }

    /// Create an error with a specific kind
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        ParseError {
            kind,
            message: message.into(),
            span,
            suggestion: None,
            source: None,
        }
    }

    /// Add a suggestion to the error
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add source code reference for better error display
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Convert into a boxed error for ParseResult
    pub fn boxed(self) -> Box<Self> {
        Box::new(self)
    }

    /// Suggest fixes for common "expected token" errors
    fn suggest_for_expected(expected: &TokenKind, found: &TokenKind) -> Option<String> {
        match (expected, found) {
            (TokenKind::RBrace, TokenKind::Eof) => {
                Some("Add a closing brace '}' to match the opening brace".to_string())
            }
            (TokenKind::RParen, TokenKind::Eof) => {
                Some("Add a closing parenthesis ')' to match the opening parenthesis".to_string())
            }
            (TokenKind::RBracket, TokenKind::Eof) => {
                Some("Add a closing bracket ']' to match the opening bracket".to_string())
            }
            (TokenKind::LBrace, TokenKind::Nl) => {
                Some("The opening brace '{' must be on the same line as the condition".to_string())
            }
            (TokenKind::Slash, _) => {
                Some("Regular expressions are delimited by '/', e.g. /foo (\\d+)/".to_string())
            }
            _ => Option::None,
        }
    }

    /// Format the error with source code context
    pub fn format_with_source(&self, filename: &str) -> String {
        let mut output = String::new();

        output.push_str(&format!("Error: {}\n", self.message));

        output.push_str(&format!(
            "  --> {}:{}:{}\n",
            filename, self.span.start.line, self.span.start.column
        ));

        if let Some(source) = &self.source {
            let lines: Vec<&str> = source.lines().collect();
            let line_idx = self.span.start.line.saturating_sub(1);

            if line_idx < lines.len() {
                let line = lines[line_idx];
                let line_num = self.span.start.line;
                let line_num_width = line_num.to_string().len();

                output.push_str(&format!("{:width$} |\n", "", width = line_num_width));
                output.push_str(&format!("{} | {}\n", line_num, line));

                let start_col = self.span.start.column.saturating_sub(1);
                let end_col = if self.span.start.line == self.span.end.line {
                    self.span.end.column.saturating_sub(1)
                } else {
                    line.len()
                };

                let indicator_len = (end_col.saturating_sub(start_col)).max(1);
                output.push_str(&format!(
                    "{:width$} | {:>start$}{:^<len$}\n",
                    "",
                    "",
                    "",
                    width = line_num_width,
                    start = start_col + 1,
                    len = indicator_len
                ));
            }
        }

        if let Some(suggestion) = &self.suggestion {
            output.push_str(&format!("   = help: {}\n", suggestion));
        }

        output
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.span, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  help: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Ordered diagnostics for one source file
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    filename: String,
    errors: Vec<ParseError>,
}

impl ErrorList {
    pub fn new(filename: impl Into<String>) -> Self {
        ErrorList {
            filename: filename.into(),
            errors: Vec::new(),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn push(&mut self, error: ParseError) {
        self.errors.push(error);
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ParseError> {
        self.errors.iter()
    }

    /// `Ok(value)` when no error was recorded
    pub fn into_result<T>(self, value: T) -> Result<T, ErrorList> {
        if self.is_empty() { Ok(value) } else { Err(self) }
    }

    /// Every error rendered with source context
    pub fn format_with_source(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.format_with_source(&self.filename))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "no errors");
        }
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}:{}: {}", self.filename, error.span, error.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::lexer::Position;

    fn error_at(message: &str, span: Span) -> ParseError {
        ParseError::with_kind(ErrorKind::Other, message, span)
    }

    #[test]
    fn test_error_with_source() {
        let span = Span::new(Position::new(1, 1, 0), Position::new(1, 5, 4));
        let err = ParseError::with_kind(ErrorKind::InvalidExpression, "Invalid expression", span).with_source("foo + ");

        assert_eq!(err.kind, ErrorKind::InvalidExpression);
        assert_eq!(err.source, Some("foo + ".to_string()));
        assert!(err.suggestion.is_none());
    }

    #[test]
    fn test_expected_token_error() {
        let token = Token::new(
            TokenKind::Ident("test".to_string()),
            Span::new(Position::new(1, 1, 0), Position::new(1, 5, 4)),
        );
        let err = ParseError::expected(TokenKind::LBrace, token);

        assert_eq!(err.kind, ErrorKind::UnexpectedToken);
        assert!(err.message.contains("Expected"));
        assert!(err.suggestion.is_none());
    }

    #[test]
    fn test_expected_rbrace_eof() {
        let token = Token::new(
            TokenKind::Eof,
            Span::new(Position::new(10, 1, 200), Position::new(10, 1, 200)),
        );
        let err = ParseError::expected(TokenKind::RBrace, token);

        assert_eq!(err.kind, ErrorKind::UnexpectedEof);
        assert!(err.suggestion.unwrap().contains("closing brace"));
    }

    #[test]
    fn test_expected_reports_invalid_token_message() {
        let token = Token::new(
            TokenKind::Invalid("Unexpected input: '?'".to_string()),
            Span::new(Position::new(2, 3, 10), Position::new(2, 4, 11)),
        );
        let err = ParseError::expected(TokenKind::RBrace, token);

        assert_eq!(err.kind, ErrorKind::InvalidToken);
        assert_eq!(err.message, "Unexpected input: '?'");
    }

    #[test]
    fn test_error_format_with_source() {
        let token = Token::new(
            TokenKind::Eof,
            Span::new(Position::new(2, 1, 16), Position::new(2, 4, 19)),
        );
        let err = ParseError::expected(TokenKind::RBrace, token).with_source("counter lines\nfoo++\n");

        let formatted = err.format_with_source("test.mtail");
        assert!(formatted.starts_with("Error: Expected"));
        assert!(formatted.contains("test.mtail:2:1"));
        assert!(formatted.contains("2 | foo++"));
        assert!(formatted.contains("help: Add a closing brace"));
    }

    #[test]
    fn test_error_format_without_source() {
        let span = Span::new(Position::new(5, 10, 80), Position::new(5, 15, 85));
        let formatted = error_at("Parse error", span).format_with_source("test.mtail");
        assert!(formatted.contains("test.mtail:5:10"));
        assert!(!formatted.contains(" | "));
    }

    #[test]
    fn test_empty_error_list() {
        let errors = ErrorList::new("prog.mtail");
        assert!(errors.is_empty());
        assert_eq!(errors.to_string(), "no errors");
        assert!(errors.into_result(()).is_ok());
    }

    #[test]
    fn test_error_list_display() {
        let mut errors = ErrorList::new("prog.mtail");
        errors.push(error_at("first", Span::new(Position::new(1, 2, 1), Position::new(1, 5, 4))));
        errors.push(error_at("second", Span::new(Position::new(3, 1, 20), Position::new(3, 4, 23))));

        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "prog.mtail:1:2-5: first\nprog.mtail:3:1-4: second"
        );
    }

    #[test]
    fn test_error_list_keeps_order_on_extend() {
        let span = Span::default();
        let mut first = ErrorList::new("a.mtail");
        first.push(error_at("one", span));
        let mut second = ErrorList::new("a.mtail");
        second.push(error_at("two", span));

        first.extend(second);
        let messages: Vec<&str> = first.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["one", "two"]);
    }
}
