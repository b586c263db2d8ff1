use std::sync::Arc;

/// One line read from a log source, without its newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Source the line came from; shared by every line of a stream
    pub filename: Arc<str>,
    pub line: String,
}

impl LogLine {
    pub fn new(filename: impl Into<Arc<str>>, line: impl Into<String>) -> Self {
        LogLine {
            filename: filename.into(),
            line: line.into(),
        }
    }
}
