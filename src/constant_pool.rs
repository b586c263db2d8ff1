use regex::Regex;
use std::collections::HashMap;

/// Interned string literals referenced by `Str` instructions
///
/// Indexes are assigned in first-use order, so equal programs produce equal
/// pools.
#[derive(Debug, Clone, Default)]
pub struct StringPool {
    strings: Vec<String>,
    index: HashMap<String, usize>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a string to the pool (or find the existing entry) and return its index
    pub fn intern(&mut self, s: &str) -> usize {
        if let Some(&idx) = self.index.get(s) {
            return idx;
        }
        let idx = self.strings.len();
        self.strings.push(s.to_string());
        self.index.insert(s.to_string(), idx);
        idx
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.strings
    }
}

/// Compiled regular expressions referenced by `Match`, `Smatch`, `Capref`
/// and `Rsubst`, deduplicated by source text
#[derive(Debug, Clone, Default)]
pub struct RegexPool {
    regexps: Vec<Regex>,
    index: HashMap<String, usize>,
}

impl RegexPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `source` unless already present and return its index
    pub fn intern(&mut self, source: &str) -> Result<usize, regex::Error> {
        if let Some(&idx) = self.index.get(source) {
            return Ok(idx);
        }
        let re = Regex::new(source)?;
        let idx = self.regexps.len();
        self.regexps.push(re);
        self.index.insert(source.to_string(), idx);
        Ok(idx)
    }

    /// Index of an already interned source
    pub fn lookup(&self, source: &str) -> Option<usize> {
        self.index.get(source).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Regex> {
        self.regexps.get(index)
    }

    pub fn len(&self) -> usize {
        self.regexps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regexps.is_empty()
    }

    pub fn into_vec(self) -> Vec<Regex> {
        self.regexps
    }
}
