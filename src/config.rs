//! Server configuration, loaded from JSON with every field optional

use crate::error::{Error, Result};
use crate::executor::ExecutorOptions;
use crate::parser::CompileOptions;
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Program file or directory of `*.mtail` programs
    pub progs: PathBuf,
    /// Log paths, globs, `-` for stdin, or socket URLs
    pub logs: Vec<String>,

    /// How often log patterns are re-globbed
    pub poll_interval_ms: u64,
    /// How often idle streams look for new input
    pub poll_log_interval_ms: u64,
    /// Seconds between exporter pushes; 0 disables periodic push
    pub push_interval_secs: u64,
    /// Seconds between expired-datum sweeps
    pub gc_interval_secs: u64,

    pub max_regexp_length: usize,
    pub max_recursion_depth: usize,
    pub disable_optimisation: bool,
    pub syslog_use_current_year: bool,
    pub log_runtime_errors: bool,
    pub emit_prog_label: bool,
    /// IANA zone for timestamps without an offset, e.g. `Europe/Berlin`
    pub override_timezone: Option<String>,
    pub ignore_filename_regex_pattern: Option<String>,
    pub one_shot: bool,

    /// Host name used in collectd identifiers; the system name when unset
    pub hostname: Option<String>,
    /// Unix socket of the collectd unixsock plugin
    pub collectd_socketpath: Option<String>,
    pub collectd_prefix: String,
    /// `host:port` of a graphite plaintext listener
    pub graphite_host_port: Option<String>,
    pub graphite_prefix: String,
    /// `host:port` of a statsd daemon
    pub statsd_hostport: Option<String>,
    pub statsd_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            progs: PathBuf::new(),
            logs: Vec::new(),
            poll_interval_ms: 250,
            poll_log_interval_ms: 250,
            push_interval_secs: 60,
            gc_interval_secs: 3600,
            max_regexp_length: 1024,
            max_recursion_depth: 100,
            disable_optimisation: false,
            syslog_use_current_year: true,
            log_runtime_errors: true,
            emit_prog_label: false,
            override_timezone: None,
            ignore_filename_regex_pattern: None,
            one_shot: false,
            hostname: None,
            collectd_socketpath: None,
            collectd_prefix: String::new(),
            graphite_host_port: None,
            graphite_prefix: String::new(),
            statsd_hostport: None,
            statsd_prefix: String::new(),
        }
    }
}

impl Config {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path).map_err(|err| Error::io(path.display().to_string(), err))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.progs.as_os_str().is_empty() {
            return Err(Error::Config("no program path given".to_string()));
        }
        if self.logs.is_empty() {
            return Err(Error::Config("no log patterns given".to_string()));
        }
        if self.poll_interval_ms == 0 || self.poll_log_interval_ms == 0 {
            return Err(Error::Config("poll intervals must be positive".to_string()));
        }
        self.timezone()?;
        self.ignore_regex()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_log_interval(&self) -> Duration {
        Duration::from_millis(self.poll_log_interval_ms)
    }

    pub fn push_interval(&self) -> Duration {
        Duration::from_secs(self.push_interval_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// The configured zone, UTC by default
    pub fn timezone(&self) -> Result<Tz> {
        match &self.override_timezone {
            None => Ok(Tz::UTC),
            Some(name) => name
                .parse::<Tz>()
                .map_err(|err| Error::Config(format!("bad override_timezone {:?}: {}", name, err))),
        }
    }

    pub fn ignore_regex(&self) -> Result<Option<Regex>> {
        self.ignore_filename_regex_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(Error::from)
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            max_regexp_length: self.max_regexp_length,
            max_recursion_depth: self.max_recursion_depth,
            disable_optimisation: self.disable_optimisation,
        }
    }

    pub fn executor_options(&self) -> Result<ExecutorOptions> {
        Ok(ExecutorOptions {
            timezone: self.timezone()?,
            syslog_use_current_year: self.syslog_use_current_year,
            log_runtime_errors: self.log_runtime_errors,
        })
    }
}
