//! Runtime: owns the loaded programs and feeds them log lines

use crate::error::{Error, Result};
use crate::executor::{Executor, ExecutorOptions};
use crate::logline::LogLine;
use crate::observability::{PROG_LOAD_ERRORS_TOTAL, PROG_LOADS_TOTAL};
use crate::parser::{self, CompileOptions, ErrorList};
use crate::program::Object;
use crate::store::Store;
use metrics::counter;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// File extension of program sources
pub const PROGRAM_EXTENSION: &str = "mtail";

#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub compile: CompileOptions,
    pub executor: ExecutorOptions,
    /// Programs run at once for a single line
    pub workers: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            compile: CompileOptions::default(),
            executor: ExecutorOptions::default(),
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
        }
    }
}

/// Program files under `path`: the file itself, or every program in the
/// directory, sorted by name
pub fn program_files(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(path).map_err(|err| Error::io(path.display().to_string(), err))?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path).map_err(|err| Error::io(path.display().to_string(), err))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == PROGRAM_EXTENSION))
        .collect();
    files.sort();
    Ok(files)
}

/// Compile one program file
pub fn compile_file(path: &Path, options: &CompileOptions) -> Result<Object> {
    let name = path.display().to_string();
    let source = std::fs::read_to_string(path).map_err(|err| Error::io(name.clone(), err))?;
    parser::compile(&name, &source, options).map_err(Error::Compile)
}

pub struct Runtime {
    store: Arc<Store>,
    options: RuntimeOptions,
    programs: RwLock<BTreeMap<String, Arc<Executor>>>,
}

impl Runtime {
    pub fn new(store: Arc<Store>, options: RuntimeOptions) -> Self {
        Runtime {
            store,
            options,
            programs: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Load every program under `path`.
    ///
    /// Failures are logged and counted per program; the rest still load.
    /// Returns how many programs loaded.
    pub fn load_program_dir(&self, path: &Path) -> Result<usize> {
        let mut loaded = 0;
        for file in program_files(path)? {
            match self.load_program(&file) {
                Ok(()) => loaded += 1,
                Err(err) => error!(path = %file.display(), error = %err, "program load failed"),
            }
        }
        info!(path = %path.display(), loaded, "programs loaded");
        Ok(loaded)
    }

    /// Compile and install the program at `path`
    pub fn load_program(&self, path: &Path) -> Result<()> {
        let name = parser::program_name(&path.display().to_string());
        let source = std::fs::read_to_string(path).map_err(|err| {
            counter!(PROG_LOAD_ERRORS_TOTAL, "prog" => name.clone()).increment(1);
            Error::io(path.display().to_string(), err)
        })?;
        self.load_source(&path.display().to_string(), &source)
    }

    /// Compile and install a program from source.
    ///
    /// A program that fails to compile, or whose metrics clash with another
    /// program's, leaves any earlier version of it running.
    pub fn load_source(&self, name: &str, source: &str) -> Result<()> {
        let name = parser::program_name(name);
        let object = match parser::compile(&name, source, &self.options.compile) {
            Ok(object) => object,
            Err(errors) => return Err(self.load_failed(&name, errors)),
        };

        let declared = object.metrics.iter().map(|desc| (desc.exported_name.as_str(), desc.kind));
        if let Err(err) = self.store.check_conflicts(&name, declared) {
            counter!(PROG_LOAD_ERRORS_TOTAL, "prog" => name.clone()).increment(1);
            warn!(program = %name, error = %err, "program metrics conflict, keeping loaded version");
            return Err(err.into());
        }

        // metrics dropped from a new version of the program go away with it
        self.store.remove_program(&name);
        let executor = match Executor::new(Arc::new(object), &self.store, self.options.executor.clone()) {
            Ok(executor) => executor,
            Err(err) => {
                self.store.remove_program(&name);
                self.programs.write().unwrap_or_else(PoisonError::into_inner).remove(&name);
                counter!(PROG_LOAD_ERRORS_TOTAL, "prog" => name.clone()).increment(1);
                warn!(program = %name, error = %err, "program metrics conflict, unloaded");
                return Err(err.into());
            }
        };

        self.programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), Arc::new(executor));
        counter!(PROG_LOADS_TOTAL, "prog" => name.clone()).increment(1);
        info!(program = %name, "program loaded");
        Ok(())
    }

    fn load_failed(&self, name: &str, errors: ErrorList) -> Error {
        counter!(PROG_LOAD_ERRORS_TOTAL, "prog" => name.to_string()).increment(1);
        warn!(program = name, errors = errors.len(), "compile failed:\n{}", errors.format_with_source());
        Error::Compile(errors)
    }

    /// Remove a program and its metrics; false if it was not loaded
    pub fn unload_program(&self, name: &str) -> bool {
        let removed = self
            .programs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            self.store.remove_program(name);
            info!(program = name, "program unloaded");
        }
        removed
    }

    /// Names of loaded programs, sorted
    pub fn programs(&self) -> Vec<String> {
        self.programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn executors(&self) -> Vec<Arc<Executor>> {
        self.programs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Run every program over `line` on the calling thread
    pub fn process_line(&self, line: &LogLine) {
        for executor in self.executors() {
            executor.process_line(line);
        }
    }

    /// Consume `lines` until the channel closes, returning the line count.
    ///
    /// Programs run concurrently for each line; the next line starts once
    /// all of them have finished with the current one.
    pub async fn run(self: Arc<Self>, mut lines: mpsc::Receiver<LogLine>) -> u64 {
        let permits = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut count = 0u64;

        while let Some(line) = lines.recv().await {
            let line = Arc::new(line);
            let mut tasks = JoinSet::new();
            for executor in self.executors() {
                let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                    break;
                };
                let line = Arc::clone(&line);
                tasks.spawn_blocking(move || {
                    let _permit = permit;
                    executor.process_line(&line);
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "program task failed");
                }
            }
            count += 1;
        }

        info!(lines = count, "line channel closed, runtime done");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Metric, StoreError};

    const COUNTER: &str = "counter lines_total\n/$/ {\n  lines_total++\n}\n";

    fn runtime() -> Runtime {
        Runtime::new(Arc::new(Store::new()), RuntimeOptions::default())
    }

    fn int_value(store: &Store, name: &str, program: &str) -> i64 {
        let metric: Arc<Metric> = store.find(name, program).unwrap();
        metric.get_datum(&[]).unwrap().get_int()
    }

    #[test]
    fn test_load_and_process() {
        let rt = runtime();
        rt.load_source("/etc/progs/count.mtail", COUNTER).unwrap();
        assert_eq!(rt.programs(), vec!["count.mtail"]);

        rt.process_line(&LogLine::new("log", "a"));
        rt.process_line(&LogLine::new("log", "b"));
        assert_eq!(int_value(rt.store(), "lines_total", "count.mtail"), 2);
    }

    #[test]
    fn test_failed_compile_keeps_previous_version() {
        let rt = runtime();
        rt.load_source("count.mtail", COUNTER).unwrap();
        let err = rt.load_source("count.mtail", "counter lines_total\n/(/ {\n").unwrap_err();
        assert!(matches!(err, Error::Compile(_)));

        rt.process_line(&LogLine::new("log", "a"));
        assert_eq!(int_value(rt.store(), "lines_total", "count.mtail"), 1);
    }

    #[test]
    fn test_conflicting_reload_keeps_previous_version() {
        let rt = runtime();
        rt.load_source("a.mtail", "counter x\n/$/ { x++ }\n").unwrap();
        rt.load_source("b.mtail", "counter y\n/$/ { y++ }\n").unwrap();
        rt.process_line(&LogLine::new("log", "a"));

        let err = rt.load_source("b.mtail", "gauge x\n/$/ { x = 1 }\n").unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::KindConflict { .. })));
        assert_eq!(rt.programs(), vec!["a.mtail", "b.mtail"]);
        assert_eq!(int_value(rt.store(), "y", "b.mtail"), 1);

        rt.process_line(&LogLine::new("log", "b"));
        assert_eq!(int_value(rt.store(), "y", "b.mtail"), 2);
        assert_eq!(int_value(rt.store(), "x", "a.mtail"), 2);
    }

    #[test]
    fn test_reload_drops_removed_metrics() {
        let rt = runtime();
        rt.load_source("p.mtail", "counter a\ncounter b\n/x/ { a++ }\n").unwrap();
        assert!(rt.store().find("b", "p.mtail").is_some());
        rt.load_source("p.mtail", "counter a\n/x/ { a++ }\n").unwrap();
        assert!(rt.store().find("b", "p.mtail").is_none());
    }

    #[test]
    fn test_unload_removes_metrics() {
        let rt = runtime();
        rt.load_source("count.mtail", COUNTER).unwrap();
        assert!(rt.unload_program("count.mtail"));
        assert!(!rt.unload_program("count.mtail"));
        assert!(rt.programs().is_empty());
        assert!(rt.store().metrics().is_empty());
    }

    #[test]
    fn test_load_program_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.mtail"), COUNTER).unwrap();
        std::fs::write(dir.path().join("a.mtail"), "gauge g\n/(\\d+)/ { g = $1 }\n").unwrap();
        std::fs::write(dir.path().join("broken.mtail"), "counter\n").unwrap();
        std::fs::write(dir.path().join("README"), "not a program").unwrap();

        let rt = runtime();
        assert_eq!(rt.load_program_dir(dir.path()).unwrap(), 2);
        assert_eq!(rt.programs(), vec!["a.mtail", "b.mtail"]);

        let files = program_files(dir.path()).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_str().unwrap()).collect();
        assert_eq!(names, vec!["a.mtail", "b.mtail", "broken.mtail"]);
    }

    #[test]
    fn test_missing_program_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = runtime().load_program_dir(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn test_compile_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("count.mtail");
        std::fs::write(&path, COUNTER).unwrap();
        let object = compile_file(&path, &CompileOptions::default()).unwrap();
        assert_eq!(object.name, "count.mtail");
    }

    #[tokio::test]
    async fn test_run_dispatches_to_every_program() {
        let rt = Arc::new(runtime());
        rt.load_source("one.mtail", COUNTER).unwrap();
        rt.load_source("two.mtail", COUNTER).unwrap();

        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(Arc::clone(&rt).run(rx));
        for i in 0..5 {
            tx.send(LogLine::new("log", format!("line {}", i))).await.unwrap();
        }
        drop(tx);

        assert_eq!(task.await.unwrap(), 5);
        assert_eq!(int_value(rt.store(), "lines_total", "one.mtail"), 5);
        assert_eq!(int_value(rt.store(), "lines_total", "two.mtail"), 5);
    }
}
