//! Server: wires the store, runtime, tailer and exporter around one line
//! channel

use crate::config::Config;
use crate::error::Result;
use crate::exporter::{Exporter, ExporterOptions};
use crate::runtime::{Runtime, RuntimeOptions};
use crate::store::Store;
use crate::tailer::{Tailer, TailerOptions};
use crate::waker::Waker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Lines buffered between the tailer and the runtime
const LINE_CHANNEL: usize = 1024;

pub struct Server {
    config: Config,
    store: Arc<Store>,
    runtime: Arc<Runtime>,
    exporter: Arc<Exporter>,
}

impl Server {
    /// Validate `config` and load its programs
    pub fn new(config: Config) -> Result<Server> {
        config.validate()?;
        let store = Arc::new(Store::new());
        let exporter = Arc::new(Exporter::new(Arc::clone(&store), ExporterOptions::from_config(&config)));
        let runtime = Arc::new(Runtime::new(
            Arc::clone(&store),
            RuntimeOptions {
                compile: config.compile_options(),
                executor: config.executor_options()?,
                ..RuntimeOptions::default()
            },
        ));
        runtime.load_program_dir(&config.progs)?;

        Ok(Server {
            config,
            store,
            runtime,
            exporter,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run until `cancel` fires or, in one-shot mode, until every log is
    /// read. Returns the number of lines processed.
    pub async fn run(&self, cancel: CancellationToken) -> Result<u64> {
        let background = cancel.child_token();
        let gc = Arc::clone(&self.store).spawn_gc_loop(self.config.gc_interval(), background.clone());
        let push = Arc::clone(&self.exporter).spawn_push_loop(background.clone());

        let (tx, rx) = mpsc::channel(LINE_CHANNEL);
        let dispatch = tokio::spawn(Arc::clone(&self.runtime).run(rx));

        let options = TailerOptions {
            one_shot: self.config.one_shot,
            ignore_regex: self.config.ignore_regex()?,
            pattern_waker: Some(Waker::timed(self.config.poll_interval())),
            stream_waker: Waker::timed(self.config.poll_log_interval()),
        };
        let tailer = match Tailer::new(tx, &cancel, options, &self.config.logs).await {
            Ok(tailer) => tailer,
            Err(err) => {
                background.cancel();
                return Err(err);
            }
        };
        info!(programs = self.runtime.programs().len(), logs = self.config.logs.len(), "server running");

        tailer.wait().await;
        let lines = match dispatch.await {
            Ok(lines) => lines,
            Err(err) => {
                warn!(error = %err, "dispatch task failed");
                0
            }
        };

        background.cancel();
        let _ = gc.await;
        if let Some(push) = push {
            let _ = push.await;
        }
        self.exporter.push().await;
        info!(lines, "server stopped");
        Ok(lines)
    }
}
