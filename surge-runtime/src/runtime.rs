//! Default surge runtime
//!
//! Loads a JSON plan document, resolves its workloads from a [`Registry`], and runs it. An
//! optional status server exposes the live report and an operator stop. Ctrl-C aborts the run.
use crate::{
    error::RuntimeError,
    server::{bind, server_task},
};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use surge::constants::{BASE_URL_ENV, EXIT_FATAL};
use surge::{PlanConfig, Registry, RunReport, Scheduler};
#[allow(unused)]
use tracing::{debug, error, info, instrument, warn, Instrument};

#[derive(Parser, Debug)]
#[command(version = "0.1")]
struct SurgeCli {
    /// Path to the JSON plan document.
    #[arg(short, long)]
    config: PathBuf,

    /// Base URL of the system under test. Overrides the plan's `base_url`.
    #[arg(long, env = BASE_URL_ENV)]
    base_url: Option<String>,

    /// Serve `GET /status` and `POST /stop` on this port while the run is in progress.
    #[arg(short('p'), long)]
    status_port: Option<u16>,

    /// Write the final report as JSON to this path.
    #[arg(long)]
    summary_export: Option<PathBuf>,
}

/// Default surge runtime.
///
/// # Example
///
/// ```no_run
/// use surge::prelude::*;
/// use surge_runtime::SurgeRuntime;
///
/// #[tokio::main]
/// async fn main() -> std::process::ExitCode {
///     let mut registry = Registry::new();
///     registry.register("read_employees", read_employees);
///
///     SurgeRuntime::new(registry)
///         .with_args()
///         .run()
///         .await
/// }
///
/// async fn read_employees() {
/// }
/// ```
pub struct SurgeRuntime {
    registry: Registry,
    config: Option<PathBuf>,
    plan: Option<PlanConfig>,
    base_url: Option<String>,
    status_port: Option<u16>,
    summary_export: Option<PathBuf>,
}

impl SurgeRuntime {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            config: None,
            plan: None,
            base_url: None,
            status_port: None,
            summary_export: None,
        }
    }

    /// Use the default CLI arguments for surge.
    ///
    /// `-c`, `--config` path to the plan document (required)
    ///
    /// `--base-url` base URL of the system under test (also read from `BASE_URL`)
    ///
    /// `-p`, `--status-port` port for the live status server
    ///
    /// `--summary-export` path to write the JSON report to
    ///
    /// # Example
    /// ```ignore
    /// $ ./employee-load -c employee-plan.json
    /// $ BASE_URL=http://staging:8004 ./employee-load -c employee-plan.json -p 7621
    /// ```
    pub fn with_args(mut self) -> Self {
        let args = SurgeCli::parse();
        self.config = Some(args.config);
        self.base_url = args.base_url;
        self.status_port = args.status_port;
        self.summary_export = args.summary_export;
        self
    }

    pub fn config(mut self, path: impl Into<PathBuf>) -> Self {
        self.config = Some(path.into());
        self
    }

    /// Use an in-memory plan instead of reading `--config`.
    pub fn plan(mut self, plan: PlanConfig) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn status_port(mut self, port: u16) -> Self {
        self.status_port = Some(port);
        self
    }

    pub fn summary_export(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_export = Some(path.into());
        self
    }

    /// Run the plan, print the summary, and map the outcome to the process exit status.
    #[instrument(name = "surge", skip_all, fields(port = self.status_port))]
    pub async fn run(self) -> ExitCode {
        match self.execute().await {
            Ok(report) => {
                println!("{report}");
                ExitCode::from(report.exit_code())
            }
            Err(err) => {
                error!("{err}");
                ExitCode::from(EXIT_FATAL)
            }
        }
    }

    /// Run the plan and return the final report.
    pub async fn execute(self) -> Result<RunReport, RuntimeError> {
        let plan = match (self.plan, &self.config) {
            (Some(plan), _) => plan,
            (None, Some(path)) => load_plan(path).await?,
            (None, None) => return Err(RuntimeError::NoPlan),
        };

        let base_url = self
            .base_url
            .or_else(|| std::env::var(BASE_URL_ENV).ok());
        let scheduler = Scheduler::from_config(&plan, &self.registry, base_url.as_deref())?;

        let listener = match self.status_port {
            Some(port) => Some(bind(port).await?),
            None => None,
        };

        let handle = scheduler.start();
        let control = handle.control();

        let server = listener.map(|listener| {
            tokio::spawn(server_task(listener, control.clone()).in_current_span())
        });

        let interrupt = {
            let control = control.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted");
                    control.abort("interrupted");
                }
            })
        };

        let report = handle.wait().await;
        interrupt.abort();
        if let Some(server) = server {
            server.abort();
        }

        if let Some(path) = self.summary_export {
            let json = serde_json::to_vec_pretty(&report)?;
            tokio::fs::write(&path, json)
                .await
                .map_err(RuntimeError::io(&path))?;
            info!("Summary written to {}", path.display());
        }

        Ok(report)
    }
}

/// Read and parse a plan document.
pub async fn load_plan(path: &Path) -> Result<PlanConfig, RuntimeError> {
    let raw = tokio::fs::read(path).await.map_err(RuntimeError::io(path))?;
    let plan = serde_json::from_slice(&raw)?;
    debug!("Loaded plan from {}", path.display());
    Ok(plan)
}
