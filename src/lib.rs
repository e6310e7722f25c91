//! isorun: a process-isolated test harness
//!
//! Test programs register suites into a [`Registry`] and hand it to
//! [`main_with`]. Every test then runs in a forked copy of the program, so a
//! crash, hang or corrupted global in one test cannot affect the others.
//!
//! ```ignore
//! use isorun::{verify_eq, Suite};
//!
//! fn main() -> std::process::ExitCode {
//!     isorun::main_with(|registry| {
//!         registry.register(Suite::new("math").it("add", |t| verify_eq!(t, 1 + 1, 2)))
//!     })
//! }
//! ```

pub mod assert;
pub mod barrier;
pub mod config;
pub mod context;
pub mod debugger;
pub mod error;
pub mod junit;
pub mod lifecycle;
pub mod logging;
pub mod output;
pub mod pattern;
pub mod process;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod scope;
pub mod signals;
pub mod trace;

pub use barrier::Barrier;
pub use context::TestContext;
pub use error::{HarnessError, HarnessResult};
pub use output::Output;
pub use process::{Failure, Outcome};
pub use registry::{Registry, Suite, Test, TestSpec, TestSuite};
pub use runner::{RunOptions, RunSummary, Runner};
pub use trace::{Failed, Fallible};

use anyhow::Context;
use clap::Parser;
use config::{Cli, OutputFormat};
use junit::JunitReporter;
use pattern::Filter;
use process::ExecOptions;
use reporter::{HumanReporter, JsonReporter, MultiReporter, Reporter};
use std::ffi::OsString;
use std::process::ExitCode;

/// Register suites with `setup`, then run them as the command line asks
pub fn main_with<F>(setup: F) -> ExitCode
where
    F: FnOnce(&mut Registry) -> HarnessResult<()>,
{
    main_with_args(std::env::args_os(), setup)
}

/// [`main_with`] with explicit arguments; the first one is the program name
pub fn main_with_args<I, T, F>(args: I, setup: F) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
    F: FnOnce(&mut Registry) -> HarnessResult<()>,
{
    logging::init();

    let mut registry = Registry::new();
    if let Err(e) = setup(&mut registry) {
        return fatal(&e.into());
    }

    // Usage errors, --help and --version exit inside clap
    let cli = Cli::parse_from(args);

    match run(&registry, &cli) {
        Ok(code) => code,
        Err(e) => fatal(&e),
    }
}

fn fatal(err: &anyhow::Error) -> ExitCode {
    eprintln!("Fatal error: {:#}.", err);
    ExitCode::FAILURE
}

fn run(registry: &Registry, cli: &Cli) -> anyhow::Result<ExitCode> {
    let settings = config::load_settings(&cli.config_path());
    config::apply_env(&settings);

    let options = cli.resolve(&settings, Output::default_color());
    let output = Output::stderr(options.color);
    let run_options = RunOptions {
        rerun: options.rerun,
        exec: ExecOptions {
            enforce_timeout: options.timeout,
            print_pid: options.pid,
        },
    };

    // Listing and debugging ignore the positional patterns
    let unfiltered = Filter::default();
    if cli.list {
        Runner::new(registry, &unfiltered, &output, run_options).list();
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(pattern) = &cli.debug {
        let mut reporter = HumanReporter::new(&output);
        Runner::new(registry, &unfiltered, &output, run_options).debug(pattern, &mut reporter)?;
        return Ok(ExitCode::SUCCESS);
    }

    let filter = Filter::new(&cli.patterns)?;

    if let Err(e) = signals::install_shutdown_handlers() {
        tracing::warn!("failed to install signal handlers: {}", e);
    }

    let mut reporters: Vec<Box<dyn Reporter + '_>> = Vec::new();
    match options.format {
        OutputFormat::Human => reporters.push(Box::new(HumanReporter::new(&output))),
        OutputFormat::Json => reporters.push(Box::new(JsonReporter::stdout())),
    }
    if let Some(path) = options.junit_xml.clone() {
        reporters.push(Box::new(JunitReporter::new(path, &output)));
    }
    let mut reporter = MultiReporter::new(reporters);

    let summary = Runner::new(registry, &filter, &output, run_options)
        .run(&mut reporter)
        .context("Test run aborted")?;

    tracing::debug!(?summary, "run finished");
    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
