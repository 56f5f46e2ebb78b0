//! Phase sequencing for a monitored run.
//!
//! Order: configuration validation → optional surface-spec conversion →
//! loader hook install (`ast` strategy only) → registry load and monitor
//! creation → entry-script execution → explicit [`Runtime::shutdown`] on
//! every exit path, which runs the end-of-execution sweep and emits
//! statistics. Shutdown is idempotent; errors in one phase never prevent
//! the remaining specifications from loading.

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use vigil_core::{Dispatcher, ViolationStore};
use vigil_instrument::interp::{Interp, VmError};
use vigil_instrument::loader::{Loader, LoaderConfig};
use vigil_instrument::shim::Strategy;
use vigil_instrument::value::Value;

use crate::config::Config;
use crate::convert::{self, ConvertError};
use crate::registry::{self, RegistryReport};
use crate::stats::Statistics;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("no spec folder configured (set VIGIL_SPEC_FOLDER)")]
    MissingSpecFolder,
    #[error("spec folder {0} does not exist")]
    SpecFolderMissing(PathBuf),
    #[error(transparent)]
    Convert(#[from] ConvertError),
}

/// A fully initialized monitoring runtime.
pub struct Runtime {
    config: Config,
    interp: Rc<Interp>,
    dispatcher: Arc<Dispatcher>,
    stats: Statistics,
    report: RegistryReport,
    shutdown_done: bool,
}

impl Runtime {
    /// Runs every startup phase through monitor creation.
    pub fn init(config: Config) -> Result<Runtime, InitError> {
        let folder = config
            .spec_folder
            .clone()
            .ok_or(InitError::MissingSpecFolder)?;
        if !folder.is_dir() {
            return Err(InitError::SpecFolderMissing(folder));
        }

        if config.convert_specs {
            let converted = convert::convert_folder(&folder)?;
            if converted.is_empty() {
                println!("No new specs were converted.");
            } else {
                println!("The new specs converted: {:?}.", converted);
            }
        }

        let mut stats = Statistics::begin();

        let store = Arc::new(ViolationStore::new(
            config.print_violations_to_console,
            config.no_print,
        ));
        let dispatcher = Arc::new(Dispatcher::new(config.garbage_collection, store));

        let loader_config = LoaderConfig {
            instrument_vendor: config.instrument_vendor,
            instrument_stdlib: config.instrument_stdlib,
            instrument_harness: config.instrument_harness,
            instrument_self: config.instrument_self,
            spec_dirs: vec![folder.clone()],
            ..LoaderConfig::default()
        };
        let interp = Rc::new(Interp::new(Loader::new(loader_config)));
        interp.shim.install(dispatcher.clone(), config.strategy);
        // Only the ast strategy needs the rewriting hook; builtin-mode
        // events come from native dispatch.
        interp
            .loader
            .install_hook(&interp, config.strategy == Strategy::Ast);
        stats.mark_instrumentation_end();

        let report = registry::load_specs(
            &interp,
            &dispatcher,
            &folder,
            &config.active_specs,
            config.algorithm,
            config.detailed_messages,
        );
        stats.mark_monitors_created();
        interp.loader.set_instrumentation_complete();

        info!(
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            algorithm = %config.algorithm,
            "vigil runtime initialized"
        );

        Ok(Runtime {
            config,
            interp,
            dispatcher,
            stats,
            report,
            shutdown_done: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn interp(&self) -> &Rc<Interp> {
        &self.interp
    }

    pub fn report(&self) -> &RegistryReport {
        &self.report
    }

    /// `(name, docstring)` for every loaded spec, for `spec-info` output.
    pub fn spec_descriptions(&self) -> Vec<(String, Option<String>)> {
        self.report
            .loaded
            .iter()
            .map(|info| (info.name.clone(), info.description.clone()))
            .collect()
    }

    /// Executes the entry script with forwarded arguments, as if invoked
    /// directly.
    pub fn run_script(&mut self, path: &Path, args: &[String]) -> Result<(), VmError> {
        let mut loader_config = self.interp.loader.config();
        if loader_config.vendor_dir.is_none() {
            let vendor = path.parent().map(|p| p.join("vendor"));
            if let Some(vendor) = &vendor {
                if vendor.is_dir() {
                    // Third-party packages resolve like user modules; the
                    // exclusion rules decide whether they are rewritten.
                    self.interp.loader.add_search_root(vendor.clone());
                }
            }
            loader_config.vendor_dir = vendor;
            self.interp.loader.set_config(loader_config);
        }
        self.interp.builtins.scope.define(
            "argv",
            Value::list(args.iter().map(|a| Value::str(a.as_str())).collect()),
        );
        debug!(script = %path.display(), "running entry script");
        self.interp
            .loader
            .load_entry(&self.interp, path)
            .map(|_| ())
    }

    /// Marks the current test for violation attribution. Under algorithm
    /// A the name is cleared: its single monitor would misattribute
    /// per-test occurrences.
    pub fn set_current_test(&self, name: Option<String>) {
        let name = match (self.config.algorithm, name) {
            (vigil_core::Algorithm::A, Some(_)) => Some(String::new()),
            (_, name) => name,
        };
        self.dispatcher.violations().set_current_test(name);
    }

    /// End-of-execution sweep plus statistics emission. Safe to call from
    /// every exit path; only the first call does anything.
    pub fn shutdown(&mut self) {
        if self.shutdown_done {
            return;
        }
        self.shutdown_done = true;
        self.dispatcher.end_sweep();
        self.stats
            .set_post_instrumentation_load_seconds(self.interp.loader.post_instrumentation_seconds());
        println!("============================ Vigil Statistics starts ============================");
        self.stats.emit(&self.config, &self.dispatcher);
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        // The sweep must not be lost if the embedder forgot to shut down;
        // statistics still go out once.
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_spec_folder_is_fatal() {
        let config = Config::default();
        assert!(matches!(
            Runtime::init(config),
            Err(InitError::MissingSpecFolder)
        ));
    }

    #[test]
    fn nonexistent_spec_folder_is_fatal() {
        let config = Config {
            spec_folder: Some(PathBuf::from("/definitely/not/a/folder")),
            ..Config::default()
        };
        assert!(matches!(
            Runtime::init(config),
            Err(InitError::SpecFolderMissing(_))
        ));
    }
}
