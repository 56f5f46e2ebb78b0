//! The `vigil` launcher: runs a script under monitoring.
//!
//! Configuration comes from `VIGIL_*` environment variables; the script
//! path and its arguments come from the command line. Shutdown (the
//! end-of-execution sweep plus statistics) runs on every exit path.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vigil::config::Config;
use vigil::lifecycle::Runtime;

const BANNER: &str = r#"
__     __ ___  ____  ___  _
\ \   / /|_ _|/ ___||_ _|| |
 \ \ / /  | || |  _  | | | |
  \ V /   | || |_| | | | | |___
   \_/   |___|\____||___||_____|

Welcome to Vigil - Monitoring-Oriented Programming
"#;

#[derive(Debug, Parser)]
#[command(name = "vigil", about = "Run a Vigil script under runtime monitoring.")]
struct Cli {
    /// The script to execute.
    script: PathBuf,
    /// Arguments forwarded to the script as `argv`.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    println!("{}", BANNER);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // `debug-messages` raises the default filter; RUST_LOG still wins.
    let default_filter = if config.debug_messages { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    println!("============================ Vigil Configuration ============================\n");
    println!(" Instrumentation strategy: {:?}", config.strategy);
    println!(" Parametric algorithm {} is currently being used.", config.algorithm);
    if config.garbage_collection {
        println!(" Garbage collection: ENABLED");
    } else {
        println!(" Garbage collection: DISABLED");
    }
    println!();

    let spec_info = config.spec_info;
    let mut runtime = match Runtime::init(config) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            return ExitCode::FAILURE;
        }
    };

    if spec_info {
        println!("============================== Specs descriptions ==============================");
        for (name, description) in runtime.spec_descriptions() {
            println!("{}: {}", name, description.as_deref().unwrap_or("(no description)"));
        }
        return ExitCode::SUCCESS;
    }

    let result = runtime.run_script(&cli.script, &cli.args);
    // The sweep and statistics run whether or not the script failed.
    runtime.shutdown();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            ExitCode::FAILURE
        }
    }
}
