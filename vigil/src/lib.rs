//! Monitoring-Oriented Programming for the Vigil scripting language.
//!
//! This crate ties the engine together: it reads the [`config`] from the
//! environment, discovers and loads specifications from the spec folder
//! ([`registry`]), sequences instrumentation, execution, and shutdown
//! ([`lifecycle`]), emits [`stats`], and converts surface-syntax
//! specifications ([`convert`]). The `vigil` binary is a thin launcher
//! over [`lifecycle::Runtime`].
//!
//! A minimal embedding:
//!
//! ```no_run
//! use vigil::config::Config;
//! use vigil::lifecycle::Runtime;
//!
//! let mut config = Config::default();
//! config.spec_folder = Some("specs".into());
//! let mut runtime = Runtime::init(config).expect("specs load");
//! let result = runtime.run_script("app.vg".as_ref(), &[]);
//! runtime.shutdown();
//! result.expect("script runs");
//! ```

pub mod config;
pub mod convert;
pub mod lifecycle;
pub mod registry;
pub mod stats;

pub use config::{Config, ConfigError, SpecSelection};
pub use lifecycle::{InitError, Runtime};
