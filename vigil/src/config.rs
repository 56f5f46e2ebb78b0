//! Environment configuration.
//!
//! All options live under the `VIGIL_` namespace. Boolean values accept
//! `true/1/yes/y` and `false/0/no/n`, case-insensitively; anything else
//! is a fatal configuration error, as is an unknown algorithm or
//! instrumentation strategy.

use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use vigil_core::Algorithm;
use vigil_instrument::Strategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid boolean value `{value}` for {name}")]
    InvalidBool { name: String, value: String },
    #[error("unknown algorithm `{0}` (expected one of A, B, C, C+, D)")]
    UnknownAlgorithm(String),
    #[error("no algorithm configured (set VIGIL_ALGO)")]
    MissingAlgorithm,
    #[error("unknown instrumentation strategy `{0}` (expected `ast` or `builtin`)")]
    UnknownStrategy(String),
}

/// Which specifications to activate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecSelection {
    All,
    Named(Vec<String>),
}

impl SpecSelection {
    pub fn selects(&self, name: &str) -> bool {
        match self {
            SpecSelection::All => true,
            SpecSelection::Named(names) => names.iter().any(|n| n == name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub spec_folder: Option<PathBuf>,
    pub active_specs: SpecSelection,
    pub algorithm: Algorithm,
    pub strategy: Strategy,
    pub instrument_vendor: bool,
    pub instrument_stdlib: bool,
    pub instrument_harness: bool,
    pub instrument_self: bool,
    /// Monitor garbage collection; disabled by `VIGIL_NO_GARBAGE_COLLECTION`.
    pub garbage_collection: bool,
    pub print_violations_to_console: bool,
    pub no_print: bool,
    pub debug_messages: bool,
    pub detailed_messages: bool,
    pub statistics: bool,
    pub statistics_file: Option<PathBuf>,
    pub spec_info: bool,
    pub convert_specs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            spec_folder: None,
            active_specs: SpecSelection::All,
            algorithm: Algorithm::D,
            strategy: Strategy::Ast,
            instrument_vendor: false,
            instrument_stdlib: false,
            instrument_harness: false,
            instrument_self: false,
            garbage_collection: true,
            print_violations_to_console: false,
            no_print: false,
            debug_messages: false,
            detailed_messages: false,
            statistics: false,
            statistics_file: None,
            spec_info: false,
            convert_specs: false,
        }
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" | "" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name: name.to_string(),
            value,
        }),
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    /// Reads the full option set from the environment.
    pub fn from_env() -> Result<Config, ConfigError> {
        let algorithm = match env("VIGIL_ALGO") {
            Some(raw) => {
                Algorithm::from_str(&raw).map_err(|_| ConfigError::UnknownAlgorithm(raw))?
            }
            None => return Err(ConfigError::MissingAlgorithm),
        };
        let strategy = match env("VIGIL_INSTRUMENTATION_STRATEGY").as_deref() {
            None | Some("ast") => Strategy::Ast,
            Some("builtin") => Strategy::Builtin,
            Some(other) => return Err(ConfigError::UnknownStrategy(other.to_string())),
        };
        let active_specs = match env("VIGIL_ACTIVE_SPECS") {
            None => SpecSelection::All,
            Some(raw) if raw.trim() == "all" => SpecSelection::All,
            Some(raw) => SpecSelection::Named(
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            ),
        };

        Ok(Config {
            spec_folder: env("VIGIL_SPEC_FOLDER").map(PathBuf::from),
            active_specs,
            algorithm,
            strategy,
            instrument_vendor: parse_bool("VIGIL_INSTRUMENT_VENDOR", env("VIGIL_INSTRUMENT_VENDOR"))?,
            instrument_stdlib: parse_bool("VIGIL_INSTRUMENT_STDLIB", env("VIGIL_INSTRUMENT_STDLIB"))?,
            instrument_harness: parse_bool(
                "VIGIL_INSTRUMENT_HARNESS",
                env("VIGIL_INSTRUMENT_HARNESS"),
            )?,
            instrument_self: parse_bool("VIGIL_INSTRUMENT_SELF", env("VIGIL_INSTRUMENT_SELF"))?,
            garbage_collection: !parse_bool(
                "VIGIL_NO_GARBAGE_COLLECTION",
                env("VIGIL_NO_GARBAGE_COLLECTION"),
            )?,
            print_violations_to_console: parse_bool(
                "VIGIL_PRINT_VIOLATIONS_TO_CONSOLE",
                env("VIGIL_PRINT_VIOLATIONS_TO_CONSOLE"),
            )?,
            no_print: parse_bool("VIGIL_NO_PRINT", env("VIGIL_NO_PRINT"))?,
            debug_messages: parse_bool("VIGIL_DEBUG_MSG", env("VIGIL_DEBUG_MSG"))?,
            detailed_messages: parse_bool("VIGIL_DETAILED_MSG", env("VIGIL_DETAILED_MSG"))?,
            statistics: parse_bool("VIGIL_STATISTICS", env("VIGIL_STATISTICS"))?,
            statistics_file: env("VIGIL_STATISTICS_FILE").map(PathBuf::from),
            spec_info: parse_bool("VIGIL_SPEC_INFO", env("VIGIL_SPEC_INFO"))?,
            convert_specs: parse_bool("VIGIL_CONVERT_SPECS", env("VIGIL_CONVERT_SPECS"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_boolean_parsing() {
        assert!(parse_bool("X", Some("Yes".into())).unwrap());
        assert!(!parse_bool("X", Some("0".into())).unwrap());
        assert!(!parse_bool("X", None).unwrap());
        assert!(parse_bool("X", Some("maybe".into())).is_err());
    }

    #[test]
    fn selection_matching() {
        let all = SpecSelection::All;
        assert!(all.selects("Anything"));
        let named = SpecSelection::Named(vec!["A".into(), "B".into()]);
        assert!(named.selects("A"));
        assert!(!named.selects("C"));
    }
}
