//! Command-line configuration.
//!
//! The tool uses single-dash long flags in the style of binutils-like
//! tools: `-if`, `-of`, `-prefix`, `-display-symbols`. Clap can't model
//! single-dash long flags, so we capture all arguments positionally and
//! parse them ourselves.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

/// Merge object files and static libraries into a single archive,
/// optionally prefixing the global and defined symbols.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Config {
    /// All arguments (-if, -of, -prefix, -display-symbols) in order.
    #[arg(required = true, allow_hyphen_values = true, num_args = 1..)]
    pub args: Vec<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

/// Parsed tool invocation.
pub struct Invocation {
    /// Input objects or archives, in order.
    pub inputs: Vec<PathBuf>,
    /// Output archive path.
    pub output: PathBuf,
    /// Prefix to apply to global and defined symbols.
    pub prefix: Option<String>,
    /// Print the collected symbols.
    pub display_symbols: bool,
}

impl Config {
    /// Parses the raw argument list. `-if` may be repeated and is required
    /// at least once; `-of` is required.
    pub fn parse_invocation(&self) -> Result<Invocation> {
        let mut inputs = Vec::new();
        let mut output = None;
        let mut prefix = None;
        let mut display_symbols = false;

        let mut iter = self.args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-if" => match iter.next() {
                    Some(path) => inputs.push(PathBuf::from(path)),
                    None => bail!("-if requires a filename"),
                },
                "-of" => match iter.next() {
                    Some(path) => output = Some(PathBuf::from(path)),
                    None => bail!("-of requires a filename"),
                },
                "-prefix" => match iter.next() {
                    Some(value) => prefix = Some(value.clone()),
                    None => bail!("-prefix requires a string"),
                },
                "-display-symbols" => display_symbols = true,
                other => bail!("unknown argument '{other}'"),
            }
        }

        if inputs.is_empty() {
            bail!("at least one -if input is required");
        }
        let Some(output) = output else {
            bail!("-of is required");
        };

        Ok(Invocation {
            inputs,
            output,
            prefix,
            display_symbols,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        Config {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            log_level: "warn".to_owned(),
        }
    }

    #[test]
    fn parses_repeated_inputs_and_flags() {
        let invocation = config(&[
            "-if", "a.o", "-if", "b.a", "-prefix", "p_", "-display-symbols", "-of", "out.a",
        ])
        .parse_invocation()
        .unwrap();
        assert_eq!(invocation.inputs.len(), 2);
        assert_eq!(invocation.output, PathBuf::from("out.a"));
        assert_eq!(invocation.prefix.as_deref(), Some("p_"));
        assert!(invocation.display_symbols);
    }

    #[test]
    fn requires_output() {
        assert!(config(&["-if", "a.o"]).parse_invocation().is_err());
    }

    #[test]
    fn requires_at_least_one_input() {
        assert!(config(&["-of", "out.a"]).parse_invocation().is_err());
    }

    #[test]
    fn rejects_unknown_arguments() {
        assert!(config(&["-if", "a.o", "-of", "out.a", "--bogus"])
            .parse_invocation()
            .is_err());
    }
}
