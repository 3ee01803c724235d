//! Entry point for the bartleby tool.
//!
//! Simple flow: parse args → ingest inputs → prefix symbols → emit archive.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use bartleby::config::Config;
use bartleby::Bartleby;

fn main() {
    let config = Config::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(err) = run(&config) {
        eprintln!("bartleby: error: {err:#}");
        std::process::exit(1);
    }
}

fn run(config: &Config) -> Result<()> {
    let invocation = config.parse_invocation()?;

    let mut handle = Bartleby::new();
    for path in &invocation.inputs {
        info!("Processing input: {}", path.display());
        let binary = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        handle
            .add_binary(binary)
            .with_context(|| format!("'{}'", path.display()))?;
    }

    if let Some(prefix) = &invocation.prefix {
        let count = handle.prefix_global_and_defined_symbols(prefix);
        println!("{count} symbol(s) prefixed");
    }

    if invocation.display_symbols {
        display_symbols(&handle, invocation.prefix.as_deref());
    }

    handle.build_to_path(&invocation.output)?;
    println!("{} produced.", invocation.output.display());
    Ok(())
}

/// Prints one line per collected symbol, sorted by name.
fn display_symbols(handle: &Bartleby, prefix: Option<&str>) {
    let mut names: Vec<&String> = handle.symbols().keys().collect();
    names.sort();
    for name in names {
        let sym = &handle.symbols()[name];
        let defined = sym.is_defined();
        let global = sym.is_global();
        let fate = match prefix {
            Some(prefix) if defined && global && !prefix.is_empty() => {
                format!("(to be prefixed by {prefix})")
            }
            _ => "(left unchanged)".to_owned(),
        };
        println!(
            "Symbol {} is {} and {} {}",
            name,
            if defined { "defined" } else { "undefined" },
            if global { "global" } else { "local" },
            fate
        );
    }
}
