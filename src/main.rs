//! Safe Templates CLI
//!
//! Usage:
//!   safe-templates [OPTIONS] <FILES>...
//!
//! Options:
//!   -t, --template <NAME>  Template to execute (default: first file's name)
//!   -d, --data <FILE>      JSON data file, `-` for stdin
//!   -c, --config <FILE>    Engine configuration (TOML format)
//!   -l, --list             List defined templates instead of executing
//!   -v, --verbose          Enable debug logging
//!   -h, --help             Print help

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use clap::Parser;
use serde_json::Value;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use safe_templates::{parse_files_with, EngineConfig, TemplateError};

#[derive(Parser)]
#[command(name = "safe-templates")]
#[command(about = "Render HTML templates with contextual escaping")]
struct Cli {
    /// Template files; each defines a template named by its base name
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Template to execute (defaults to the first file's base name)
    #[arg(short, long)]
    template: Option<String>,

    /// JSON data file, or `-` to read stdin
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// Engine configuration file (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// List defined templates instead of executing
    #[arg(short, long)]
    list: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "safe_templates=debug"
    } else {
        "safe_templates=warn"
    };
    let filter = match directive.parse::<Directive>() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(&cli) {
        match e.report() {
            Some(report) => eprint!("{}", report),
            None => eprintln!("Error: {}", e),
        }
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<(), TemplateError> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    let root = parse_files_with(&config, &cli.files)?;

    if cli.list {
        for template in root.templates() {
            println!("{}", template.name());
        }
        return Ok(());
    }

    let data = match &cli.data {
        Some(path) => read_data(path)?,
        None => Value::Null,
    };
    let name = cli.template.clone().unwrap_or_else(|| root.name().to_string());

    let stdout = io::stdout();
    let mut out = stdout.lock();
    root.execute_template(&mut out, &name, &data)?;
    out.flush().map_err(|source| TemplateError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    })
}

fn read_data(path: &Path) -> Result<Value, TemplateError> {
    let text = if path == Path::new("-") {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(|source| TemplateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        buffer
    } else {
        fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_path_buf(),
            source,
        })?
    };
    Ok(serde_json::from_str(&text)?)
}
