use abcopt::{optimize_all, OptimizeOptions};
use anyhow::{Context, Result};
use clap::Parser;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// abcopt — whole-program optimizer for ABC bytecode.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Input files, linked into one output
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output file (defaults to the first input with an `.opt.abc` suffix)
    #[arg(long, short)]
    output: Option<PathBuf>,

    /// Import file providing declarations only (repeatable)
    #[arg(long = "import", short = 'i')]
    imports: Vec<PathBuf>,

    /// Keep debug instructions and parameter names
    #[arg(long, short = 'd')]
    keep_debug: bool,

    /// Emit code for the legacy verifier
    #[arg(long)]
    legacy_verifier: bool,

    /// Accept classes with native constructors
    #[arg(long)]
    allow_native_ctors: bool,

    /// Keep method names in the method table
    #[arg(long)]
    preserve_method_names: bool,

    /// Do not report native methods by name
    #[arg(long)]
    obscure_natives: bool,

    /// Print nothing but errors
    #[arg(long, short)]
    quiet: bool,

    /// Log pass results
    #[arg(long, short)]
    verbose: bool,
}

impl Cli {
    fn options(&self) -> OptimizeOptions {
        OptimizeOptions {
            strip_debug_info: !self.keep_debug,
            allow_native_ctors: self.allow_native_ctors,
            preserve_method_names: self.preserve_method_names,
            legacy_verifier: self.legacy_verifier,
            obscure_natives: self.obscure_natives,
        }
    }

    fn output_path(&self) -> PathBuf {
        match &self.output {
            Some(p) => p.clone(),
            None => self.inputs[0].with_extension("opt.abc"),
        }
    }
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "abcopt=debug" } else { "abcopt=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();

    let inputs = cli.inputs.iter().map(|p| read(p)).collect::<Result<Vec<_>>>()?;
    let imports = cli.imports.iter().map(|p| read(p)).collect::<Result<Vec<_>>>()?;
    let inputs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
    let imports: Vec<&[u8]> = imports.iter().map(Vec::as_slice).collect();

    if !cli.quiet {
        eprintln!("abcopt: optimizing {}", cli.inputs[0].display());
    }
    let optimized =
        optimize_all(&inputs, &imports, &cli.options()).context("optimization failed")?;

    let output = cli.output_path();
    fs::write(&output, &optimized.abc)
        .with_context(|| format!("failed to write {}", output.display()))?;

    if !cli.quiet {
        let before: usize = inputs.iter().map(|b| b.len()).sum();
        eprintln!(
            "abcopt: {} bytes -> {} bytes, wrote {}",
            before,
            optimized.abc.len(),
            output.display()
        );
        for n in &optimized.natives {
            eprintln!("abcopt: native {}", n);
        }
    }
    Ok(())
}
