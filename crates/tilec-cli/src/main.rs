use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser};
use miette::{Context, IntoDiagnostic};

use tilec_backend_core::{BackendOptions, BackendRegistry};
use tilec_opt::CompileOptions;

/// tilec: tile kernel compiler
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Kernel to compile (see --list)
    kernel: Option<String>,

    /// List the available kernels and exit
    #[arg(long)]
    list: bool,

    /// Target backend (default: ir-dump)
    #[arg(short, long, default_value = "ir-dump")]
    target: String,

    /// Output path (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pipeline depth, as LOOP=DEPTH for one loop or DEPTH for every loop
    #[arg(long, value_parser = parse_stages)]
    stages: Vec<(Option<String>, u32)>,

    /// Skip the swizzle optimizer
    #[arg(long)]
    no_swizzle: bool,

    /// Fail on layout conflicts instead of inserting copies
    #[arg(long)]
    no_copies: bool,

    /// Number of shared-memory banks
    #[arg(long)]
    banks: Option<u32>,

    /// Width of one shared-memory bank in bytes
    #[arg(long)]
    bank_width: Option<u32>,

    /// Native MMA shape as MxNxK, or "none"
    #[arg(long, value_parser = parse_mma)]
    mma: Option<MmaShape>,

    /// Lanes cooperating on one register tile
    #[arg(long)]
    lanes: Option<u32>,

    /// Annotate emitted code with the IR op it comes from
    #[arg(long)]
    line_info: bool,

    /// Dump IR to stderr before backend compilation
    #[arg(long)]
    emit_ir: bool,

    /// Lower without producing output
    #[arg(long)]
    dry_run: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Debug)]
struct MmaShape(Option<[u32; 3]>);

fn parse_stages(s: &str) -> Result<(Option<String>, u32), String> {
    let (name, depth) = match s.split_once('=') {
        Some((name, depth)) => (Some(name.to_string()), depth),
        None => (None, s),
    };
    match depth.parse::<u32>() {
        Ok(d) if d > 0 => Ok((name, d)),
        _ => Err(format!("invalid pipeline depth '{depth}', expected a positive integer")),
    }
}

fn parse_mma(s: &str) -> Result<MmaShape, String> {
    if s == "none" {
        return Ok(MmaShape(None));
    }
    let dims: Vec<u32> = s
        .split('x')
        .map(|d| d.parse::<u32>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("invalid MMA shape '{s}', expected MxNxK"))?;
    match dims[..] {
        [m, n, k] if m > 0 && n > 0 && k > 0 => Ok(MmaShape(Some([m, n, k]))),
        _ => Err(format!("invalid MMA shape '{s}', expected MxNxK")),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if cli.list {
        for (name, about) in tilec_kernels::KERNELS {
            println!("{name:<16} {about}");
        }
        return Ok(());
    }

    // 1. Build the kernel.
    let name = cli
        .kernel
        .as_deref()
        .ok_or_else(|| miette::miette!("no kernel given (use --list to see the available ones)"))?;
    let mut kernel = tilec_kernels::by_name(name)
        .ok_or_else(|| {
            let available: Vec<_> = tilec_kernels::KERNELS.iter().map(|(n, _)| *n).collect();
            miette::miette!("unknown kernel '{name}' (available: {})", available.join(", "))
        })?
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("kernel construction failed")?;

    // 2. Pick the backend; its hardware model drives lowering.
    let mut registry = BackendRegistry::with_builtins();
    registry.register(Box::new(tilec_backend_cuda::CudaBackend));
    registry.register(Box::new(tilec_backend_cpu::CpuBackend));
    let backend = registry.find(&cli.target).ok_or_else(|| {
        let available = registry.list_targets().join(", ");
        miette::miette!("unknown target '{}' (available: {})", cli.target, available)
    })?;

    // 3. Apply configuration overrides.
    let mut options = CompileOptions::for_target(backend.target_spec());
    for (loop_name, depth) in &cli.stages {
        match loop_name {
            Some(l) => {
                options.pipeline_depth.insert(l.clone(), *depth);
            }
            None => {
                for (_, nest) in kernel.loops() {
                    options.pipeline_depth.insert(nest.name.clone(), *depth);
                }
            }
        }
    }
    options.swizzle = !cli.no_swizzle;
    options.layout_copies = !cli.no_copies;
    if let Some(banks) = cli.banks {
        options.target.bank_count = banks;
    }
    if let Some(width) = cli.bank_width {
        options.target.bank_width = width;
    }
    if let Some(MmaShape(mma)) = cli.mma {
        options.target.mma = mma;
    }
    if let Some(lanes) = cli.lanes {
        options.target.lanes = lanes;
    }
    log::debug!("compiling `{}` for {:?}", kernel.name, options.target);

    // 4. Lower.
    tilec_opt::lower(&mut kernel, &options)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err_with(|| format!("lowering '{}' for {} failed", kernel.name, options.target.name))?;

    // 5. Optionally dump IR to stderr.
    if cli.emit_ir {
        eprintln!("{}", tilec_ir::dump_kernel(&kernel));
    }

    // 6. Dry-run: stop here.
    if cli.dry_run {
        return Ok(());
    }

    // 7. Emit.
    let opts = BackendOptions {
        line_info: cli.line_info,
    };
    let output = backend
        .compile(&kernel, &opts)
        .map_err(|e| miette::miette!("{e}"))
        .wrap_err("backend compilation failed")?;

    // 8. Print diagnostics.
    for diag in &output.diagnostics {
        eprintln!("{diag}");
    }

    // 9. Write output.
    for file in &output.files {
        match &cli.output {
            Some(path) => {
                std::fs::write(path, &file.text)
                    .into_diagnostic()
                    .wrap_err_with(|| format!("failed to write {}", path.display()))?;
            }
            None => print!("{}", file.text),
        }
    }

    Ok(())
}
