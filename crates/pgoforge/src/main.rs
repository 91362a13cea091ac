use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use pgoforge::config::ConfigDoc;
use pgoforge::error::ErrorKind;
use pgoforge::executor::{ExecCtx, StdoutSink};
use pgoforge::gate::AssumeYes;
use pgoforge::modules::kernel::KernelInputs;
use pgoforge::modules::overlay::{OverlayConfig, load_module_list};
use pgoforge::workspace::WorkspaceConfig;
use pgoforge::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Log filter for diagnostics on stderr (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Emit diagnostics as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load a build definition and print the task plan
    Plan {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Print GraphViz dot instead of a linear plan
        #[arg(long)]
        dot: bool,
    },
    /// Print the build mode, flag bundle and descriptor variables
    Resolve {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Override a config value, e.g. --set kernel.options.lto=thin
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
    },
    /// Resolve, verify overrides and validate the descriptor without building
    Verify {
        /// Path to a build definition TOML
        build: PathBuf,
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
    },
    /// Execute the full pipeline
    Run {
        /// Path to a build definition TOML
        build: PathBuf,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Run decision steps only; skip confirmation, build and collect
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "set", value_name = "PATH=VALUE")]
        set: Vec<String>,
    },
    /// Classify loaded kernel modules into a config overlay
    Classify {
        /// Module list, one per line (`-` for stdin); defaults to /proc/modules
        #[arg(long)]
        modules: Option<String>,
        /// Directory the overlay is written under
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        /// Subdirectory preferred when it exists under --out-dir
        #[arg(long)]
        variant_dir: Option<String>,
        #[arg(long, default_value = "modules.config")]
        file_name: String,
        /// Print the overlay instead of writing it
        #[arg(long)]
        stdout: bool,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_json);

    match dispatch(args.cmd) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_cancelled() => {
            println!("cancelled: nothing was built");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.kind().exit_code() as u8)
        }
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn dispatch(cmd: Command) -> Result<()> {
    match cmd {
        Command::Plan { build, dot } => cmd_plan(&build, dot),
        Command::Resolve { build, set } => cmd_resolve(&build, &set),
        Command::Verify { build, set } => cmd_verify(&build, &set),
        Command::Run {
            build,
            yes,
            dry_run,
            set,
        } => cmd_run(&build, yes, dry_run, &set),
        Command::Classify {
            modules,
            out_dir,
            variant_dir,
            file_name,
            stdout,
        } => cmd_classify(modules, &out_dir, variant_dir, file_name, stdout),
    }
}

/// File, then `PGOFORGE_*` environment, then `--set`.
fn load_doc(path: &Path, set: &[String]) -> Result<ConfigDoc> {
    let mut doc = pgoforge::config::load(path)?;
    let applied = pgoforge::config::env::apply_process_env(&mut doc)?;
    if !applied.is_empty() {
        tracing::info!(vars = ?applied, "applied environment overrides");
    }
    pgoforge::config::env::apply_cli_overrides(&mut doc, set)?;
    Ok(doc)
}

fn cmd_plan(path: &Path, dot: bool) -> Result<()> {
    let doc = load_doc(path, &[])?;
    let plan = pgoforge::modules::plan_for(&doc)?;

    if dot {
        print!("{}", plan.to_dot()?);
        return Ok(());
    }

    let ordered = plan.ordered()?;
    for (i, task) in ordered.iter().enumerate() {
        println!(
            "{:>2}. {:<18}  {:<8} {:<10}  {}",
            i + 1,
            task.id,
            task.module,
            task.phase,
            task.label
        );
    }
    Ok(())
}

fn cmd_resolve(path: &Path, set: &[String]) -> Result<()> {
    let doc = load_doc(path, set)?;
    let inputs = KernelInputs::from_doc(&doc)?;
    let plan = inputs.resolve()?;
    for line in plan.summary_lines() {
        println!("{line}");
    }
    println!("descriptor variables:");
    for (k, v) in inputs.intended(&plan) {
        println!("  {k}={v}");
    }
    println!("next: {}", plan.mode.next_step_hint());
    Ok(())
}

fn cmd_verify(path: &Path, set: &[String]) -> Result<()> {
    let doc = load_doc(path, set)?;
    let inputs = KernelInputs::from_doc(&doc)?;
    let plan = inputs.resolve()?;
    let intended = inputs.intended(&plan);
    let inspection = inputs.inspect(&intended)?;

    println!("mode: {} (evaluator: {})", plan.mode, inspection.report.evaluator);
    for o in &inspection.report.outcomes {
        let tag = if o.is_mismatch() { "WARNING: " } else { "" };
        println!("  {tag}{}", o.describe());
    }
    for w in &inspection.report.descriptor_warnings {
        println!("  WARNING: {w}");
    }
    let structure = inputs.check_structure(&inspection.snapshot)?;
    println!(
        "structure ok: {} source(s), {} entries in {}",
        structure.sources, structure.checksums, structure.checksum_array
    );

    let mismatches = inspection.report.mismatches().count();
    if mismatches > 0 && inputs.cfg.fail_on_mismatch {
        return Err(Error::new(
            ErrorKind::OverrideMismatch,
            format!("{mismatches} override(s) not honored by the descriptor"),
        ));
    }
    Ok(())
}

fn cmd_run(path: &Path, yes: bool, dry_run: bool, set: &[String]) -> Result<()> {
    let doc = load_doc(path, set)?;
    let plan = pgoforge::modules::plan_for(&doc)?;
    let reg = pgoforge::executor::builtin_registry()?;

    let ws_cfg: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
    let ws = pgoforge::workspace::load_paths(&ws_cfg, &doc.base_dir())?;
    let sink = Arc::new(StdoutSink::with_error_logs_root(ws.error_logs_dir()));

    let mut ctx = ExecCtx::new(dry_run, sink);
    if yes {
        ctx = ctx.with_gate(Arc::new(AssumeYes));
    }
    pgoforge::executor::execute_plan(&doc, &plan, &reg, &mut ctx)
}

fn cmd_classify(
    modules: Option<String>,
    out_dir: &Path,
    variant_dir: Option<String>,
    file_name: String,
    stdout: bool,
) -> Result<()> {
    let cfg = OverlayConfig {
        modules_file: modules,
        variant_dir,
        file_name,
        ..OverlayConfig::default()
    };
    let cwd = std::env::current_dir()?;
    let list = load_module_list(&cfg, &cwd)?;
    let result = pgoforge::classify::classify(&list);
    let rendered = pgoforge::classify::render(&result);

    if stdout {
        print!("{rendered}");
        return Ok(());
    }
    let path =
        pgoforge::classify::resolve_overlay_path(out_dir, cfg.variant_dir.as_deref(), &cfg.file_name);
    pgoforge::classify::write_overlay(&path, &rendered)?;
    println!("wrote {} ({} module(s))", path.display(), result.total());
    Ok(())
}
