use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use gale::ast::ModuleGraph;
use gale::diagnostic::{Diagnostic, ansi::AnsiRenderer, json, registry};
use gale::parser::loader;
use gale::{NativeRegistry, Program, Value, Vm, VmConfig, compile};

/// gale - compile and run gale scripts
#[derive(Parser, Debug)]
#[command(name = "gale", version)]
#[command(about = "Compile and run gale scripts on the register VM", long_about = None)]
struct Cli {
    /// Print errors as JSON, one object per line
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a script and run it
    Run {
        file: PathBuf,

        /// Call this function instead of `main`, after the globals are initialized
        #[arg(long)]
        func: Option<String>,

        #[command(flatten)]
        limits: Limits,

        /// Arguments passed to the function, as strings
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Print the compiled bytecode
    Disasm { file: PathBuf },
    /// List the symbols of the compiled program
    Names {
        file: PathBuf,

        /// Include registers
        #[arg(long)]
        registers: bool,
    },
    /// Print the parsed module graph as JSON
    Ast { file: PathBuf },
    /// Describe an error code, or list them all
    Explain { code: Option<String> },
}

#[derive(Args, Debug)]
struct Limits {
    /// Instructions to execute before failing, 0 for no limit
    #[arg(long, env = "GALE_MAX_STEPS")]
    max_steps: Option<usize>,

    /// Estimated bytes allocated before failing, 0 for no limit
    #[arg(long, env = "GALE_MAX_ALLOCATIONS")]
    max_allocations: Option<usize>,

    /// Call depth before failing, 0 for no limit
    #[arg(long, env = "GALE_MAX_FRAMES")]
    max_frames: Option<usize>,

    /// Grant every permission regardless of the script's directives
    #[arg(long)]
    trusted: bool,

    /// JSON file with defaults for the limits above
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Limits {
    /// File values first, flags and environment on top.
    fn resolve(&self) -> Result<VmConfig, Diagnostic> {
        let mut config = match &self.config {
            Some(path) => VmConfig::load(path).map_err(|e| Diagnostic::from(&e))?,
            None => VmConfig::default(),
        };
        if let Some(n) = self.max_steps {
            config.max_steps = n;
        }
        if let Some(n) = self.max_allocations {
            config.max_allocations = n;
        }
        if let Some(n) = self.max_frames {
            config.max_frames = n;
        }
        config.trusted |= self.trusted;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(d) => {
            if cli.json {
                eprintln!("{}", json::render(&d));
            } else {
                let renderer = AnsiRenderer { use_color: std::io::stderr().is_terminal() };
                eprint!("{}", renderer.render(&d));
            }
            ExitCode::FAILURE
        }
    }
}

/// `GALE_LOG` wins over `RUST_LOG`; without either only warnings show.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_env("GALE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn execute(command: Command) -> Result<(), Diagnostic> {
    match command {
        Command::Run { file, func, limits, args } => {
            let config = limits.resolve()?;
            let natives = NativeRegistry::with_prelude();
            let program = build(&file, &natives)?;
            run(&program, &natives, config, func.as_deref(), &args)
        }
        Command::Disasm { file } => {
            let program = build(&file, &NativeRegistry::with_prelude())?;
            print!("{}", program.disassemble());
            Ok(())
        }
        Command::Names { file, registers } => {
            let program = build(&file, &NativeRegistry::with_prelude())?;
            print!("{}", program.names(registers));
            Ok(())
        }
        Command::Ast { file } => {
            let graph = load(&file)?;
            let text = serde_json::to_string_pretty(&graph).map_err(|e| Diagnostic::error(e.to_string()))?;
            println!("{}", text);
            Ok(())
        }
        Command::Explain { code } => explain(code.as_deref()),
    }
}

fn load(file: &Path) -> Result<ModuleGraph, Diagnostic> {
    loader::load(file).map_err(|e| Diagnostic::from(&e))
}

fn build(file: &Path, natives: &NativeRegistry) -> Result<Program, Diagnostic> {
    let graph = load(file)?;
    compile(&graph, natives).map_err(|e| {
        let d = Diagnostic::from(&e);
        match std::fs::read_to_string(&e.file) {
            Ok(text) => d.with_source(text),
            Err(_) => d,
        }
    })
}

fn run(
    program: &Program,
    natives: &NativeRegistry,
    config: VmConfig,
    func: Option<&str>,
    args: &[String],
) -> Result<(), Diagnostic> {
    // panics surface as diagnostics, not as the default hook's report
    std::panic::set_hook(Box::new(|_| {}));

    let args: Vec<Value> = args.iter().map(|a| Value::from(a.as_str())).collect();
    let mut vm = Vm::new(program, natives).with_config(config);
    let result = match func {
        Some(name) => vm.initialize().and_then(|_| vm.run_func(name, &args)),
        None => vm.run(&args),
    };
    tracing::debug!(steps = vm.steps(), allocations = vm.allocations(), "finished");

    match result {
        Ok(Value::Null | Value::Undefined) => Ok(()),
        Ok(value) => {
            println!("{}", value);
            Ok(())
        }
        Err(e) => Err(Diagnostic::from(&e)),
    }
}

fn explain(code: Option<&str>) -> Result<(), Diagnostic> {
    let Some(code) = code else {
        for entry in registry::REGISTRY {
            println!("{:<10} {}", entry.code, entry.short);
        }
        return Ok(());
    };
    let code = code.to_ascii_uppercase();
    match registry::lookup(&code) {
        Some(entry) => {
            print!("{}", entry.long);
            Ok(())
        }
        None => Err(Diagnostic::error(format!("unknown error code '{}'", code))
            .with_suggestion("run `gale explain` to list every code")),
    }
}
