//! checkopt - run the check-elimination optimizer over serialized IR graphs
//!
//! # Usage
//!
//! ```bash
//! # Optimize every function with the default pipeline and print the result
//! checkopt optimize graph.json
//!
//! # Only checks elimination, no hoisting, block-local dominance
//! checkopt optimize graph.json --passes checks-elimination --no-hoist --dominance block
//!
//! # Inspect the analyses behind the decisions
//! checkopt alias graph.json
//! checkopt ranges graph.json --function main
//! checkopt loops graph.json
//! ```

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use compiler::config::{DominanceMode, OptimizerConfig};
use compiler::ir::alias_analysis::AliasAnalysis;
use compiler::ir::bounds_analysis::BoundsRangeInfo;
use compiler::ir::countable_loop::{get_loop_iterations, CountableLoopParser};
use compiler::ir::dump::dump_function;
use compiler::ir::loop_analysis::{DominatorTree, LoopNestInfo};
use compiler::ir::optimization::{OptimizationEvent, PassManager};
use compiler::ir::{IrFunction, IrModule};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "checkopt")]
#[command(version = "0.1.0")]
#[command(about = "Check elimination and loop optimizer for SSA graph IR", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the optimization pipeline over a module
    Optimize {
        /// Path to the IR module (JSON)
        file: PathBuf,

        /// Optimizer configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Comma-separated pass list, overriding the configuration
        #[arg(long, value_delimiter = ',')]
        passes: Option<Vec<String>>,

        /// Do not move checks into loop preheaders
        #[arg(long)]
        no_hoist: bool,

        /// Dominance used for dominated-check removal (block or tree)
        #[arg(long)]
        dominance: Option<DominanceMode>,

        /// Verify every function after each modifying pass
        #[arg(long)]
        verify: bool,

        /// Print every optimization event as a JSON line
        #[arg(long)]
        events: bool,

        /// Write the optimized module here instead of printing it
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Output format for the optimized module
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the alias analysis constraint graph and solution
    Alias {
        file: PathBuf,

        /// Only this function
        #[arg(short, long)]
        function: Option<String>,
    },

    /// Print the bounds ranges of every value, per block
    Ranges {
        file: PathBuf,

        #[arg(short, long)]
        function: Option<String>,
    },

    /// Print the loop nest and the counted loops found in it
    Loops {
        file: PathBuf,

        #[arg(short, long)]
        function: Option<String>,
    },
}

#[derive(ValueEnum, Clone, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    compiler::logging::init_with_level(level);

    let result = match cli.command {
        Commands::Optimize {
            file,
            config,
            passes,
            no_hoist,
            dominance,
            verify,
            events,
            output,
            format,
        } => {
            let options = OptimizeOptions {
                config,
                passes,
                no_hoist,
                dominance,
                verify,
                events,
                output,
                format,
            };
            optimize(file, options)
        }
        Commands::Alias { file, function } => show_alias(file, function),
        Commands::Ranges { file, function } => show_ranges(file, function),
        Commands::Loops { file, function } => show_loops(file, function),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct OptimizeOptions {
    config: Option<PathBuf>,
    passes: Option<Vec<String>>,
    no_hoist: bool,
    dominance: Option<DominanceMode>,
    verify: bool,
    events: bool,
    output: Option<PathBuf>,
    format: OutputFormat,
}

fn load_module(file: &Path) -> Result<IrModule, String> {
    if !file.exists() {
        return Err(format!("File not found: {}", file.display()));
    }
    IrModule::load(file).map_err(|e| format!("Failed to load {}: {}", file.display(), e))
}

/// Functions selected by `--function`, or all of them.
fn selected<'m>(module: &'m IrModule, name: &Option<String>) -> Result<Vec<&'m IrFunction>, String> {
    match name {
        Some(name) => module.function(name).map(|f| vec![f]).map_err(|e| e.to_string()),
        None => Ok(module.functions.iter().collect()),
    }
}

fn optimize(file: PathBuf, options: OptimizeOptions) -> Result<(), String> {
    let mut module = load_module(&file)?;

    let mut config = match &options.config {
        Some(path) => OptimizerConfig::load(path).map_err(|e| e.to_string())?,
        None => OptimizerConfig::default(),
    };
    if let Some(passes) = options.passes {
        config.passes = passes;
    }
    if options.no_hoist {
        config.checks_elimination.hoist_checks = false;
    }
    if let Some(dominance) = options.dominance {
        config.checks_elimination.dominance = dominance;
    }
    config.verify |= options.verify;

    let mut manager = PassManager::from_config(&config).map_err(|e| e.to_string())?;
    if options.events {
        manager.set_event_writer(Box::new(|event: &OptimizationEvent| match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => log::warn!("cannot serialize event: {}", e),
        }));
    }
    log::info!("running {} over {}", manager.pass_names().join(", "), file.display());

    let result = manager.run_module(&mut module).map_err(|e| e.to_string())?;
    log::info!(
        "{} instructions and {} blocks eliminated",
        result.instructions_eliminated,
        result.blocks_eliminated
    );
    if !result.invalidated.is_empty() {
        log::debug!("analyses to rebuild: {:?}", result.invalidated);
    }
    let mut stats: Vec<_> = result.stats.iter().collect();
    stats.sort();
    for (key, value) in stats {
        log::info!("  {}: {}", key, value);
    }

    match (options.output, options.format) {
        (Some(path), _) => module.save(&path).map_err(|e| e.to_string())?,
        (None, OutputFormat::Json) => println!("{}", module.to_json().map_err(|e| e.to_string())?),
        (None, OutputFormat::Text) => {
            for function in &module.functions {
                println!("{}", dump_function(function));
            }
        }
    }
    Ok(())
}

fn show_alias(file: PathBuf, function: Option<String>) -> Result<(), String> {
    let module = load_module(&file)?;
    for f in selected(&module, &function)? {
        let mut alias = AliasAnalysis::new(f);
        alias.run();
        println!("{}", alias.dump());
    }
    Ok(())
}

fn show_ranges(file: PathBuf, function: Option<String>) -> Result<(), String> {
    let module = load_module(&file)?;
    for f in selected(&module, &function)? {
        println!("{}", BoundsRangeInfo::compute(f).dump());
    }
    Ok(())
}

fn show_loops(file: PathBuf, function: Option<String>) -> Result<(), String> {
    let module = load_module(&file)?;
    for f in selected(&module, &function)? {
        let domtree = DominatorTree::compute(f);
        let loops = LoopNestInfo::analyze(f, &domtree);
        println!("loops of @{} ({} found)", f.name, loops.loops.len());
        for l in loops.loops_by_depth() {
            let blocks: Vec<String> = l.blocks.iter().map(|b| b.to_string()).collect();
            print!("{}{} depth={} blocks=[{}]", "  ".repeat(l.nesting_depth + 1), l.header, l.nesting_depth, blocks.join(", "));
            for (flag, set) in [
                ("irreducible", l.is_irreducible),
                ("osr", l.is_osr),
                ("try_catch", l.is_try_catch),
                ("infinite", l.is_infinite),
            ] {
                if set {
                    print!(" {}", flag);
                }
            }
            println!();

            if let Some(info) = CountableLoopParser::new(f, l).parse() {
                let trips = get_loop_iterations(f, &info).map_or_else(|| "?".to_string(), |n| n.to_string());
                println!(
                    "{}counted: {} = {}; {} {} {}; step {}{} (trips {}, {} exit)",
                    "  ".repeat(l.nesting_depth + 2),
                    info.index,
                    info.init,
                    info.index,
                    info.normalized_cc,
                    info.test,
                    if info.is_inc { "+" } else { "-" },
                    info.const_step,
                    trips,
                    if info.head_exit { "header" } else { "back-edge" }
                );
            }
        }
    }
    Ok(())
}
