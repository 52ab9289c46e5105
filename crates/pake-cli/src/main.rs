//! The `pake` command-line front-end.
//!
//! Exit codes: 0 success, 1 recipe/build failure, 2 usage or registry
//! error, 3 interrupted.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use owo_colors::{OwoColorize, Stream};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use pake_core::{BuildError, DepTree, Engine, Force};
use pake_lua::HostError;

mod signal;

#[derive(Parser)]
#[command(name = "pake", version, about = "A content-addressed build engine scripted in Lua")]
struct Cli {
  /// Targets to build; defaults to the `default` target
  targets: Vec<String>,

  /// Build script to evaluate [default: Pakefile or Pakefile.lua]
  #[arg(short = 'f', long)]
  pakefile: Option<PathBuf>,

  /// State file location [default: .pake-state under the root]
  #[arg(long)]
  statefile: Option<PathBuf>,

  /// Run with a different engine root
  #[arg(short = 'C', long, value_name = "DIR")]
  chdir: Option<PathBuf>,

  /// Rebuild the listed targets even if they appear up to date
  #[arg(long)]
  rebuild: bool,

  /// Rebuild everything, dependencies included
  #[arg(long)]
  rebuild_all: bool,

  /// Print the dependency tree of each target instead of building
  #[arg(long)]
  graph: bool,

  /// Print more (repeat for recipe-level detail)
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  /// Print less (repeat to silence everything but errors)
  #[arg(short, long, action = clap::ArgAction::Count)]
  quiet: u8,
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_logging(&cli);

  match run(&cli) {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      let line = err.to_string();
      eprintln!("{}", line.if_supports_color(Stream::Stderr, |t| t.red()));
      ExitCode::from(err.exit_code())
    }
  }
}

fn init_logging(cli: &Cli) {
  let level = match cli.verbose as i8 - cli.quiet as i8 {
    i8::MIN..=-2 => None,
    -1 => Some(Level::ERROR),
    0 => Some(Level::INFO),
    1 => Some(Level::DEBUG),
    _ => Some(Level::TRACE),
  };
  if let Some(level) = level {
    FmtSubscriber::builder()
      .with_max_level(level)
      .with_target(false)
      .without_time()
      .with_writer(std::io::stderr)
      .init();
  }
}

/// A CLI-level failure: either an engine error or a host-side one, each with
/// its own exit category.
enum CliError {
  Build(BuildError),
  Host(HostError),
}

impl CliError {
  fn exit_code(&self) -> u8 {
    match self {
      // Build script problems are usage errors, like a missing Makefile.
      CliError::Host(_) => 2,
      CliError::Build(err) => err.exit_code() as u8,
    }
  }
}

impl std::fmt::Display for CliError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CliError::Build(err) => write!(f, "{err}"),
      CliError::Host(err) => write!(f, "{err}"),
    }
  }
}

fn run(cli: &Cli) -> Result<(), CliError> {
  let root = cli.chdir.clone().unwrap_or_else(|| PathBuf::from("."));

  let engine = match &cli.statefile {
    Some(path) => Engine::with_state_path(&root, path),
    None => Engine::new(&root),
  }
  .map_err(CliError::Build)?;

  signal::register_sigint(engine.interrupt_flag());

  let pakefile = match &cli.pakefile {
    Some(path) => path.clone(),
    None => pake_lua::find_pakefile(engine.root()).map_err(CliError::Host)?,
  };

  let engine = Rc::new(RefCell::new(engine));
  let _host = pake_lua::evaluate_pakefile(&engine, &pakefile).map_err(CliError::Host)?;

  if cli.graph {
    return print_graphs(&engine.borrow(), &cli.targets).map_err(CliError::Build);
  }

  let force = if cli.rebuild_all {
    Force::All
  } else if cli.rebuild {
    Force::Listed
  } else {
    Force::None
  };

  let rebuilt = engine
    .borrow_mut()
    .build_with(&cli.targets, force)
    .map_err(CliError::Build)?;

  match rebuilt {
    0 => println!("pake: nothing to do"),
    1 => println!("pake: built 1 target"),
    n => println!("pake: built {n} targets"),
  }
  Ok(())
}

fn print_graphs(engine: &Engine, targets: &[String]) -> Result<(), BuildError> {
  let targets: Vec<String> = if targets.is_empty() {
    vec![pake_core::DEFAULT_TARGET.to_string()]
  } else {
    targets.to_vec()
  };
  for target in &targets {
    let tree = engine.dependency_tree(target)?;
    print_tree(&tree, 0);
  }
  Ok(())
}

fn print_tree(tree: &DepTree, indent: usize) {
  println!("{}{}", "  ".repeat(indent), tree.name);
  for dep in &tree.deps {
    print_tree(dep, indent + 1);
  }
}
