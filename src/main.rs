mod engine;
mod loader;
mod matcher;
mod runner;
mod schema;
mod session;

use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use engine::{DockerEngine, ProcessEngine, SandboxEngine};
use runner::{RunnerConfig, SpecRunner, TestResult};

#[derive(Clone, Copy, Default, ValueEnum)]
enum OutputFormat {
    /// Human-readable output with checkmarks
    #[default]
    Human,
    /// Machine-readable JSON output
    Json,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum EngineKind {
    /// Local shell processes (no isolation, no image required)
    #[default]
    Process,
    /// Docker containers via the docker CLI
    Docker,
}

#[derive(Parser)]
#[command(name = "sandtest")]
#[command(about = "A declarative integration test runner for CLIs in ephemeral sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute test specs
    Run {
        /// Path to test specs (file or directory)
        path: PathBuf,
        /// Sandbox engine to run tests in
        #[arg(long, default_value = "process")]
        engine: EngineKind,
        /// Sandbox image reference (required for the docker engine)
        #[arg(short, long)]
        image: Option<String>,
        /// Host environment variable to forward into sandboxes (repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,
        /// Filter tests by name pattern (substring match)
        #[arg(short, long)]
        filter: Option<String>,
        /// Output format
        #[arg(short, long, default_value = "human")]
        output: OutputFormat,
    },
    /// Validate test specs without running them
    Validate {
        /// Path to test specs (file or directory)
        path: PathBuf,
    },
    /// Scaffold a new spec file
    Init {
        /// Output path for the new spec file
        #[arg(default_value = "tests/example.yaml")]
        path: PathBuf,
    },
    /// Output the spec schema (for editors and AI consumers)
    Schema,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            path,
            engine,
            image,
            env,
            filter,
            output,
        } => run(path, engine, image, env, filter, output),
        Command::Validate { path } => validate(path),
        Command::Init { path } => init(path),
        Command::Schema => {
            let schema = schema::generate_schema();
            match serde_json::to_string_pretty(&schema) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing schema: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}

fn run(
    path: PathBuf,
    engine: EngineKind,
    image: Option<String>,
    env: Vec<String>,
    filter: Option<String>,
    output: OutputFormat,
) {
    // The process engine never inspects the image, so it gets a stand-in;
    // the docker engine has no sensible default and must be told.
    let image = match engine {
        EngineKind::Process => Some(image.unwrap_or_else(|| "local".to_string())),
        EngineKind::Docker => image,
    };
    let config = match RunnerConfig::new(image, env) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e} (use --image with the docker engine)");
            std::process::exit(1);
        }
    };
    let engine: Arc<dyn SandboxEngine> = match engine {
        EngineKind::Process => Arc::new(ProcessEngine::new()),
        EngineKind::Docker => Arc::new(DockerEngine::new()),
    };
    let runner = SpecRunner::new(engine, config);

    let spec_paths = match loader::find_spec_files(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error finding specs: {e}");
            std::process::exit(1);
        }
    };
    if spec_paths.is_empty() {
        eprintln!("No spec files found at: {}", path.display());
        std::process::exit(1);
    }

    let mut json_results = Vec::new();
    let mut total_passed = 0;
    let mut total_failed = 0;
    let filter_ref = filter.as_deref();

    for spec_path in &spec_paths {
        let specs = match loader::load_specs(spec_path) {
            Ok(specs) => specs,
            Err(e) => {
                eprintln!("✗ Failed to load {}: {e}", spec_path.display());
                total_failed += 1;
                continue;
            }
        };

        let file_results: Vec<TestResult> = specs
            .iter()
            .filter(|spec| filter_ref.is_none_or(|f| spec.test.contains(f)))
            .flat_map(|spec| runner.run_spec(spec))
            .collect();

        for test in &file_results {
            if test.passed {
                total_passed += 1;
            } else {
                total_failed += 1;
            }
        }

        match output {
            OutputFormat::Human => {
                println!("\n{}", spec_path.display());
                for test in &file_results {
                    if test.passed {
                        println!("  ✓ {} ({:.2?})", test.name, test.duration);
                    } else {
                        println!("  ✗ {} ({:.2?})", test.name, test.duration);
                        for failure in &test.failures {
                            println!("    {failure}");
                        }
                    }
                }
            }
            OutputFormat::Json => {
                json_results.push(serde_json::json!({
                    "file": spec_path.display().to_string(),
                    "tests": file_results,
                }));
            }
        }
    }

    match output {
        OutputFormat::Human => {
            println!("\n{total_passed} passed, {total_failed} failed");
        }
        OutputFormat::Json => {
            let summary = serde_json::json!({
                "passed": total_passed,
                "failed": total_failed,
                "results": json_results,
            });
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("Error serializing results: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    if total_failed > 0 {
        std::process::exit(1);
    }
}

fn validate(path: PathBuf) {
    let spec_paths = match loader::find_spec_files(&path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error finding specs: {e}");
            std::process::exit(1);
        }
    };
    if spec_paths.is_empty() {
        eprintln!("No spec files found at: {}", path.display());
        std::process::exit(1);
    }

    let mut errors = 0;
    for spec_path in &spec_paths {
        match loader::load_specs(spec_path) {
            Ok(specs) => {
                let cases: usize = specs.iter().map(|s| s.concrete_cases().len()).sum();
                println!("✓ {} ({cases} tests)", spec_path.display());
            }
            Err(e) => {
                eprintln!("✗ {}: {e}", spec_path.display());
                errors += 1;
            }
        }
    }

    if errors > 0 {
        eprintln!("\n{errors} spec(s) failed validation");
        std::process::exit(1);
    }
    println!("\nAll {} spec(s) valid", spec_paths.len());
}

fn init(path: PathBuf) {
    let template = r##"- test: example test
  setup:
    - mkdir work
  cleanup:
    - rm -r work
  steps:
    - in: echo hello world
      out: hello world
    - in: ls work | wc -l
      out: "#"
    - in: cat work/missing.txt
      err: "cat: %"
      exit: 1
"##;
    if path.exists() {
        eprintln!("Error: file already exists: {}", path.display());
        std::process::exit(1);
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
        && let Err(e) = fs::create_dir_all(parent)
    {
        eprintln!("Error creating directory: {e}");
        std::process::exit(1);
    }
    if let Err(e) = fs::write(&path, template) {
        eprintln!("Error writing file: {e}");
        std::process::exit(1);
    }
    println!("Created: {}", path.display());
}
