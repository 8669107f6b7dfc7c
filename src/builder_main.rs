use std::path::PathBuf;

use clap::{App, Arg};

use faster_than_light::gate_builder::build_ftl_gate;
use faster_than_light::local_runner::DEFAULT_LOCAL_INTERPRETER;

const ABOUT: &str = r#"
Build a gate archive without running anything.

The gate is a self-contained executable archive holding the helper runtime,
the requested modules and any pip-installed dependencies. It is cached under
~/.ftl by a hash of its inputs, so rebuilding with the same inputs is free.
"#;

const ARG_MODULE: &str = "module";
const ARG_FTL_MODULE: &str = "ftl_module";
const ARG_MODULE_DIR: &str = "module_dir";
const ARG_REQUIREMENTS: &str = "requirements";
const ARG_INTERPRETER: &str = "interpreter";
const ARG_DEBUG: &str = "debug";
const ARG_VERBOSE: &str = "verbose";

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let matches = App::new("ftl-gate-builder")
        .version(clap::crate_version!())
        .about(ABOUT)
        .arg(
            Arg::with_name(ARG_MODULE)
                .short("m")
                .long("module")
                .value_name("MODULE")
                .help("a module to bundle into the gate; can be used multiple times")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name(ARG_FTL_MODULE)
                .short("f")
                .long("ftl-module")
                .value_name("MODULE")
                .help("an FTL-native module to bundle; can be used multiple times")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name(ARG_MODULE_DIR)
                .short("M")
                .long("module-dir")
                .value_name("DIR")
                .help("a directory to search for modules; can be used multiple times")
                .takes_value(true)
                .multiple(true),
        )
        .arg(
            Arg::with_name(ARG_REQUIREMENTS)
                .short("r")
                .long("requirements")
                .value_name("REQUIREMENTS_TXT")
                .help("python requirements to install into the gate")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(ARG_INTERPRETER)
                .short("I")
                .long("interpreter")
                .value_name("PYTHON")
                .help("the python interpreter on the target system")
                .takes_value(true)
                .default_value("/usr/bin/python3"),
        )
        .arg(
            Arg::with_name(ARG_DEBUG)
                .long("debug")
                .help("show debug logging"),
        )
        .arg(
            Arg::with_name(ARG_VERBOSE)
                .short("v")
                .long("verbose")
                .help("show verbose logging"),
        )
        .get_matches();

    let filter = if matches.is_present(ARG_DEBUG) {
        tracing_subscriber::EnvFilter::new("debug")
    } else if matches.is_present(ARG_VERBOSE) {
        tracing_subscriber::EnvFilter::new("info")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let mut modules: Vec<String> = matches
        .values_of(ARG_MODULE)
        .map(|m| m.map(str::to_string).collect())
        .unwrap_or_default();
    if let Some(ftl_modules) = matches.values_of(ARG_FTL_MODULE) {
        modules.extend(ftl_modules.map(str::to_string));
    }

    let module_dirs: Vec<PathBuf> = matches
        .values_of(ARG_MODULE_DIR)
        .map(|dirs| dirs.map(PathBuf::from).collect())
        .unwrap_or_default();

    let dependencies: Vec<String> = match matches.value_of(ARG_REQUIREMENTS) {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };

    let interpreter = matches.value_of(ARG_INTERPRETER).unwrap();

    let (gate_path, gate_hash) = build_ftl_gate(
        &modules,
        &module_dirs,
        &dependencies,
        interpreter,
        DEFAULT_LOCAL_INTERPRETER,
        None,
    )
    .await?;

    println!("{} {}", gate_path.display(), gate_hash);
    Ok(())
}
