use std::path::PathBuf;

use clap::{App, Arg, ArgMatches};

use faster_than_light::dispatcher::{run_ftl_module, run_module, RunOptions};
use faster_than_light::inventory::load_inventory;
use faster_than_light::refs::ArgValue;

const ABOUT: &str = r#"
Run an automation module across an inventory of hosts.

Hosts marked with ansible_connection: local run the module on this machine.
Every other host is reached over ssh: a self-contained gate archive is built
(and cached under ~/.ftl), uploaded once per host, and then fed module
execution requests over its stdin/stdout.
"#;

const ARG_INVENTORY: &str = "inventory";
const ARG_MODULE: &str = "module";
const ARG_FTL_MODULE: &str = "ftl_module";
const ARG_MODULE_DIR: &str = "module_dir";
const ARG_REQUIREMENTS: &str = "requirements";
const ARG_MODULE_ARGS: &str = "args";
const ARG_DEBUG: &str = "debug";
const ARG_VERBOSE: &str = "verbose";

#[tokio::main]
pub async fn main() -> Result<(), anyhow::Error> {
    let matches = App::new("ftl")
        .version(clap::crate_version!())
        .about(ABOUT)
        .arg(
            Arg::with_name(ARG_INVENTORY)
                .short("i")
                .long("inventory")
                .value_name("INVENTORY_YML")
                .help("the inventory file of hosts to run against")
                .takes_value(true)
                .required(true),
        )
        .arg(
            Arg::with_name(ARG_MODULE)
                .short("m")
                .long("module")
                .value_name("MODULE")
                .help("an Ansible-compatible module to execute")
                .takes_value(true),
        )
        .arg(
            Arg::with_name(ARG_FTL_MODULE)
                .short("f")
                .long("ftl-module")
                .value_name("MODULE")
                .help("an FTL-native module to execute")
                .takes_value(true),
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
            Arg::with_name(ARG_MODULE_ARGS)
                .short("a")
                .long("args")
                .value_name("K=V ...")
                .help("module arguments as space-separated key=value pairs")
                .takes_value(true),
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

    init_logging(&matches);

    let inventory = load_inventory(matches.value_of(ARG_INVENTORY).unwrap())?;
    let module_dirs: Vec<PathBuf> = matches
        .values_of(ARG_MODULE_DIR)
        .map(|dirs| dirs.map(PathBuf::from).collect())
        .unwrap_or_default();

    let dependencies = match matches.value_of(ARG_REQUIREMENTS) {
        Some(path) => std::fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    };

    let options = RunOptions {
        dependencies,
        module_args: parse_module_args(matches.value_of(ARG_MODULE_ARGS).unwrap_or(""))?,
        ..Default::default()
    };

    let results = match (
        matches.value_of(ARG_MODULE),
        matches.value_of(ARG_FTL_MODULE),
    ) {
        (Some(module), None) => {
            run_module(&inventory, &module_dirs, module, options, None).await?
        }
        (None, Some(ftl_module)) => {
            run_ftl_module(&inventory, &module_dirs, ftl_module, options, None).await?
        }
        (Some(_), Some(_)) => {
            anyhow::bail!("Cannot specify both --ftl-module and --module")
        }
        (None, None) => {
            anyhow::bail!("Must specify either --ftl-module or --module")
        }
    };

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

fn init_logging(matches: &ArgMatches) {
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
}

/// Parse `"k=v k=v ..."` into module arguments. Values are always strings;
/// there is no quoting mechanism.
fn parse_module_args(args: &str) -> anyhow::Result<Vec<(String, ArgValue)>> {
    let mut parsed = Vec::new();
    for pair in args.split_whitespace() {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid module argument {}, expected key=value", pair))?;
        if key.is_empty() {
            anyhow::bail!("Module argument {} has an empty key", pair);
        }
        parsed.push((key.to_string(), ArgValue::from(value)));
    }
    Ok(parsed)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        let args = parse_module_args("path=/tmp/test state=touch").expect("args should parse");
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].0, "path");
        assert_eq!(args[1].0, "state");
    }

    #[test]
    fn empty_string_parses_to_no_args() {
        assert!(parse_module_args("").unwrap().is_empty());
    }

    #[test]
    fn missing_equals_fails() {
        parse_module_args("oops").expect_err("bare word should not parse");
    }

    #[test]
    fn empty_key_fails() {
        parse_module_args("=value").expect_err("empty key should not parse");
    }

    #[test]
    fn empty_value_is_allowed() {
        let args = parse_module_args("key=").unwrap();
        assert_eq!(args.len(), 1);
    }
}
