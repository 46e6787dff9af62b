use std::io;
use std::path;

use anyhow::bail;
use anyhow::Result;
use clap::value_parser;
use clap::Arg;
use clap::ArgAction;
use clap::ArgMatches;
use clap::Command;
use clap_complete::generate;
use clap_complete::Generator;
use clap_complete::Shell;
use strum::VariantNames;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::commands;
use crate::configuration::Config;
use crate::configuration::ConfigKey;

fn print_completions<G: Generator>(gen: G, cmd: &mut Command) {
    generate(gen, cmd, cmd.get_name().to_string(), &mut io::stdout());
    std::process::exit(0);
}

async fn create_config_file() -> Result<()> {
    let config_file_path_str = Config::default(ConfigKey::ConfigFile);
    let config_file_path = path::PathBuf::from(&config_file_path_str);
    if config_file_path.exists() {
        bail!(format!(
            "Config file already exists at {config_file_path_str}"
        ));
    }

    if let Some(parent) = config_file_path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).await?;
        }
    }

    let mut file = fs::File::create(config_file_path.clone()).await?;
    file.write_all(Config::serialize_default(build()).as_bytes())
        .await?;

    println!("Created default config file at {config_file_path_str}");
    return Ok(());
}

/// Parses `key=value` pairs passed to `--meta`.
pub fn parse_metadata_pair(entry: &str) -> Result<(String, String), String> {
    let Some((key, value)) = entry.split_once('=') else {
        return Err(format!("expected key=value, got '{entry}'"));
    };

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in '{entry}'"));
    }

    return Ok((key.to_string(), value.trim().to_string()));
}

fn subcommand_completions() -> Command {
    return Command::new("completions")
        .about("Generates shell completions.")
        .arg(
            clap::Arg::new("shell")
                .short('s')
                .long("shell")
                .help("Which shell to generate completions for.")
                .action(ArgAction::Set)
                .value_parser(value_parser!(Shell))
                .required(true),
        );
}

fn subcommand_config() -> Command {
    return Command::new("config")
        .about("Configuration file options.")
        .subcommand(
            Command::new("create").about("Saves the default config file to the configuration file path. This command will fail if the file exists already.")
        )
        .subcommand(
            Command::new("default").about("Outputs the default configuration file to stdout.")
        )
        .subcommand(
            Command::new("path").about("Returns the default path for the configuration file.")
        );
}

fn subcommand_debug() -> Command {
    return Command::new("debug")
        .about("Debug helpers for Airdesk")
        .hide(true)
        .subcommand(
            Command::new("log-path").about("Output path to debug log file generated when running Airdesk with environment variable RUST_LOG=airdesk")
        )
        .subcommand(
            Command::new("enum-config").about("List all config keys as strings.")
        );
}

fn subcommand_request() -> Command {
    return Command::new("request")
        .about("Sends one request to the backend through the session client and prints the response.")
        .arg(
            Arg::new("method")
                .value_name("METHOD")
                .help("HTTP method, such as GET or POST.")
                .required(true),
        )
        .arg(
            Arg::new("path")
                .value_name("PATH")
                .help("Path relative to the base URL, or an absolute URL.")
                .required(true),
        )
        .arg(
            Arg::new("data")
                .short('d')
                .long("data")
                .num_args(1)
                .help("JSON body to send with the request."),
        );
}

fn subcommand_upload() -> Command {
    return Command::new("upload")
        .about("Uploads files one after another, reporting progress for each.")
        .arg(
            Arg::new("project")
                .short('p')
                .long("project")
                .num_args(1)
                .help("Project to upload into. Files go to the general document pool when omitted."),
        )
        .arg(
            Arg::new("meta")
                .short('m')
                .long("meta")
                .action(ArgAction::Append)
                .value_parser(parse_metadata_pair)
                .help("Extra key=value field sent with every file. Can be repeated."),
        )
        .arg(
            Arg::new("files")
                .value_name("FILES")
                .num_args(1..)
                .required(true)
                .help("Files to upload."),
        );
}

pub fn build() -> Command {
    let about = format!(
        "{}\n\nVersion: {}\nCommit: {}",
        env!("CARGO_PKG_DESCRIPTION"),
        env!("CARGO_PKG_VERSION"),
        env!("VERGEN_GIT_DESCRIBE")
    );

    return Command::new("airdesk")
        .about(about)
        .author(env!("CARGO_PKG_AUTHORS"))
        .version(env!("CARGO_PKG_VERSION"))
        .arg_required_else_help(true)
        .subcommand(subcommand_completions())
        .subcommand(subcommand_config())
        .subcommand(subcommand_debug())
        .subcommand(subcommand_request())
        .subcommand(subcommand_upload())
        .arg(
            Arg::new(ConfigKey::ConfigFile.to_string())
                .short('c')
                .long(ConfigKey::ConfigFile.to_string())
                .env("AIRDESK_CONFIG_FILE")
                .num_args(1)
                .help(format!("Path to configuration file [default: {}]", Config::default(ConfigKey::ConfigFile)))
                .global(true)
        )
        .arg(
            Arg::new(ConfigKey::BaseURL.to_string())
                .short('u')
                .long(ConfigKey::BaseURL.to_string())
                .env("AIRDESK_BASE_URL")
                .num_args(1)
                .help(format!("Base URL of the Airdesk backend API. [default: {}]", Config::default(ConfigKey::BaseURL)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::CsrfPath.to_string())
                .long(ConfigKey::CsrfPath.to_string())
                .env("AIRDESK_CSRF_PATH")
                .num_args(1)
                .help(format!("Endpoint returning the CSRF token for mutating requests. [default: {}]", Config::default(ConfigKey::CsrfPath)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::RefreshPath.to_string())
                .long(ConfigKey::RefreshPath.to_string())
                .env("AIRDESK_REFRESH_PATH")
                .num_args(1)
                .help(format!("Endpoint that renews the session after a 401 or 403. [default: {}]", Config::default(ConfigKey::RefreshPath)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::SignInURL.to_string())
                .long(ConfigKey::SignInURL.to_string())
                .env("AIRDESK_SIGN_IN_URL")
                .num_args(1)
                .help(format!("Where to send the user once the session cannot be renewed. [default: {}]", Config::default(ConfigKey::SignInURL)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::ProjectUploadPath.to_string())
                .long(ConfigKey::ProjectUploadPath.to_string())
                .env("AIRDESK_PROJECT_UPLOAD_PATH")
                .num_args(1)
                .help(format!("Upload endpoint for project documents. {{project}} is replaced with the project ID. [default: {}]", Config::default(ConfigKey::ProjectUploadPath)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::GeneralUploadPath.to_string())
                .long(ConfigKey::GeneralUploadPath.to_string())
                .env("AIRDESK_GENERAL_UPLOAD_PATH")
                .num_args(1)
                .help(format!("Upload endpoint for the general document pool. [default: {}]", Config::default(ConfigKey::GeneralUploadPath)))
                .global(true),
        )
        .arg(
            Arg::new(ConfigKey::RequestTimeout.to_string())
                .long(ConfigKey::RequestTimeout.to_string())
                .env("AIRDESK_REQUEST_TIMEOUT")
                .num_args(1)
                .help(format!("Time to wait in milliseconds before timing out a JSON request. 0 disables it. [default: {}]", Config::default(ConfigKey::RequestTimeout)))
                .global(true),
        );
}

async fn run_command(name: &str, matches: &ArgMatches, subcmd_matches: &ArgMatches) -> Result<()> {
    Config::load(vec![matches, subcmd_matches]).await?;

    match name {
        "request" => {
            let method = subcmd_matches
                .get_one::<String>("method")
                .map(|method| return method.to_string())
                .unwrap_or_default();
            let path = subcmd_matches
                .get_one::<String>("path")
                .map(|path| return path.to_string())
                .unwrap_or_default();
            let data = subcmd_matches.get_one::<String>("data").cloned();

            return commands::run_request(&method, &path, data).await;
        }
        "upload" => {
            let project = subcmd_matches.get_one::<String>("project").cloned();
            let metadata = subcmd_matches
                .get_many::<(String, String)>("meta")
                .map(|pairs| return pairs.cloned().collect::<Vec<(String, String)>>())
                .unwrap_or_default();
            let files = subcmd_matches
                .get_many::<String>("files")
                .map(|files| return files.cloned().collect::<Vec<String>>())
                .unwrap_or_default();

            return commands::run_upload(project, metadata, files).await;
        }
        _ => {
            bail!(format!("Unknown command {name}"));
        }
    }
}

pub async fn parse() -> Result<()> {
    let matches = build().get_matches();

    match matches.subcommand() {
        Some(("debug", debug_matches)) => match debug_matches.subcommand() {
            Some(("log-path", _)) => {
                let log_path = dirs::cache_dir()
                    .unwrap_or_else(|| return path::PathBuf::from("."))
                    .join("airdesk/debug.log");
                println!("{}", log_path.to_string_lossy());
            }
            Some(("enum-config", _)) => {
                let res = ConfigKey::VARIANTS.join("\n");
                println!("{}", res);
            }
            _ => {
                subcommand_debug().print_long_help()?;
            }
        },
        Some(("completions", subcmd_matches)) => {
            if let Some(completions) = subcmd_matches.get_one::<Shell>("shell").copied() {
                let mut app = build();
                print_completions(completions, &mut app);
            }
        }
        Some(("config", subcmd_matches)) => match subcmd_matches.subcommand() {
            Some(("create", _)) => {
                create_config_file().await?;
            }
            Some(("default", _)) => {
                println!("{}", Config::serialize_default(build()));
            }
            Some(("path", _)) => {
                println!("{}", Config::default(ConfigKey::ConfigFile));
            }
            _ => {
                subcommand_config().print_long_help()?;
            }
        },
        Some((name, subcmd_matches)) => {
            run_command(name, &matches, subcmd_matches).await?;
        }
        None => {
            build().print_long_help()?;
        }
    }

    return Ok(());
}
