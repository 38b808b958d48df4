// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .default_value("/etc/apprelay/apprelay.toml")
        .help("Configuration file")
}

fn build_cli() -> Command {
    Command::new("apprelay")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Apprelay Contributors")
        .about("Publish application versions and rotate their deployments")
        .subcommand_required(false)
        .subcommand(
            Command::new("compare")
                .about("Compare two version strings")
                .arg(Arg::new("a").required(true))
                .arg(Arg::new("b").required(true)),
        )
        .subcommand(
            Command::new("lock-check")
                .about("Check whether a version is blocked by a lock pattern")
                .arg(Arg::new("version").required(true))
                .arg(Arg::new("pattern").help("Wildcard pattern, e.g. 19.42.2.x")),
        )
        .subcommand(
            Command::new("family")
                .about("List the versions of an application family")
                .arg(Arg::new("name").required(true).help("Application display name"))
                .arg(config_arg()),
        )
        .subcommand(
            Command::new("publish")
                .about("Publish newly registered versions into their families")
                .arg(config_arg())
                .arg(
                    Arg::new("app")
                        .long("app")
                        .value_name("NAME=ID")
                        .required(true)
                        .action(ArgAction::Append)
                        .help("Application to publish as NAME=ID (repeatable)"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Publish even when locked or already present"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print outcomes as JSON"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();
    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("apprelay.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
