// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: options file path
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .help("Options file path")
}

/// Common argument: repository root
fn repository_arg() -> Arg {
    Arg::new("repository")
        .short('r')
        .long("repository")
        .value_name("DIR")
        .help("Repository root directory")
}

fn build_cli() -> Command {
    Command::new("tailor")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Tailor Contributors")
        .about("Configuration-management server that synthesizes per-host configurations")
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Run the configuration server")
                .arg(config_arg())
                .arg(repository_arg())
                .arg(
                    Arg::new("listen")
                        .short('l')
                        .long("listen")
                        .help("Bind address for the RPC listener"),
                ),
        )
        .subcommand(
            Command::new("check")
                .about("Load the repository and validate every declared client")
                .arg(config_arg())
                .arg(repository_arg()),
        )
        .subcommand(
            Command::new("config")
                .about("Synthesize and print one client's configuration")
                .arg(Arg::new("client").required(true).help("Client name"))
                .arg(config_arg())
                .arg(repository_arg()),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "zsh", "fish", "powershell"])
                        .help("Shell type"),
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

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("tailor.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}
