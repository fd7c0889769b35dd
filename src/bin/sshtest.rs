//! SSH test client CLI
//!
//! Simple tool for testing agentssh connections.
//!
//! Usage:
//!   cargo run --bin sshtest -- --cmd "uname -a"
//!   cargo run --bin sshtest -- --pty xterm --cmd "tput cols" --cmd "echo \$TERM"

use anyhow::Result;
use agentssh::testing::SshTestClient;

#[derive(Default)]
struct Args {
    addr: String,
    username: String,
    commands: Vec<String>,
    env: Vec<(String, String)>,
    pty: Option<String>,
    raw: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        addr: "localhost:2222".to_string(),
        username: whoami::username(),
        ..Default::default()
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--addr" | "-a" => {
                args.addr = iter.next().ok_or_else(|| anyhow::anyhow!("--addr requires value"))?;
            }
            "--user" | "-u" => {
                args.username = iter.next().ok_or_else(|| anyhow::anyhow!("--user requires value"))?;
            }
            "--cmd" | "-c" => {
                args.commands.push(iter.next().ok_or_else(|| anyhow::anyhow!("--cmd requires value"))?);
            }
            "--env" | "-e" => {
                let pair = iter.next().ok_or_else(|| anyhow::anyhow!("--env requires value"))?;
                let (name, value) = pair
                    .split_once('=')
                    .ok_or_else(|| anyhow::anyhow!("--env expects NAME=VALUE"))?;
                args.env.push((name.to_string(), value.to_string()));
            }
            "--pty" | "-t" => {
                args.pty = Some(iter.next().ok_or_else(|| anyhow::anyhow!("--pty requires value"))?);
            }
            "--raw" | "-r" => {
                args.raw = true;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => {
                eprintln!("unknown argument: {}", other);
                print_help();
                std::process::exit(1);
            }
        }
    }

    Ok(args)
}

fn print_help() {
    eprintln!(
        r#"sshtest - SSH test client for agentssh

USAGE:
    sshtest [OPTIONS] --cmd <COMMAND>...

OPTIONS:
    -a, --addr <ADDR>      Server address [default: localhost:2222]
    -u, --user <NAME>      Username [default: current user]
    -c, --cmd <COMMAND>    Command to run, each on its own channel (can be repeated)
    -e, --env <NAME=VALUE> Environment variable to send (can be repeated)
    -t, --pty <TERM>       Allocate a pty of this type
    -r, --raw              Print raw bytes (hex dump)
    -h, --help             Print help

EXAMPLES:
    sshtest --cmd "uname -a"
    sshtest --env CODER_SSH_SESSION_TYPE=vscode --cmd "env | sort"
    sshtest --addr 192.168.1.10:2222 --pty xterm-256color --cmd "stty size"
"#
    );
}

fn print_bytes(bytes: &[u8], raw: bool) {
    if raw {
        for (i, chunk) in bytes.chunks(16).enumerate() {
            print!("{:04x}: ", i * 16);
            for byte in chunk {
                print!("{:02x} ", byte);
            }
            print!("  ");
            for byte in chunk {
                if byte.is_ascii_graphic() || *byte == b' ' {
                    print!("{}", *byte as char);
                } else {
                    print!(".");
                }
            }
            println!();
        }
    } else {
        print!("{}", String::from_utf8_lossy(bytes));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args()?;

    if args.commands.is_empty() {
        eprintln!("error: at least one --cmd is required");
        print_help();
        std::process::exit(1);
    }

    eprintln!("connecting to {} as {}...", args.addr, args.username);
    let client = SshTestClient::connect(&args.addr, &args.username).await?;

    let env: Vec<(&str, &str)> = args
        .env
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_str()))
        .collect();

    for cmd in &args.commands {
        eprintln!("> {}", cmd);
        let output = match &args.pty {
            Some(term) => client.exec_pty(cmd, term).await?,
            None => client.exec_env(cmd, &env).await?,
        };

        eprintln!("--- stdout ({} bytes) ---", output.stdout.len());
        print_bytes(&output.stdout, args.raw);
        if !output.stderr.is_empty() {
            eprintln!("--- stderr ({} bytes) ---", output.stderr.len());
            print_bytes(&output.stderr, args.raw);
        }
        match output.exit_status {
            Some(code) => eprintln!("--- exit status {} ---", code),
            None => eprintln!("--- closed without exit status ---"),
        }
    }

    client.close().await?;
    eprintln!("disconnected");

    Ok(())
}
