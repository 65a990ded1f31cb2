//! nftgate - quota, allow-list and port-forward manager for nftables
//!
//! # Usage
//!
//! ```bash
//! nftgate quota list
//! nftgate quota add 8080 50000000 --protocol tcp --comment web
//! nftgate quota reset inet_filter_output_12_8080
//! nftgate port add 22
//! nftgate forward add 9000 10.0.0.5 22 --protocol tcp
//! nftgate forward disable fwd_9000
//! nftgate save                      # snapshot the ruleset
//! nftgate --json forward list       # machine-readable output
//! ```

use clap::{Parser, Subcommand};
use nftgate::core::error::NftablesErrorPattern;
use nftgate::{Config, Controller, Error, ForwardRequest, ForwardTarget};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::Level;

#[derive(Parser)]
#[command(name = "nftgate")]
#[command(about = "Port quotas, allow-lists and port forwarding on top of nftables", long_about = None)]
struct Cli {
    /// Configuration file (default: /etc/nftgate/config.json if present)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bandwidth quotas on local source ports
    #[command(subcommand)]
    Quota(QuotaCommand),
    /// Allowed inbound ports
    #[command(subcommand)]
    Port(PortCommand),
    /// Port forwards (DNAT + masquerade)
    #[command(subcommand)]
    Forward(ForwardCommand),
    /// Print the full ruleset as nft reports it
    Dump,
    /// Snapshot the ruleset to the configured path
    Save,
    /// Replace the ruleset with the saved snapshot
    Restore,
}

#[derive(Subcommand)]
enum QuotaCommand {
    List,
    Add {
        port: u16,
        /// Limit in bytes (rounded up to whole megabytes)
        bytes: u64,
        #[arg(short, long, default_value = "both")]
        protocol: String,
        #[arg(short, long, default_value = "")]
        comment: String,
    },
    Modify {
        id: String,
        bytes: u64,
    },
    Delete {
        id: String,
    },
    /// Zero the counter of a quota
    Reset {
        id: String,
    },
    /// Reset several quotas, stopping at the first failure
    BatchReset {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PortCommand {
    List,
    Add { port: u16 },
    /// Delete a managed allow rule by handle
    Delete { handle: u64 },
}

#[derive(clap::Args)]
struct TargetArgs {
    dst_ip: String,
    dst_port: u16,
    #[arg(short, long, default_value = "both")]
    protocol: String,
    #[arg(short, long, default_value = "")]
    comment: String,
    /// Bandwidth limit in Mbps (0 = unlimited)
    #[arg(short, long, default_value_t = 0)]
    limit: u32,
}

impl From<TargetArgs> for ForwardTarget {
    fn from(args: TargetArgs) -> Self {
        Self {
            dst_ip: args.dst_ip,
            dst_port: args.dst_port,
            protocol: args.protocol,
            comment: args.comment,
            limit_mbps: args.limit,
        }
    }
}

#[derive(Subcommand)]
enum ForwardCommand {
    List,
    Add {
        src_port: u16,
        #[command(flatten)]
        target: TargetArgs,
    },
    Edit {
        id: String,
        #[command(flatten)]
        target: TargetArgs,
    },
    Delete {
        id: String,
    },
    Enable {
        id: String,
    },
    Disable {
        id: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &Error) {
    eprintln!("Error: {e}");
    let raw = match e {
        Error::Nftables { message, .. } => Some(message.as_str()),
        Error::Timeout { .. } => Some("timed out"),
        Error::BatchItem { source, .. } => match source.as_ref() {
            Error::Nftables { message, .. } => Some(message.as_str()),
            _ => None,
        },
        _ => None,
    };
    if let Some(raw) = raw {
        let translation = NftablesErrorPattern::match_error(raw);
        eprintln!("  {}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

/// Prints `value` as pretty JSON or through `human`.
fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> nftgate::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

async fn run(cli: Cli) -> nftgate::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let ctl = Controller::from_config(&config);
    let json = cli.json;

    match cli.command {
        Commands::Quota(cmd) => match cmd {
            QuotaCommand::List => emit(json, &ctl.list_quotas().await?, |quotas| {
                println!(
                    "{:<36} {:>6} {:>5} {:>14} {:>14} {:>7}  {:<9} COMMENT",
                    "ID", "PORT", "PROTO", "LIMIT", "USED", "USE%", "STATUS"
                );
                for q in quotas {
                    println!(
                        "{:<36} {:>6} {:>5} {:>14} {:>14} {:>6.1}%  {:<9} {}",
                        q.id,
                        q.port,
                        q.protocol,
                        q.quota_bytes,
                        q.used_bytes,
                        q.usage_percent,
                        q.status,
                        q.comment
                    );
                }
            })?,
            QuotaCommand::Add {
                port,
                bytes,
                protocol,
                comment,
            } => {
                let quota = ctl.add_quota(port, &protocol, bytes, &comment).await?;
                emit(json, &quota, |q| println!("Added quota {}", q.id))?;
            }
            QuotaCommand::Modify { id, bytes } => {
                ctl.modify_quota(&id, bytes).await?;
                println!("Modified quota {id}");
            }
            QuotaCommand::Delete { id } => {
                ctl.delete_quota(&id).await?;
                println!("Deleted quota {id}");
            }
            QuotaCommand::Reset { id } => {
                ctl.reset_quota(&id).await?;
                println!("Reset quota {id}");
            }
            QuotaCommand::BatchReset { ids } => {
                ctl.batch_reset(&ids).await?;
                println!("Reset {} quotas", ids.len());
            }
        },
        Commands::Port(cmd) => match cmd {
            PortCommand::List => emit(json, &ctl.list_allowed_ports().await?, |ports| {
                println!("{:>6} {:>8} {:<8} COMMENT", "PORT", "HANDLE", "MANAGED");
                for p in ports {
                    println!(
                        "{:>6} {:>8} {:<8} {}",
                        p.port,
                        p.handle,
                        if p.managed { "yes" } else { "no" },
                        p.comment
                    );
                }
            })?,
            PortCommand::Add { port } => {
                let allowed = ctl.add_allowed_port(port).await?;
                emit(json, &allowed, |p| {
                    println!("Allowed port {} (handle {})", p.port, p.handle);
                })?;
            }
            PortCommand::Delete { handle } => {
                ctl.delete_allowed_port(handle).await?;
                println!("Removed allowed port with handle {handle}");
            }
        },
        Commands::Forward(cmd) => match cmd {
            ForwardCommand::List => emit(json, &ctl.list_forwards().await?, |rules| {
                println!(
                    "{:<11} {:>6} {:<21} {:>5} {:<8} {:>6} {:<7} COMMENT",
                    "ID", "SRC", "DESTINATION", "PROTO", "STATE", "LIMIT", "MANAGED"
                );
                for r in rules {
                    println!(
                        "{:<11} {:>6} {:<21} {:>5} {:<8} {:>6} {:<7} {}",
                        r.id,
                        r.src_port,
                        format!("{}:{}", r.dst_ip, r.dst_port),
                        r.protocol,
                        if r.enabled { "enabled" } else { "disabled" },
                        r.limit_mbps,
                        if r.managed { "yes" } else { "no" },
                        r.comment
                    );
                }
            })?,
            ForwardCommand::Add { src_port, target } => {
                let request = ForwardRequest {
                    src_port,
                    target: target.into(),
                };
                let rule = ctl.add_forward(&request).await?;
                emit(json, &rule, |r| println!("Added forward {}", r.id))?;
            }
            ForwardCommand::Edit { id, target } => {
                let rule = ctl.edit_forward(&id, &target.into()).await?;
                emit(json, &rule, |r| println!("Edited forward {}", r.id))?;
            }
            ForwardCommand::Delete { id } => {
                ctl.delete_forward(&id).await?;
                println!("Deleted forward {id}");
            }
            ForwardCommand::Enable { id } => {
                ctl.enable_forward(&id).await?;
                println!("Enabled forward {id}");
            }
            ForwardCommand::Disable { id } => {
                ctl.disable_forward(&id).await?;
                println!("Disabled forward {id}");
            }
        },
        Commands::Dump => print!("{}", ctl.raw_ruleset().await?),
        Commands::Save => {
            let checksum = ctl.save_ruleset().await?;
            println!(
                "Saved ruleset to {} (sha256 {checksum})",
                config.ruleset_path.display()
            );
        }
        Commands::Restore => {
            if ctl.restore_ruleset().await? {
                println!("Restored ruleset from {}", config.ruleset_path.display());
            } else {
                println!("No snapshot at {}", config.ruleset_path.display());
            }
        }
    }
    Ok(())
}
