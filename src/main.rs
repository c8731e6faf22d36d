//! macos-virt: create, provision and supervise lightweight Linux VMs.
//!
//! `main` resolves paths and settings once, builds the controller and maps
//! the returned `Outcome` or `VirtError` to the process exit status.

use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use macos_virt::error::{Result, VirtError};
use macos_virt::logging;
use macos_virt::paths::VirtPaths;
use macos_virt::protocol::Heartbeat;
use macos_virt::settings::Settings;
use macos_virt::vm::codecs::SystemMediaTools;
use macos_virt::vm::profiles::{DEFAULT_PROFILE, ProfileRegistry};
use macos_virt::vm::supervisor::Supervisor;
use macos_virt::vm::{CreateOptions, Outcome, UpdateOptions, VmController, VmSummary};

const DEFAULT_VM: &str = "default";

/// Lightweight Linux VMs on macOS
#[derive(Parser, Debug)]
#[command(name = "macos-virt", version, about = "Create, provision and supervise lightweight Linux VMs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a VM and boot it through first-boot provisioning
    Create {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
        /// Image profile (see `profiles`)
        #[arg(long, default_value = DEFAULT_PROFILE)]
        profile: String,
        /// Memory in MB
        #[arg(long, default_value_t = 1024)]
        memory: u32,
        /// Number of virtual CPUs
        #[arg(long, default_value_t = 1)]
        cpus: u32,
        /// Root disk size in MB; fixed after creation
        #[arg(long, default_value_t = 5000)]
        disk_size: u64,
        /// Share the host home directory with the guest
        #[arg(long)]
        mount_home_directory: bool,
    },
    /// Boot a stopped VM
    Start {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
    },
    /// Power off a running VM
    Stop {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
        /// Signal the runner instead of asking the guest to power off
        #[arg(long)]
        force: bool,
    },
    /// Delete a stopped VM and all of its files
    Rm {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
        /// Do not ask for confirmation
        #[arg(long, short)]
        yes: bool,
    },
    /// List VMs
    Ls,
    /// Change CPU, memory or the home share of a stopped VM
    Update {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
        #[arg(long)]
        mount_home_directory: Option<bool>,
    },
    /// Show one guest heartbeat
    Status {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
    },
    /// Stream guest heartbeats until Ctrl-C
    Watch {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
    },
    /// Set the guest clock to the host clock
    SyncTime {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
    },
    /// Open a shell in the guest, or run a command there
    Shell {
        #[arg(default_value = DEFAULT_VM)]
        name: String,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Copy files between host and guest; prefix guest paths with `vm:`
    Cp {
        source: String,
        dest: String,
        #[arg(long, default_value = DEFAULT_VM)]
        name: String,
        #[arg(long, short)]
        recursive: bool,
    },
    /// List available image profiles
    Profiles,
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let paths = VirtPaths::resolve().context("HOME is not set")?;
    let _log_guard = logging::init(&paths.logs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let result = runtime.block_on(run(cli, paths));

    // Don't wait on blocking tasks left behind by an interrupted boot.
    runtime.shutdown_timeout(Duration::from_secs(1));

    Ok(match result {
        Ok(outcome) => report(&outcome),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    })
}

async fn run(cli: Cli, paths: VirtPaths) -> Result<Outcome> {
    paths.ensure()?;
    let settings = Settings::load(&paths.settings_file())?;
    let tools = Arc::new(SystemMediaTools::new(settings.iso_tool.clone()));
    let supervisor = Supervisor::from_settings(&settings);
    let controller = VmController::new(paths, settings, ProfileRegistry::builtin(), tools, supervisor);

    match cli.command {
        Command::Create { name, profile, memory, cpus, disk_size, mount_home_directory } => {
            controller
                .create(CreateOptions {
                    name,
                    profile,
                    memory_mb: memory,
                    cpu_count: cpus,
                    disk_size_mb: disk_size,
                    mount_home_directory,
                })
                .await
        }
        Command::Start { name } => controller.start(&name).await,
        Command::Stop { name, force } => controller.stop(&name, force).await,
        Command::Rm { name, yes } => {
            if !controller.store().exists(&name) {
                return Err(VirtError::NotFound(name));
            }
            if !yes && !confirm(&format!("Delete VM {name} and all of its files?"))? {
                return Ok(Outcome::Done);
            }
            controller.delete(&name)
        }
        Command::Ls => {
            print_summaries(&controller.list()?);
            Ok(Outcome::Done)
        }
        Command::Update { name, memory, cpus, mount_home_directory } => controller.update(
            &name,
            UpdateOptions { memory_mb: memory, cpu_count: cpus, mount_home_directory },
        ),
        Command::Status { name } => {
            let heartbeat = controller.status(&name).await?;
            print_heartbeat(&heartbeat);
            Ok(Outcome::Done)
        }
        Command::Watch { name } => {
            println!(
                "{:>6} {:>6} {:>6} {:>6} {:>6} {:>10}  ADDRESSES",
                "CPUS", "CPU%", "MEM%", "DISK%", "PROCS", "UPTIME"
            );
            controller
                .watch(&name, |hb| {
                    println!(
                        "{:>6} {:>6.1} {:>6.1} {:>6.1} {:>6} {:>10}  {}",
                        hb.cpu_count,
                        hb.cpu_usage,
                        hb.memory_usage,
                        hb.root_fs_usage,
                        hb.processes,
                        format_uptime(hb.uptime),
                        format_addresses(hb)
                    );
                })
                .await
        }
        Command::SyncTime { name } => controller.sync_time(&name).await,
        Command::Shell { name, command } => controller.shell(&name, &command).await,
        Command::Cp { source, dest, name, recursive } => {
            controller.copy(&name, &source, &dest, recursive).await
        }
        Command::Profiles => {
            println!("{:<14} DESCRIPTION", "PROFILE");
            for profile in controller.registry().iter() {
                let marker = if profile.id == DEFAULT_PROFILE { " (default)" } else { "" };
                println!("{:<14} {}{marker}", profile.id, profile.description);
            }
            Ok(Outcome::Done)
        }
    }
}

fn report(outcome: &Outcome) -> ExitCode {
    match outcome {
        Outcome::Started { name, ip_address } => {
            match ip_address {
                Some(ip) => println!("{name} is running at {ip}"),
                None => println!("{name} is running"),
            }
            ExitCode::SUCCESS
        }
        Outcome::Stopped { name } => {
            println!("{name} stopped");
            ExitCode::SUCCESS
        }
        Outcome::Deleted { name } => {
            println!("{name} deleted");
            ExitCode::SUCCESS
        }
        Outcome::Updated { name } => {
            println!("{name} updated");
            ExitCode::SUCCESS
        }
        Outcome::Interrupted { name } => {
            println!("detached from {name}; the VM keeps running");
            ExitCode::SUCCESS
        }
        Outcome::Exited { code } => ExitCode::from(u8::try_from(*code).unwrap_or(1)),
        Outcome::Done => ExitCode::SUCCESS,
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn print_summaries(summaries: &[VmSummary]) {
    println!(
        "{:<16} {:<14} {:<8} {:<16} {:>4} {:>8} {:>8}  PROFILE",
        "NAME", "STATUS", "RUNNING", "IP", "CPUS", "MEMORY", "DISK"
    );
    for VmSummary { record, running } in summaries {
        let ip = record.ip_address.map(|ip| ip.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<14} {:<8} {:<16} {:>4} {:>6}MB {:>6}MB  {}",
            record.name,
            record.status.as_str(),
            if *running { "yes" } else { "no" },
            ip,
            record.cpu_count,
            record.memory_mb,
            record.disk_size_mb,
            record.profile
        );
    }
}

fn print_heartbeat(hb: &Heartbeat) {
    println!("{:<16} {}", "CPUs", hb.cpu_count);
    println!("{:<16} {:.1}%", "CPU usage", hb.cpu_usage);
    println!("{:<16} {:.1}%", "Memory usage", hb.memory_usage);
    println!("{:<16} {:.1}%", "Root FS usage", hb.root_fs_usage);
    println!("{:<16} {}", "Processes", hb.processes);
    println!("{:<16} {}", "Uptime", format_uptime(hb.uptime));
    println!("{:<16} {}", "Addresses", format_addresses(hb));
    if !hb.mounts.is_empty() {
        println!("Mounts:");
        for line in hb.mounts.lines() {
            println!("  {line}");
        }
    }
}

fn format_addresses(hb: &Heartbeat) -> String {
    if hb.network_addresses.is_empty() {
        return "-".to_string();
    }
    hb.network_addresses
        .iter()
        .map(|(addr, mask)| format!("{addr}/{mask}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_uptime(secs: u64) -> String {
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hours, mins) = (rem / 3600, (rem % 3600) / 60);
    if days > 0 {
        format!("{days}d{hours:02}h{mins:02}m")
    } else {
        format!("{hours}h{mins:02}m")
    }
}
