mod config;
mod confirmation;
mod constants;
mod display;
mod progress;
mod progress_sink;
mod system;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;

use config::RpiClonerConfig;
use confirmation::{confirm_destructive_action, ConfirmationConfig, ConfirmationResult, DestructiveAction};
use display::OperationDisplay;
use progress_sink::TerminalProgressSink;
use rpi_cloner_storage::clone::{clone_exact, clone_smart, CloneMode};
use rpi_cloner_storage::erase::{erase_device, EraseMode};
use rpi_cloner_storage::format::{format_device, Filesystem, FormatMode};
use rpi_cloner_storage::repo::{find_image_repos, get_repo_usage, list_images, repo_owned_drive_names};
use rpi_cloner_storage::restore::{parse_clonezilla_image, restore_clonezilla, restore_imageusb, restore_iso};
use rpi_cloner_storage::unmount::unmount_device;
use rpi_cloner_storage::validate::{validate_clone_operation, validate_erase_operation, validate_format_operation};
use rpi_cloner_storage::verify::verify_clone;
use rpi_cloner_storage::{Drive, Inventory};

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_VALIDATION: u8 = 2;
const EXIT_INSUFFICIENT_SPACE: u8 = 77;

const INVENTORY_TTL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "rpi-cloner", about = "USB drive duplication appliance", version)]
struct Cli {
    /// Skip confirmation prompts.
    #[arg(short = 'y', long, global = true)]
    yes: bool,

    /// Print each command's argv and output as it runs.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List attached drives and discovered image repositories.
    List,

    /// Clone one device onto another.
    Clone {
        src: String,
        dst: String,
        #[arg(long)]
        mode: Option<String>,
    },

    /// Erase a device.
    Erase {
        device: String,
        #[arg(long)]
        mode: Option<String>,
    },

    /// Partition and format a device with a single filesystem.
    Format {
        device: String,
        filesystem: String,
        #[arg(long)]
        mode: Option<String>,
        #[arg(long)]
        label: Option<String>,
    },

    /// Restore an image from a repository onto a device.
    Restore { image: String, device: String },

    /// Peer-to-peer image transfer.
    Transfer {
        #[command(subcommand)]
        action: TransferAction,
    },

    /// Generate shell completions.
    Completions { shell: Shell },
}

#[derive(Subcommand)]
enum TransferAction {
    /// Advertise this host and accept incoming transfers into its repo.
    Serve {
        #[arg(long)]
        pin: Option<String>,
    },
    /// Discover a peer and send images to it.
    Send {
        #[arg(long)]
        pin: String,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return ExitCode::from(EXIT_OK);
    }

    let config = match RpiClonerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            utils::error(&format!("failed to load configuration: {e}"));
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    if let Err(e) = system::verify_dependencies() {
        utils::error(&e.to_string());
        return ExitCode::from(EXIT_FAILURE);
    }

    let confirm_config = ConfirmationConfig { auto_confirm: cli.yes, verbose: cli.verbose };
    let inventory = Inventory::new(INVENTORY_TTL);

    let code = match cli.command {
        Commands::List => run_list(&inventory, &config),
        Commands::Clone { src, dst, mode } => {
            run_clone(&inventory, &config, &confirm_config, &src, &dst, mode.as_deref())
        }
        Commands::Erase { device, mode } => {
            run_erase(&inventory, &config, &confirm_config, &device, mode.as_deref())
        }
        Commands::Format { device, filesystem, mode, label } => {
            run_format(&inventory, &confirm_config, &device, &filesystem, mode.as_deref(), label.as_deref())
        }
        Commands::Restore { image, device } => run_restore(&inventory, &confirm_config, &image, &device),
        Commands::Transfer { action } => run_transfer(&inventory, &config, action),
        Commands::Completions { .. } => unreachable!("handled above"),
    };

    ExitCode::from(code)
}

fn run_list(inventory: &Inventory, config: &RpiClonerConfig) -> u8 {
    let drives = match inventory.snapshot(true) {
        Ok(drives) => drives,
        Err(e) => {
            utils::error(&format!("failed to list drives: {e}"));
            return EXIT_FAILURE;
        }
    };

    utils::print_title_bar("Attached drives");
    let owned = repo_owned_drive_names(inventory, &config.repo_flag_filename);
    for drive in &drives {
        let class = inventory.classify(drive);
        let marker = if owned.contains(&drive.name) {
            " [repo]".dimmed().to_string()
        } else {
            String::new()
        };
        println!(
            "  {:<10} {:<8} {:>10}  {:?}{}",
            drive.name,
            format!("{:?}", drive.transport),
            utils::human_size(drive.size_bytes),
            class,
            marker
        );
    }

    println!();
    utils::print_title_bar("Image repositories");
    for repo in find_image_repos(inventory, &config.repo_flag_filename) {
        let usage = get_repo_usage(&repo);
        println!(
            "  {} ({} used / {} total)",
            repo.path.display(),
            utils::human_size(usage.used_bytes),
            utils::human_size(usage.total_bytes)
        );
        for image in list_images(&repo.path) {
            println!("    • {}", image.name());
        }
    }
    EXIT_OK
}

fn resolve_drive(inventory: &Inventory, name: &str) -> Option<Drive> {
    inventory.get_by_name(name, true)
}

fn run_clone(
    inventory: &Inventory,
    config: &RpiClonerConfig,
    confirm_config: &ConfirmationConfig,
    src: &str,
    dst: &str,
    mode_flag: Option<&str>,
) -> u8 {
    let mode = CloneMode::parse(Some(&config.effective_clone_mode(mode_flag)));

    let (src_drive, dst_drive) = match validate_clone_operation(inventory, src, dst, mode.requires_space_check()) {
        Ok(pair) => pair,
        Err(e) => return report_storage_error(&e),
    };

    let action = DestructiveAction {
        headline: format!("Clone {src} onto {dst}"),
        details: vec![
            format!("source: {} ({})", src_drive.name, utils::human_size(src_drive.size_bytes)),
            format!("destination: {} ({})", dst_drive.name, utils::human_size(dst_drive.size_bytes)),
            "the destination's current contents will be overwritten".to_string(),
        ],
    };
    if let ConfirmationResult::Cancelled = confirm_destructive_action(&action, confirm_config) {
        utils::info("cancelled");
        return EXIT_OK;
    }

    if let Err(e) = unmount_device(&src_drive, true) {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }
    if let Err(e) = unmount_device(&dst_drive, true) {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let display = OperationDisplay::new(&format!("Cloning {src} -> {dst}"));
    let mut sink = TerminalProgressSink::new(&display);

    let result = match mode {
        CloneMode::Exact => clone_exact(&src_drive, &dst_drive, &mut sink),
        CloneMode::Smart | CloneMode::Verify => {
            let dst_name = dst_drive.name.clone();
            clone_smart(
                &src_drive,
                &dst_drive,
                || {
                    resolve_drive(inventory, &dst_name).ok_or_else(|| {
                        rpi_cloner_storage::StorageError::Restore(format!("{dst_name} disappeared mid-clone"))
                    })
                },
                &mut sink,
            )
        }
    };

    if let Err(e) = result {
        display.finish("failed");
        return report_storage_error(&e);
    }

    if mode == CloneMode::Verify {
        display.set_message("Verifying".to_string());
        let refreshed_dst = resolve_drive(inventory, &dst_drive.name).unwrap_or(dst_drive);
        if !verify_clone(&src_drive, &refreshed_dst, &mut sink) {
            display.finish("verification failed");
            utils::error("clone verification failed");
            return EXIT_FAILURE;
        }
    }

    display.finish("done");
    utils::success(&format!("cloned {src} onto {dst}"));
    EXIT_OK
}

fn run_erase(
    inventory: &Inventory,
    config: &RpiClonerConfig,
    confirm_config: &ConfirmationConfig,
    device: &str,
    mode_flag: Option<&str>,
) -> u8 {
    let mode = EraseMode::parse(mode_flag);
    let drive = match validate_erase_operation(inventory, device) {
        Ok(drive) => drive,
        Err(e) => return report_storage_error(&e),
    };

    let action = DestructiveAction {
        headline: format!("Erase {device}"),
        details: vec![
            format!("mode: {mode:?}"),
            format!("size: {}", utils::human_size(drive.size_bytes)),
            "all data on this device will be destroyed".to_string(),
        ],
    };
    if let ConfirmationResult::Cancelled = confirm_destructive_action(&action, confirm_config) {
        utils::info("cancelled");
        return EXIT_OK;
    }

    if let Err(e) = unmount_device(&drive, true) {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let display = OperationDisplay::new(&format!("Erasing {device}"));
    let mut sink = TerminalProgressSink::new(&display);
    if let Err(e) = erase_device(&drive, mode, config.quick_wipe_mib, &mut sink) {
        display.finish("failed");
        return report_storage_error(&e);
    }
    display.finish("done");
    utils::success(&format!("erased {device}"));
    EXIT_OK
}

fn run_format(
    inventory: &Inventory,
    confirm_config: &ConfirmationConfig,
    device: &str,
    filesystem: &str,
    mode_flag: Option<&str>,
    label: Option<&str>,
) -> u8 {
    let fs = match Filesystem::parse(filesystem) {
        Ok(fs) => fs,
        Err(e) => {
            utils::error(&e.to_string());
            return EXIT_VALIDATION;
        }
    };
    let mode = FormatMode::parse(mode_flag);

    let drive = match validate_format_operation(inventory, device) {
        Ok(drive) => drive,
        Err(e) => return report_storage_error(&e),
    };

    let action = DestructiveAction {
        headline: format!("Format {device} as {filesystem}"),
        details: vec![format!("mode: {mode:?}"), "all data on this device will be destroyed".to_string()],
    };
    if let ConfirmationResult::Cancelled = confirm_destructive_action(&action, confirm_config) {
        utils::info("cancelled");
        return EXIT_OK;
    }

    if let Err(e) = unmount_device(&drive, true) {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let display = OperationDisplay::new(&format!("Formatting {device}"));
    let mut sink = TerminalProgressSink::new(&display);
    if let Err(e) = format_device(&drive, fs, mode, label, &mut sink) {
        display.finish("failed");
        return report_storage_error(&e);
    }
    display.finish("done");
    utils::success(&format!("formatted {device}"));
    EXIT_OK
}

fn run_restore(
    inventory: &Inventory,
    confirm_config: &ConfirmationConfig,
    image: &str,
    device: &str,
) -> u8 {
    if let Err(e) = system::require_root() {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let drive = match validate_format_operation(inventory, device) {
        Ok(drive) => drive,
        Err(e) => return report_storage_error(&e),
    };

    let image_path = PathBuf::from(image);
    let action = DestructiveAction {
        headline: format!("Restore {image} onto {device}"),
        details: vec!["all data on this device will be destroyed".to_string()],
    };
    if let ConfirmationResult::Cancelled = confirm_destructive_action(&action, confirm_config) {
        utils::info("cancelled");
        return EXIT_OK;
    }

    if let Err(e) = unmount_device(&drive, true) {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let display = OperationDisplay::new(&format!("Restoring onto {device}"));
    let mut sink = TerminalProgressSink::new(&display);

    let is_bin = image_path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("bin"));

    let result = if image_path.is_dir() {
        match parse_clonezilla_image(&image_path) {
            Ok(plan) => restore_clonezilla(&plan, &drive, inventory, &mut sink),
            Err(e) => Err(e),
        }
    } else if is_bin {
        restore_imageusb(&image_path, &drive, &mut sink)
    } else {
        restore_iso(&image_path, &drive, &mut sink)
    };

    if let Err(e) = result {
        display.finish("failed");
        return report_storage_error(&e);
    }
    display.finish("done");
    utils::success(&format!("restored {image} onto {device}"));
    EXIT_OK
}

fn run_transfer(inventory: &Inventory, config: &RpiClonerConfig, action: TransferAction) -> u8 {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            utils::error(&format!("failed to start async runtime: {e}"));
            return EXIT_FAILURE;
        }
    };

    match action {
        TransferAction::Serve { pin } => runtime.block_on(run_transfer_serve(inventory, config, pin)),
        TransferAction::Send { pin } => runtime.block_on(run_transfer_send(inventory, config, pin)),
    }
}

async fn run_transfer_serve(inventory: &Inventory, config: &RpiClonerConfig, pin: Option<String>) -> u8 {
    let repos = find_image_repos(inventory, &config.repo_flag_filename);
    let Some(repo) = repos.into_iter().next() else {
        utils::error("no image repository found on this host");
        return EXIT_FAILURE;
    };

    let server = rpi_cloner_peer::TransferServer::new(repo, pin);
    utils::info(&format!("PIN: {}", server.pin()));
    utils::info(&format!("listening on port {}", config.transfer_port));

    let device_id = config.device_id.clone().unwrap_or_else(|| "rpi-cloner".to_string());
    let hostname = hostname_or_default();
    let mut discovery = match rpi_cloner_peer::Discovery::new(config.transfer_port) {
        Ok(d) => d,
        Err(e) => {
            utils::error(&format!("mDNS setup failed: {e}"));
            return EXIT_FAILURE;
        }
    };
    if let Err(e) = discovery.publish(&device_id, &hostname) {
        utils::error(&format!("mDNS publish failed: {e}"));
        return EXIT_FAILURE;
    }

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.transfer_port));
    match server.serve(addr).await {
        Ok(()) => EXIT_OK,
        Err(e) => {
            utils::error(&e.to_string());
            EXIT_FAILURE
        }
    }
}

async fn run_transfer_send(inventory: &Inventory, config: &RpiClonerConfig, pin: String) -> u8 {
    let device_id = config.device_id.clone().unwrap_or_else(|| "rpi-cloner".to_string());
    let discovery = match rpi_cloner_peer::Discovery::new(config.transfer_port) {
        Ok(d) => d,
        Err(e) => {
            utils::error(&format!("mDNS setup failed: {e}"));
            return EXIT_FAILURE;
        }
    };

    utils::info("discovering peers...");
    let peers = discovery.browse(Duration::from_secs(5), &device_id, |_| {});
    let Some(peer) = peers.first() else {
        utils::error("no peers found");
        return EXIT_FAILURE;
    };
    utils::info(&format!("found peer {} ({})", peer.hostname, peer.ipv4));

    let mut client = rpi_cloner_peer::TransferClient::new(peer);
    if let Err(e) = client.authenticate(&pin).await {
        utils::error(&e.to_string());
        return EXIT_FAILURE;
    }

    let repos = find_image_repos(inventory, &config.repo_flag_filename);
    let Some(repo) = repos.into_iter().next() else {
        utils::error("no local image repository found to send from");
        return EXIT_FAILURE;
    };
    let images = list_images(&repo.path);

    let display = OperationDisplay::new("Sending images");
    let mut sink = TerminalProgressSink::new(&display);
    match client.send_images(&images, &mut sink).await {
        Ok(()) => {
            display.finish("done");
            utils::success(&format!("sent {} image(s)", images.len()));
            EXIT_OK
        }
        Err(e) => {
            display.finish("failed");
            utils::error(&e.to_string());
            EXIT_FAILURE
        }
    }
}

fn hostname_or_default() -> String {
    std::process::Command::new("hostname")
        .output()
        .ok()
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "rpi-cloner".to_string())
}

fn report_storage_error(err: &rpi_cloner_storage::StorageError) -> u8 {
    utils::error(&err.to_string());
    match err {
        rpi_cloner_storage::StorageError::Clone(rpi_cloner_storage::error::CloneError::InsufficientSpace {
            ..
        }) => EXIT_INSUFFICIENT_SPACE,
        rpi_cloner_storage::StorageError::Device(_) | rpi_cloner_storage::StorageError::Mount(_) => {
            EXIT_VALIDATION
        }
        _ => EXIT_FAILURE,
    }
}
