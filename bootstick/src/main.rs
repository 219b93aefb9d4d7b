use anyhow::{Context, Result, anyhow, bail};
use bootstick_core::cancel::CancelHandle;
use bootstick_core::hash::{self, HashAlgorithm, HashEvent};
use bootstick_core::image::Compression;
use bootstick_core::iso::{self, IsoInfo};
use bootstick_core::platform::{self, monitor::HotplugMonitor};
use bootstick_core::types::{FsType, PartitionStyle, TargetFirmware};
use bootstick_core::{
    Config, Delivery, DeviceInfo, Event, OperationDescriptor, OperationHandle, Outcome,
    ProgressEvent, Provisioner, partition,
};
use clap::{Args, Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, Select, theme::ColorfulTheme};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use log::warn;
use std::io::{IsTerminal, stdout};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Resolution of the overall progress bar.
const PROGRESS_SCALE: u64 = 1000;

#[derive(Parser)]
#[command(name = "bootstick")]
#[command(about = "A safe, interactive USB provisioning tool", version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "BOOTSTICK_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List USB devices that are safe to overwrite
    List,
    /// Watch for USB devices being plugged in or removed
    Monitor,
    /// Inspect an ISO image
    Info {
        /// Image file to inspect
        #[arg(required = true)]
        image: PathBuf,

        /// Also list the files inside the image
        #[arg(short, long)]
        files: bool,
    },
    /// Show the partition table of a device
    Layout {
        /// Device node, e.g. /dev/sdb
        #[arg(short, long)]
        device: Option<PathBuf>,
    },
    /// Print the checksum of a file
    Hash {
        #[arg(required = true)]
        file: PathBuf,

        /// Use SHA-512 instead of SHA-256
        #[arg(long)]
        sha512: bool,
    },
    /// Partition and format a device
    Format {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Write an image to a device
    Write {
        /// Image file to write (.iso, .img, optionally .gz/.xz/.zst)
        #[arg(required = true)]
        image: PathBuf,

        /// Copy the image's files onto a FAT32 partition instead of writing it raw
        #[arg(short = 'x', long)]
        extract: bool,

        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Device node, e.g. /dev/sdb. Prompts when omitted.
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Filesystem to create
    #[arg(long = "fs", default_value = "FAT32")]
    fs_type: FsType,

    /// Partition table: mbr or gpt
    #[arg(long, default_value = "mbr")]
    style: PartitionStyle,

    /// Firmware the stick must boot on: bios, uefi or bios+uefi
    #[arg(long, default_value = "bios")]
    target: TargetFirmware,

    /// Volume label
    #[arg(short, long, default_value = "")]
    label: String,

    /// Cluster size in bytes, 0 for the filesystem default
    #[arg(long, default_value_t = 0)]
    cluster_size: u64,
}

impl TargetArgs {
    fn descriptor(&self, device: &Path) -> OperationDescriptor {
        let mut op = OperationDescriptor::new(device);
        op.fs_type = self.fs_type;
        op.style = self.style;
        op.target = self.target;
        op.label = self.label.clone();
        op.cluster_size = self.cluster_size;
        op
    }
}

/// A helper struct that, on Unix, disables `ECHOCTL` for the terminal.
///
/// `ECHOCTL` is the terminal flag that causes Ctrl+C to be printed as `^C`.
/// Turning it off keeps the progress bar intact while a cancelled operation
/// winds down. The original terminal state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            let fd = stdout().as_raw_fd();
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let original_termios = Termios::from_fd(fd).ok().and_then(|original| {
                let mut quiet = original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).ok().map(|_| original)
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            let fd = stdout().as_raw_fd();
            tcsetattr(fd, TCSANOW, original_termios).ok();
        }
    }
}

/// Routes Ctrl+C to whatever operation is currently running.
#[derive(Default)]
struct Interrupt {
    requested: AtomicBool,
    target: Mutex<Option<CancelHandle>>,
}

impl Interrupt {
    fn install() -> Result<Arc<Self>> {
        let interrupt = Arc::new(Self::default());
        let handler = Arc::clone(&interrupt);
        ctrlc::set_handler(move || handler.fire())?;
        Ok(interrupt)
    }

    fn fire(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.slot().as_ref() {
            eprintln!("\nCancelling, waiting for the current step to stop...");
            handle.cancel();
        }
    }

    fn arm(&self, handle: CancelHandle) {
        *self.slot() = Some(handle);
    }

    fn disarm(&self) {
        self.slot().take();
    }

    fn requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancelHandle>> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Presents an interactive menu for the user to select a device.
fn select_device(devices: &[DeviceInfo], prompt: &str) -> Result<DeviceInfo> {
    if devices.is_empty() {
        return Err(anyhow!("No removable USB devices found."));
    }

    let items: Vec<String> = devices.iter().map(|d| d.to_string()).collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .default(0)
        .interact()?;

    Ok(devices[selection].clone())
}

/// Resolves `--device`, or asks for one.
fn pick_device(config: &Config, device: Option<&Path>, prompt: &str) -> Result<DeviceInfo> {
    match device {
        Some(path) => platform::find_device(config, path)?.ok_or_else(|| {
            anyhow!(
                "{} is not a USB device that is safe to overwrite.",
                path.display()
            )
        }),
        None => select_device(&platform::enumerate(config)?, prompt),
    }
}

/// Presents a final "Yes/No" confirmation to the user.
fn confirm_operation(prompt: &str) -> Result<bool> {
    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;

    Ok(confirmation)
}

fn warn_destructive(device: &DeviceInfo) {
    println!(
        "{} This will erase all data on '{}'.",
        style("WARNING:").red().bold(),
        device.display_name(),
    );
    println!("  Device: {}", style(device.path.display()).cyan());
    for mountpoint in &device.mountpoints {
        println!(
            "  Mounted: {} (will be unmounted)",
            style(mountpoint.display()).yellow()
        );
    }
}

fn print_devices(devices: &[DeviceInfo]) {
    if devices.is_empty() {
        println!("No removable USB devices found.");
        return;
    }

    println!("Found {} removable devices:", devices.len());
    println!(
        "\n  {:<12} {:<32} {:<10} {}",
        "DEVICE", "NAME", "SIZE", "LOCATION"
    );
    println!("  {:-<12} {:-<32} {:-<10} {:-<20}", "", "", "", "");
    for device in devices {
        let name = match (&device.vendor, &device.model) {
            (Some(vendor), Some(model)) => format!("{vendor} {model}"),
            (Some(name), None) | (None, Some(name)) => name.clone(),
            (None, None) => device.name.clone(),
        };
        let location = match device.mountpoints.as_slice() {
            [] => "(Not mounted)".to_string(),
            mountpoints => mountpoints
                .iter()
                .map(|m| m.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        };
        println!(
            "  {:<12} {:<32} {:>10}  {}",
            device.path.display(),
            name,
            HumanBytes(device.size).to_string(),
            location
        );
    }
}

fn print_iso(info: &IsoInfo) {
    let yes_no = |b: bool| if b { "yes" } else { "no" };
    println!("  Image:    {}", style(info.path.display()).cyan());
    println!("  Size:     {}", HumanBytes(info.size));
    println!("  Label:    {}", info.label.as_deref().unwrap_or("(none)"));
    println!("  Boots:    {}", info.boot_type);
    println!("  El Torito: {}", yes_no(info.has_eltorito));
    println!("  EFI:      {}", yes_no(info.has_efi));
    println!("  Hybrid:   {}", yes_no(info.is_hybrid));
    let family = match (info.is_windows, info.is_linux) {
        (true, _) => "Windows",
        (false, true) => "Linux",
        (false, false) => "unknown",
    };
    println!("  OS:       {family}");
}

fn bar_style() -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{prefix:14} [{elapsed_precise}] [{bar:40.green/black}] {percent:>3}% {msg}")?
        .progress_chars("■ "))
}

fn detail(event: &ProgressEvent) -> String {
    let mut parts = Vec::new();
    if let (Some(done), Some(total)) = (event.bytes_done, event.bytes_total) {
        parts.push(format!("{}/{}", HumanBytes(done), HumanBytes(total)));
    }
    if let Some(speed) = event.speed {
        parts.push(format!("{}/s", HumanBytes(speed as u64)));
    }
    if let Some(message) = &event.message {
        parts.push(message.clone());
    }
    parts.join("  ")
}

/// Follows a running operation until it finishes, drawing its progress.
fn follow(handle: OperationHandle, interrupt: &Interrupt) -> Result<Outcome> {
    interrupt.arm(handle.cancel_handle());
    let pb = ProgressBar::new(PROGRESS_SCALE);
    pb.set_style(bar_style()?);

    let mut outcome = None;
    for event in handle.events.iter() {
        match event {
            Event::Progress(progress) => {
                pb.set_prefix(progress.phase.to_string());
                pb.set_position((progress.fraction * PROGRESS_SCALE as f64) as u64);
                pb.set_message(detail(&progress));
            }
            Event::Finished(finished) => {
                outcome = Some(finished);
                break;
            }
        }
    }
    handle.join();
    interrupt.disarm();

    let outcome = outcome
        .unwrap_or_else(|| Outcome::Failed("the operation stopped without a result".into()));
    match &outcome {
        Outcome::Complete => pb.finish_with_message("Done."),
        Outcome::Cancelled => pb.abandon_with_message("Cancelled."),
        Outcome::Failed(_) => pb.abandon_with_message("❌ Operation failed."),
    }
    Ok(outcome)
}

fn conclude(outcome: Outcome, device: &DeviceInfo, what: &str) -> Result<()> {
    match outcome {
        Outcome::Complete => {
            println!(
                "\n✨ Successfully {what} {}.",
                style(device.path.display()).cyan()
            );
            Ok(())
        }
        Outcome::Cancelled => bail!("Operation cancelled. The device may be left unusable."),
        Outcome::Failed(reason) => Err(anyhow!(reason)),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(Config::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();
    let interrupt = Interrupt::install()?;

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::List => {
            print_devices(&platform::enumerate(&config)?);
        }
        Commands::Monitor => {
            print_devices(&platform::enumerate(&config)?);

            let shared = Arc::new(config);
            let mut monitor = HotplugMonitor::new();
            monitor.start(move || match platform::enumerate(&shared) {
                Ok(devices) => {
                    println!();
                    print_devices(&devices);
                }
                Err(e) => warn!("could not list devices: {e}"),
            })?;

            println!("\nWatching for USB devices. Press Ctrl+C to stop.");
            while !interrupt.requested() {
                thread::sleep(Duration::from_millis(200));
            }
            monitor.stop();
        }
        Commands::Info { image, files } => {
            let info = iso::analyze(&image, &config)
                .ok_or_else(|| anyhow!("{} is not a readable image file.", image.display()))?;
            print_iso(&info);

            if files {
                let listing = iso::list_files(&image, &config);
                if listing.is_empty() {
                    println!("\nNo listing tool could read the image.");
                }
                for file in listing {
                    println!("  {file}");
                }
            }
        }
        Commands::Layout { device } => {
            let device = pick_device(&config, device.as_deref(), "Select a device to inspect")?;
            let layout = partition::get_layout(&device.path, &config)?;

            println!("{} ({})", device.display_name(), layout.style);
            println!(
                "\n  {:<3} {:>12} {:>10} {:<38} {:<6} {}",
                "#", "START", "SIZE", "TYPE", "FS", "LABEL"
            );
            for (n, entry) in layout.entries.iter().enumerate() {
                let fs = entry.fs_type.map(|fs| fs.to_string()).unwrap_or_default();
                let part_type = entry
                    .part_type
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                println!(
                    "  {:<3} {:>12} {:>10} {:<38} {:<6} {}{}",
                    n + 1,
                    entry.start,
                    HumanBytes(entry.size).to_string(),
                    part_type,
                    fs,
                    entry.label,
                    if entry.bootable { " (boot)" } else { "" }
                );
            }
        }
        Commands::Hash { file, sha512 } => {
            let algorithm = if sha512 {
                HashAlgorithm::Sha512
            } else {
                HashAlgorithm::Sha256
            };
            let job = hash::spawn(file.clone(), algorithm)?;
            interrupt.arm(job.cancel.clone());

            let pb = ProgressBar::new(0);
            pb.set_prefix("Hashing");
            pb.set_style(
                ProgressStyle::default_bar()
                    .template(
                        "{prefix:12} [{elapsed_precise}] [{bar:40.magenta/black}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                    )?
                    .progress_chars("■ "),
            );

            let mut result = None;
            for event in job.events.iter() {
                match event {
                    HashEvent::Progress(progress) => {
                        if let (Some(done), Some(total)) = (progress.bytes_done, progress.bytes_total)
                        {
                            pb.set_length(total);
                            pb.set_position(done);
                        }
                    }
                    HashEvent::Finished(finished) => {
                        result = Some(finished);
                        break;
                    }
                }
            }
            job.join();
            interrupt.disarm();

            match result {
                Some(Ok(digest)) => {
                    pb.finish_and_clear();
                    println!("{algorithm}  {}  {digest}", file.display());
                }
                Some(Err(e)) => {
                    pb.abandon_with_message("❌ Operation failed.");
                    return Err(e.into());
                }
                None => bail!("the hash worker stopped without a result"),
            }
        }
        Commands::Format { target } => {
            let provisioner = Provisioner::new(config);
            let device = pick_device(
                provisioner.config(),
                target.device.as_deref(),
                "Select the device to FORMAT",
            )?;
            let op = target.descriptor(&device.path);

            warn_destructive(&device);
            println!(
                "  Layout: {} / {} / {}{}",
                op.style,
                op.target,
                op.fs_type,
                if op.label.is_empty() {
                    String::new()
                } else {
                    format!(" \"{}\"", op.label)
                }
            );
            println!();

            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Format operation cancelled.");
                return Ok(());
            }
            println!();

            let outcome = follow(provisioner.start(op)?, &interrupt)?;
            conclude(outcome, &device, "formatted")?;
        }
        Commands::Write {
            image,
            extract,
            target,
        } => {
            let provisioner = Provisioner::new(config);
            let compressed = Compression::from_path(&image) != Compression::None;
            if let Some(info) = iso::analyze(&image, provisioner.config()).filter(|_| !compressed) {
                print_iso(&info);
                if !info.is_bootable() {
                    println!(
                        "{} The image does not look bootable.",
                        style("NOTE:").yellow().bold()
                    );
                }
                println!();
            }

            let device = pick_device(
                provisioner.config(),
                target.device.as_deref(),
                "Select the target device to WRITE to",
            )?;
            let mut op = target.descriptor(&device.path);
            op.image = Some(image.clone());
            if extract {
                op.delivery = Delivery::Extract;
                if target.fs_type != FsType::Fat32 {
                    println!(
                        "{} Extraction always uses FAT32; --fs {} is ignored.",
                        style("NOTE:").yellow().bold(),
                        target.fs_type
                    );
                }
            }

            warn_destructive(&device);
            println!("  Image:  {}", style(image.display()).cyan());
            println!(
                "  Mode:   {}",
                if extract { "extract files" } else { "raw copy" }
            );
            println!();

            if !confirm_operation("Are you sure you want to proceed?")? {
                println!("Write operation cancelled.");
                return Ok(());
            }
            println!();

            let outcome = follow(provisioner.start(op)?, &interrupt)?;
            conclude(outcome, &device, "flashed")?;
        }
    }

    Ok(())
}
