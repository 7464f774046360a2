//! Command-line front-end for the Basalt volume engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};

use basalt::create::{create_volume, CreateOptions, FilesystemType};
use basalt::host::{ConsoleHost, HostCallbacks};
use basalt::service::{self, Transport};
use basalt::volume::{
    backup_headers, change_volume_password, restore_headers, RestoreSource,
    DEFAULT_WIPE_PASS_COUNT,
};
use basalt::{
    registry, rng, EncryptionAlgorithm, Error, Kdf, OpenOptions, Password, Protection, Volume,
};

#[derive(Parser)]
#[command(
    name = "basalt-cli",
    version,
    about = "Encrypted volumes compatible with TrueCrypt 7.1a and VeraCrypt"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mount a volume and serve it as a virtual block device.
    Mount {
        volume: PathBuf,
        mount_point: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long = "keyfile")]
        keyfiles: Vec<PathBuf>,
        /// Skip the KDF sweep by naming the volume's hash/KDF.
        #[arg(long)]
        hash: Option<String>,
        #[arg(long)]
        read_only: bool,
        #[arg(long)]
        use_backup_headers: bool,
        /// Protect an embedded hidden volume against overwrites.
        #[arg(long)]
        protect_hidden: bool,
        #[arg(long)]
        protection_password: Option<String>,
        /// Transport back-end: nfs, iscsi or loopfile.
        #[arg(long, default_value = "nfs")]
        transport: String,
        #[arg(long)]
        preserve_timestamps: bool,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Dismount a volume by slot number or path.
    Dismount {
        target: String,
        #[arg(long)]
        force: bool,
    },
    /// List mounted volumes.
    List,
    /// Create a new volume.
    Create {
        volume: PathBuf,
        #[arg(long)]
        size: String,
        #[arg(long, default_value = "aes")]
        cipher: String,
        #[arg(long, default_value = "argon2id")]
        hash: String,
        /// Use TrueCrypt 7.1a compatible iteration counts.
        #[arg(long)]
        legacy: bool,
        #[arg(long)]
        password: Option<String>,
        #[arg(long = "keyfile")]
        keyfiles: Vec<PathBuf>,
        #[arg(long, default_value = "none")]
        filesystem: String,
        #[arg(long)]
        quick: bool,
        #[arg(long, default_value_t = 512)]
        sector_size: u32,
        #[arg(long)]
        hidden_size: Option<String>,
        #[arg(long)]
        hidden_password: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Re-encrypt the volume header under a new password and/or KDF.
    ChangePassword {
        volume: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        new_password: Option<String>,
        #[arg(long = "keyfile")]
        keyfiles: Vec<PathBuf>,
        #[arg(long = "new-keyfile")]
        new_keyfiles: Vec<PathBuf>,
        #[arg(long, default_value = "argon2id")]
        hash: String,
        #[arg(long)]
        legacy: bool,
        #[arg(long, default_value_t = DEFAULT_WIPE_PASS_COUNT)]
        wipe_passes: u32,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Export re-encrypted headers to an external backup file.
    BackupHeaders {
        volume: PathBuf,
        output: PathBuf,
        #[arg(long)]
        password: Option<String>,
        #[arg(long = "keyfile")]
        keyfiles: Vec<PathBuf>,
        #[arg(long)]
        hidden_password: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Restore a damaged header from the embedded backup or a backup file.
    RestoreHeaders {
        volume: PathBuf,
        /// External backup file; without it the embedded backup is used.
        #[arg(long)]
        from: Option<PathBuf>,
        #[arg(long)]
        use_backup_headers: bool,
        #[arg(long)]
        password: Option<String>,
        #[arg(long = "keyfile")]
        keyfiles: Vec<PathBuf>,
        #[arg(long)]
        non_interactive: bool,
    },
    /// Write 64 bytes of pool output to a new keyfile.
    CreateKeyfile {
        output: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Run the cryptographic self-test.
    SelfTest,
    /// Privileged helper mode (spawned internally, not for direct use).
    #[command(hide = true)]
    AdminHelper,
}

fn parse_size(text: &str) -> anyhow::Result<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.chars().last() {
        Some('K') | Some('k') => (&text[..text.len() - 1], 1024u64),
        Some('M') | Some('m') => (&text[..text.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size '{text}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow!("size '{text}' overflows"))
}

fn obtain_password(
    flag: Option<String>,
    host: &ConsoleHost,
    prompt: &str,
    confirm: bool,
) -> anyhow::Result<Password> {
    if let Some(text) = flag {
        return Ok(Password::from_str(&text)?);
    }
    let password = host.ask_password(prompt, false)?;
    if confirm {
        let again = host.ask_password("Confirm password", false)?;
        if password.as_bytes() != again.as_bytes() {
            return Err(anyhow!("passwords do not match"));
        }
    }
    Ok(password)
}

fn transport_from_name(name: &str) -> anyhow::Result<Transport> {
    match name.to_ascii_lowercase().as_str() {
        "nfs" => Ok(Transport::Nfs),
        "iscsi" => Ok(Transport::Iscsi),
        "loopfile" | "loop" => Ok(Transport::LoopFile),
        other => Err(anyhow!("unknown transport '{other}'")),
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Mount {
            volume,
            mount_point,
            password,
            keyfiles,
            hash,
            read_only,
            use_backup_headers,
            protect_hidden,
            protection_password,
            transport,
            preserve_timestamps,
            non_interactive,
        } => {
            let host = ConsoleHost::new(non_interactive);
            let transport = transport_from_name(&transport)?;
            if let Some(ref mp) = mount_point {
                service::check_mount_point(mp)?;
            }
            rng::start()?;

            let password = obtain_password(password, &host, "Volume password", false)?;
            let protection = if protect_hidden {
                let hidden = obtain_password(
                    protection_password,
                    &host,
                    "Hidden volume password",
                    false,
                )?;
                Protection::HiddenVolume {
                    password: hidden,
                    keyfiles: Vec::new(),
                }
            } else {
                Protection::None
            };
            let kdf = match hash {
                Some(name) => Some(
                    Kdf::from_name(&name, false).or_else(|_| Kdf::from_name(&name, true))?,
                ),
                None => None,
            };

            host.begin_busy("Opening volume");
            let mut vol = Volume::open(OpenOptions {
                path: volume,
                password: password.clone(),
                keyfiles: keyfiles.clone(),
                read_only,
                preserve_timestamps,
                use_backup_headers,
                protection,
                kdf,
            })?;
            host.end_busy();

            // Weak legacy KDF: offer the one-click header re-encryption.
            if vol.kdf_upgrade_available()
                && !read_only
                && host.ask_yes_no(
                    "This volume uses a legacy key-derivation setting. Upgrade \
                     the header to the modern iteration count?",
                    false,
                )?
            {
                vol.upgrade_kdf(password, &keyfiles)?;
                host.show_message("Header re-encrypted with the modern KDF.");
            }

            let mounted = service::mount(vol, transport, mount_point, &host)?;
            let info = mounted.info();
            println!(
                "Mounted {} on slot {} ({}, {}, {} iterations)",
                info.path.display(),
                info.slot,
                info.encryption_algorithm,
                info.kdf_name,
                info.iteration_count
            );

            if non_interactive {
                host.show_message("Serving; terminate the process to dismount.");
                loop {
                    std::thread::sleep(std::time::Duration::from_secs(3600));
                }
            } else {
                host.show_message("Serving. Press Enter to dismount.");
                let mut line = String::new();
                let _ = std::io::stdin().read_line(&mut line);
                mounted.dismount(&host)?;
                println!("Dismounted.");
            }
            Ok(())
        }

        Command::Dismount { target, force } => {
            let info = if let Ok(slot) = target.parse::<u32>() {
                registry::find_by_slot(slot)?
            } else {
                registry::find_by_path(Path::new(&target))?
            }
            .ok_or(Error::ParameterIncorrect("no such mounted volume"))?;

            // The serving process owns the volume; a foreign dismount can
            // only ask it to stop.
            #[cfg(unix)]
            if force {
                let pid = registry::owner_pid(info.slot)?
                    .ok_or(Error::ParameterIncorrect("no live owner for that slot"))?;
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                println!("Sent dismount request to the serving process (pid {pid}).");
                return Ok(());
            }
            let _ = force;
            Err(anyhow!(
                "slot {} is served by another process; dismount there or use --force",
                info.slot
            ))
        }

        Command::List => {
            let mounted = registry::list()?;
            if mounted.is_empty() {
                println!("No volumes mounted.");
                return Ok(());
            }
            println!(
                "{:<5} {:<30} {:<20} {:<20} {:>12}",
                "SLOT", "VOLUME", "MOUNTPOINT", "ENCRYPTION", "SIZE"
            );
            for info in mounted {
                println!(
                    "{:<5} {:<30} {:<20} {:<20} {:>12}",
                    info.slot,
                    info.path.display(),
                    info.mount_point
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    format!("{} ({})", info.encryption_algorithm, info.kdf_name),
                    info.size
                );
            }
            Ok(())
        }

        Command::Create {
            volume,
            size,
            cipher,
            hash,
            legacy,
            password,
            keyfiles,
            filesystem,
            quick,
            sector_size,
            hidden_size,
            hidden_password,
            force,
            non_interactive,
        } => {
            let host = ConsoleHost::new(non_interactive);
            if volume.exists() && !force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    volume.display()
                ));
            }
            let size = parse_size(&size)?;
            let algorithm = EncryptionAlgorithm::from_name(&cipher)?;
            let kdf = Kdf::from_name(&hash, legacy)?;
            let filesystem = FilesystemType::from_name(&filesystem)?;
            let password = obtain_password(password, &host, "Volume password", true)?;
            let hidden_size = hidden_size.map(|s| parse_size(&s)).transpose()?;
            let hidden_password = match (hidden_size.is_some(), hidden_password) {
                (false, _) => None,
                (true, Some(text)) => Some(Password::from_str(&text)?),
                (true, None) => {
                    Some(host.ask_password("Hidden volume password", false)?)
                }
            };

            host.begin_busy("Creating volume");
            let abort = AtomicBool::new(false);
            let mut last_percent = u64::MAX;
            create_volume(
                CreateOptions {
                    path: volume.clone(),
                    size,
                    algorithm,
                    kdf,
                    password,
                    keyfiles,
                    filesystem,
                    quick,
                    sector_size,
                    hidden_size,
                    hidden_password,
                },
                Some(&abort),
                &mut |done, total| {
                    let percent = done * 100 / total.max(1);
                    if percent != last_percent {
                        eprint!("\rFormatting: {percent}%");
                        last_percent = percent;
                    }
                },
            )?;
            if !quick {
                eprintln!();
            }
            host.end_busy();

            if filesystem == FilesystemType::MacOsExt {
                host.show_message(
                    "HFS+ formatting is left to the platform tools: mount the \
                     volume and run newfs on the attached device.",
                );
            }
            println!("Created {} ({} bytes).", volume.display(), size);
            Ok(())
        }

        Command::ChangePassword {
            volume,
            password,
            new_password,
            keyfiles,
            new_keyfiles,
            hash,
            legacy,
            wipe_passes,
            non_interactive,
        } => {
            let host = ConsoleHost::new(non_interactive);
            rng::start()?;
            let old = obtain_password(password, &host, "Current password", false)?;
            let new = obtain_password(new_password, &host, "New password", true)?;
            let kdf = Kdf::from_name(&hash, legacy)?;
            host.begin_busy("Re-encrypting headers");
            change_volume_password(
                &volume,
                old,
                &keyfiles,
                new,
                &new_keyfiles,
                kdf,
                wipe_passes,
            )?;
            host.end_busy();
            println!("Password changed.");
            Ok(())
        }

        Command::BackupHeaders {
            volume,
            output,
            password,
            keyfiles,
            hidden_password,
            force,
            non_interactive,
        } => {
            let host = ConsoleHost::new(non_interactive);
            if output.exists() && !force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    output.display()
                ));
            }
            rng::start()?;
            let password = obtain_password(password, &host, "Volume password", false)?;
            let hidden = hidden_password
                .map(|text| Password::from_str(&text))
                .transpose()?
                .map(|pw| (pw, Vec::new()));
            backup_headers(&volume, password, &keyfiles, hidden, &output)?;
            println!("Headers exported to {}.", output.display());
            Ok(())
        }

        Command::RestoreHeaders {
            volume,
            from,
            use_backup_headers,
            password,
            keyfiles,
            non_interactive,
        } => {
            let host = ConsoleHost::new(non_interactive);
            rng::start()?;
            let password = obtain_password(password, &host, "Volume password", false)?;
            let source = match (from, use_backup_headers) {
                (Some(file), _) => RestoreSource::ExternalFile(file),
                (None, _) => RestoreSource::InternalBackup,
            };
            if !host.ask_yes_no(
                "Restoring will overwrite the current volume header. Continue?",
                false,
            )? {
                return Err(Error::UserAbort.into());
            }
            restore_headers(&volume, password, &keyfiles, source)?;
            println!("Header restored.");
            Ok(())
        }

        Command::CreateKeyfile { output, force } => {
            if output.exists() && !force {
                return Err(anyhow!(
                    "{} already exists (use --force to overwrite)",
                    output.display()
                ));
            }
            rng::start()?;
            let mut bytes = [0u8; 64];
            rng::get_data(&mut bytes, false)?;
            std::fs::write(&output, bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Keyfile written to {}.", output.display());
            Ok(())
        }

        Command::SelfTest => {
            basalt::self_test()?;
            println!("Self-test passed.");
            Ok(())
        }

        Command::AdminHelper => {
            basalt::admin::serve_stdio()?;
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            let code = match err.downcast_ref::<Error>() {
                Some(e) if e.is_password_error() => 2,
                Some(Error::UserAbort) => 3,
                _ => 1,
            };
            ExitCode::from(code)
        }
    }
}
