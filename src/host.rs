//! Callbacks the core consumes from the host shell (GUI, CLI, platform
//! integration). The core never prompts or attaches devices itself; it
//! calls through this trait and stays testable without a host.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::memory::Password;
use crate::rng;
use crate::service::Endpoint;

pub trait HostCallbacks {
    /// Prompt for a password. `retry` is set when a previous attempt was
    /// rejected.
    fn ask_password(&self, prompt: &str, retry: bool) -> Result<Password>;

    /// Prompt for a file or directory path.
    fn ask_path(&self, prompt: &str) -> Result<PathBuf>;

    fn ask_yes_no(&self, question: &str, default_yes: bool) -> Result<bool>;

    fn show_message(&self, message: &str);

    /// Long-running operation markers for busy indicators.
    fn begin_busy(&self, what: &str);
    fn end_busy(&self);

    /// Feed host-collected entropy (event timings, pointer positions) into
    /// the RNG pool.
    fn enrich_entropy(&self, bytes: &[u8]) {
        rng::add_to_pool(bytes);
    }

    /// Attach the served endpoint as a host block device / mounted
    /// filesystem. Returns the device path when the platform integration
    /// attached one, `None` when the host leaves mounting to the user.
    fn attach_block_device(
        &self,
        endpoint: &Endpoint,
        mount_point: Option<&Path>,
    ) -> Result<Option<PathBuf>>;

    fn detach_block_device(&self, device_path: &Path) -> Result<()>;
}

/// Terminal-backed host used by the CLI. Attachment is left to the user:
/// the endpoint is printed with a ready-to-run mount hint.
pub struct ConsoleHost {
    pub non_interactive: bool,
}

impl ConsoleHost {
    pub fn new(non_interactive: bool) -> ConsoleHost {
        ConsoleHost { non_interactive }
    }
}

impl HostCallbacks for ConsoleHost {
    fn ask_password(&self, prompt: &str, retry: bool) -> Result<Password> {
        if self.non_interactive {
            return Err(Error::ParameterIncorrect(
                "password required but running non-interactively",
            ));
        }
        if retry {
            eprintln!("Incorrect, try again.");
        }
        let line = rpassword::prompt_password(format!("{prompt}: "))
            .map_err(|e| Error::system(e, "password prompt"))?;
        Password::from_str(&line)
    }

    fn ask_path(&self, prompt: &str) -> Result<PathBuf> {
        if self.non_interactive {
            return Err(Error::ParameterIncorrect(
                "path required but running non-interactively",
            ));
        }
        eprint!("{prompt}: ");
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| Error::system(e, "path prompt"))?;
        Ok(PathBuf::from(line.trim()))
    }

    fn ask_yes_no(&self, question: &str, default_yes: bool) -> Result<bool> {
        if self.non_interactive {
            return Ok(default_yes);
        }
        eprint!("{question} [{}] ", if default_yes { "Y/n" } else { "y/N" });
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| Error::system(e, "prompt"))?;
        match line.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default_yes),
            "y" | "yes" => Ok(true),
            _ => Ok(false),
        }
    }

    fn show_message(&self, message: &str) {
        eprintln!("{message}");
    }

    fn begin_busy(&self, what: &str) {
        eprintln!("{what}...");
    }

    fn end_busy(&self) {}

    fn attach_block_device(
        &self,
        endpoint: &Endpoint,
        mount_point: Option<&Path>,
    ) -> Result<Option<PathBuf>> {
        let target = mount_point
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<mountpoint>".to_string());
        match endpoint {
            Endpoint::Nfs { addr } => {
                eprintln!(
                    "NFS export ready. Attach with:\n  mount -t nfs -o \
                     vers=4.0,port={},mountport={} 127.0.0.1:/ {}",
                    addr.port(),
                    addr.port(),
                    target
                );
            }
            Endpoint::Iscsi { addr, iqn } => {
                eprintln!(
                    "iSCSI target ready. Attach with:\n  iscsiadm -m node -T {iqn} \
                     -p {addr} --login"
                );
            }
            Endpoint::LoopFile { control_file } => {
                eprintln!(
                    "Volume served; control file at {}",
                    control_file.display()
                );
            }
        }
        Ok(None)
    }

    fn detach_block_device(&self, _device_path: &Path) -> Result<()> {
        Ok(())
    }
}
