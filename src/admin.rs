//! Privilege-separated helper process.
//!
//! Attaching a block device needs privileges the front-end does not have.
//! The core re-execs itself as a helper (elevated by the platform's usual
//! means) and talks to it over its stdio pipe with a line-oriented
//! `key=value` request/response protocol, one blank-line-terminated frame
//! per call. The child holds no state between calls; the parent enforces a
//! timeout on every round trip.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use crate::error::{Error, Result};

/// Per-call timeout for helper round trips.
pub const ADMIN_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminRequest {
    GetHostDevices,
    GetDeviceSize { path: PathBuf },
    Mount { path: PathBuf, mount_point: PathBuf, read_only: bool },
    Dismount { slot: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminResponse {
    Devices(Vec<HostDevice>),
    DeviceSize(u64),
    Done,
    Failed { message: String },
}

impl AdminRequest {
    fn encode(&self) -> String {
        match self {
            AdminRequest::GetHostDevices => "op=get-host-devices\n\n".to_string(),
            AdminRequest::GetDeviceSize { path } => {
                format!("op=get-device-size\npath={}\n\n", path.display())
            }
            AdminRequest::Mount {
                path,
                mount_point,
                read_only,
            } => format!(
                "op=mount\npath={}\nmountpoint={}\nreadonly={}\n\n",
                path.display(),
                mount_point.display(),
                read_only
            ),
            AdminRequest::Dismount { slot } => format!("op=dismount\nslot={slot}\n\n"),
        }
    }

    fn decode(frame: &[(String, String)]) -> Option<AdminRequest> {
        let field = |key: &str| {
            frame
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        match field("op")? {
            "get-host-devices" => Some(AdminRequest::GetHostDevices),
            "get-device-size" => Some(AdminRequest::GetDeviceSize {
                path: PathBuf::from(field("path")?),
            }),
            "mount" => Some(AdminRequest::Mount {
                path: PathBuf::from(field("path")?),
                mount_point: PathBuf::from(field("mountpoint")?),
                read_only: field("readonly")? == "true",
            }),
            "dismount" => Some(AdminRequest::Dismount {
                slot: field("slot")?.parse().ok()?,
            }),
            _ => None,
        }
    }
}

impl AdminResponse {
    fn encode(&self) -> String {
        match self {
            AdminResponse::Devices(devices) => {
                let mut out = String::from("status=ok\nkind=devices\n");
                out.push_str(&format!("count={}\n", devices.len()));
                for (i, dev) in devices.iter().enumerate() {
                    out.push_str(&format!("device{i}={}\n", dev.path.display()));
                    out.push_str(&format!("size{i}={}\n", dev.size));
                }
                out.push('\n');
                out
            }
            AdminResponse::DeviceSize(size) => {
                format!("status=ok\nkind=size\nsize={size}\n\n")
            }
            AdminResponse::Done => "status=ok\nkind=done\n\n".to_string(),
            AdminResponse::Failed { message } => {
                format!("status=error\nmessage={message}\n\n")
            }
        }
    }

    fn decode(frame: &[(String, String)]) -> Option<AdminResponse> {
        let field = |key: &str| {
            frame
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        };
        match field("status")? {
            "error" => Some(AdminResponse::Failed {
                message: field("message").unwrap_or("helper failure").to_string(),
            }),
            "ok" => match field("kind")? {
                "devices" => {
                    let count: usize = field("count")?.parse().ok()?;
                    let mut devices = Vec::with_capacity(count);
                    for i in 0..count {
                        devices.push(HostDevice {
                            path: PathBuf::from(field(&format!("device{i}"))?),
                            size: field(&format!("size{i}"))?.parse().ok()?,
                        });
                    }
                    Some(AdminResponse::Devices(devices))
                }
                "size" => Some(AdminResponse::DeviceSize(field("size")?.parse().ok()?)),
                "done" => Some(AdminResponse::Done),
                _ => None,
            },
            _ => None,
        }
    }
}

fn read_frame(reader: &mut impl BufRead) -> std::io::Result<Option<Vec<(String, String)>>> {
    let mut frame = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(if frame.is_empty() { None } else { Some(frame) });
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(Some(frame));
        }
        if let Some((key, value)) = trimmed.split_once('=') {
            frame.push((key.to_string(), value.to_string()));
        }
    }
}

/// Helper-side request handlers.
mod handlers {
    use super::*;
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    pub fn get_device_size(path: &PathBuf) -> Result<u64> {
        let mut file = File::open(path).map_err(|e| Error::system_path(e, path))?;
        // Works for regular files and for device nodes, where metadata
        // length is zero.
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| Error::system_path(e, path))?;
        Ok(size)
    }

    #[cfg(target_os = "linux")]
    pub fn get_host_devices() -> Result<Vec<HostDevice>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir("/sys/block") {
            Ok(entries) => entries,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("loop") || name.starts_with("ram") {
                continue;
            }
            let sectors: u64 = std::fs::read_to_string(entry.path().join("size"))
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
            if sectors == 0 {
                continue;
            }
            out.push(HostDevice {
                path: PathBuf::from(format!("/dev/{name}")),
                size: sectors * 512,
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn get_host_devices() -> Result<Vec<HostDevice>> {
        Ok(Vec::new())
    }
}

fn handle(request: AdminRequest) -> AdminResponse {
    let result = match request {
        AdminRequest::GetHostDevices => handlers::get_host_devices().map(AdminResponse::Devices),
        AdminRequest::GetDeviceSize { path } => {
            handlers::get_device_size(&path).map(AdminResponse::DeviceSize)
        }
        // Kernel attach/detach belongs to the platform integration layer;
        // the protocol slot exists so front-ends on integrated platforms
        // can use the same helper.
        AdminRequest::Mount { .. } | AdminRequest::Dismount { .. } => {
            Err(Error::NotImplemented("kernel mount via admin helper"))
        }
    };
    match result {
        Ok(response) => response,
        Err(err) => AdminResponse::Failed {
            message: err.to_string(),
        },
    }
}

/// Run the helper side over stdio until the pipe closes. Invoked by the
/// hidden `admin-helper` CLI mode in the re-execed child.
pub fn serve_stdio() -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = stdout.lock();

    while let Some(frame) = read_frame(&mut reader).map_err(|e| Error::system(e, "admin pipe"))? {
        let response = match AdminRequest::decode(&frame) {
            Some(request) => {
                log::debug!("admin helper handling {request:?}");
                handle(request)
            }
            None => AdminResponse::Failed {
                message: "malformed request".to_string(),
            },
        };
        writer
            .write_all(response.encode().as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::system(e, "admin pipe"))?;
    }
    Ok(())
}

/// Parent-side connection to a running helper child.
pub struct AdminClient {
    child: Child,
    responses: mpsc::Receiver<AdminResponse>,
}

impl AdminClient {
    /// Re-exec the current binary as the helper. `elevate` wraps the
    /// command with the platform's privilege prompt (e.g. sudo) when set.
    pub fn spawn(elevate: bool) -> Result<AdminClient> {
        let exe = std::env::current_exe().map_err(|e| Error::system(e, "current executable"))?;
        let mut command = if elevate {
            let mut c = Command::new("sudo");
            c.arg(&exe);
            c
        } else {
            Command::new(&exe)
        };
        let mut child = command
            .arg("admin-helper")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::system(e, "admin helper spawn"))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let (sender, responses) = mpsc::channel();
        std::thread::Builder::new()
            .name("basalt-admin-reader".to_string())
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                while let Ok(Some(frame)) = read_frame(&mut reader) {
                    let Some(response) = AdminResponse::decode(&frame) else {
                        break;
                    };
                    if sender.send(response).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| Error::system(e, "admin reader thread"))?;

        Ok(AdminClient { child, responses })
    }

    /// One request/response round trip, bounded by [`ADMIN_CALL_TIMEOUT`].
    pub fn call(&mut self, request: AdminRequest) -> Result<AdminResponse> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or(Error::ParameterIncorrect("admin helper stdin closed"))?;
        stdin
            .write_all(request.encode().as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| Error::system(e, "admin pipe"))?;

        self.responses
            .recv_timeout(ADMIN_CALL_TIMEOUT)
            .map_err(|_| Error::SystemError {
                code: 0,
                subject: "admin helper".to_string(),
                message: "no response within timeout".to_string(),
            })
    }
}

impl Drop for AdminClient {
    fn drop(&mut self) {
        // Closing stdin ends the helper's serve loop.
        self.child.stdin.take();
        let _ = self.child.wait();
    }
}
