// src/io/socketcan/link.rs
//
// CAN link control through iproute2.
//
// Bitrate, controller mode, link state and vcan creation all go through
// `ip link`. When the daemon is not running as root a helper such as `sudo`
// or `pkexec` can be configured; it is prepended to every invocation.

use std::path::Path;
use std::process::Command;

use crate::frame::InterfaceMode;
use crate::io::error::IfaceError;

/// `IFF_UP` from `<net/if.h>`
const IFF_UP: u32 = 0x1;

pub struct LinkControl {
    helper: Option<String>,
}

impl LinkControl {
    pub fn new(helper: Option<String>) -> Self {
        LinkControl {
            helper: helper.filter(|h| !h.trim().is_empty()),
        }
    }

    pub fn set_bitrate(&self, iface: &str, bits_per_second: u32) -> Result<(), IfaceError> {
        let bitrate = bits_per_second.to_string();
        self.ip(
            iface,
            &["link", "set", iface, "type", "can", "bitrate", &bitrate],
        )
    }

    pub fn set_mode(&self, iface: &str, mode: InterfaceMode) -> Result<(), IfaceError> {
        let mut args = vec!["link", "set", iface, "type", "can"];
        args.extend_from_slice(&mode_args(mode));
        self.ip(iface, &args)
    }

    pub fn set_up(&self, iface: &str, up: bool) -> Result<(), IfaceError> {
        let state = if up { "up" } else { "down" };
        self.ip(iface, &["link", "set", iface, state])
    }

    pub fn add_vcan(&self, iface: &str) -> Result<(), IfaceError> {
        self.ip(iface, &["link", "add", "dev", iface, "type", "vcan"])
    }

    pub fn delete(&self, iface: &str) -> Result<(), IfaceError> {
        self.ip(iface, &["link", "delete", iface])
    }

    fn ip(&self, iface: &str, args: &[&str]) -> Result<(), IfaceError> {
        let mut cmd = match &self.helper {
            Some(helper) => {
                let mut cmd = Command::new(helper);
                cmd.arg("ip");
                cmd
            }
            None => Command::new("ip"),
        };
        cmd.args(args);

        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                let program = self.helper.as_deref().unwrap_or("ip");
                IfaceError::Unsupported(format!(
                    "{} not found. Install iproute2 or configure the interface manually.",
                    program
                ))
            } else {
                IfaceError::Io(e)
            }
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            format!("ip {} exited with {:?}", args.join(" "), output.status.code())
        } else {
            stderr.trim().to_string()
        };
        Err(classify_ip_error(iface, &detail))
    }
}

/// Controller flags for `ip link set <if> type can ...`
fn mode_args(mode: InterfaceMode) -> [&'static str; 4] {
    match mode {
        InterfaceMode::Normal => ["listen-only", "off", "loopback", "off"],
        InterfaceMode::ListenOnly => ["listen-only", "on", "loopback", "off"],
        InterfaceMode::Loopback => ["listen-only", "off", "loopback", "on"],
    }
}

/// Map `ip` diagnostics onto interface errors.
pub fn classify_ip_error(iface: &str, detail: &str) -> IfaceError {
    if detail.contains("Cannot find device") || detail.contains("No such device") {
        IfaceError::NotFound(iface.to_string())
    } else if detail.contains("Operation not permitted")
        || detail.contains("Permission denied")
        || detail.contains("Not authorized")
    {
        IfaceError::PermissionDenied(iface.to_string())
    } else if detail.contains("Device or resource busy") {
        IfaceError::BusyWhileUp
    } else {
        IfaceError::Link(format!("{}: {}", iface, detail))
    }
}

/// Whether the kernel reports `iface` administratively up.
pub fn is_link_up(iface: &str) -> bool {
    std::fs::read_to_string(format!("/sys/class/net/{}/flags", iface))
        .ok()
        .and_then(|flags| parse_iff_flags(&flags))
        .is_some_and(|flags| flags & IFF_UP != 0)
}

/// Links without a backing device (vcan, vxcan) have no bit timing to set.
pub fn is_virtual_link(iface: &str) -> bool {
    !Path::new(&format!("/sys/class/net/{}/device", iface)).exists()
}

fn parse_iff_flags(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text.strip_prefix("0x").unwrap_or(text);
    u32::from_str_radix(digits, 16).ok()
}
