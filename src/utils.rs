use std::io::{self, Read};
use std::path::Path;

use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use crate::capture::v4l2::layout_for_fourcc;
use crate::capture::LayoutKind;

/// Highest `/dev/videoN` index probed
const MAX_UNITS: usize = 64;

/// Camera unit found on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraUnit {
    pub unit: usize,
    pub path: String,
    pub card: String,
    /// Supported layouts the device advertises
    pub layouts: Vec<LayoutKind>,
}

pub fn unit_path(unit: usize) -> String {
    format!("/dev/video{unit}")
}

pub fn unit_exists(unit: usize) -> bool {
    unit < MAX_UNITS && Path::new(&unit_path(unit)).exists()
}

/// Enumerate capture-capable camera units
pub fn list_camera_units() -> Vec<CameraUnit> {
    let mut units = Vec::new();
    for unit in 0..MAX_UNITS {
        let path = unit_path(unit);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("{} has no capture capability", path);
            continue;
        }

        let layouts = dev
            .enum_formats()
            .map(|formats| {
                formats
                    .iter()
                    .filter_map(|fmt| layout_for_fourcc(fmt.fourcc))
                    .collect()
            })
            .unwrap_or_default();
        info!("Found capture device: {} - {}", path, caps.card);
        units.push(CameraUnit {
            unit,
            path,
            card: caps.card,
            layouts,
        });
    }
    units
}

pub fn print_camera_units(units: &[CameraUnit]) {
    if units.is_empty() {
        println!("No supported cameras detected!");
        return;
    }
    println!("Available camera units:");
    for unit in units {
        let layouts: Vec<&str> = unit.layouts.iter().map(|l| l.name()).collect();
        println!(
            "\t{} {} [{}] (specify -u {})",
            unit.path,
            unit.card,
            layouts.join(", "),
            unit.unit
        );
    }
}

/// Puts stdin in no-echo, non-canonical mode and restores it on drop
pub struct RawTerminal {
    original: Option<Termios>,
}

impl RawTerminal {
    /// A no-op when stdin is not a terminal
    pub fn enable() -> Self {
        let stdin = io::stdin();
        let original = termios::tcgetattr(&stdin).ok();
        if let Some(original) = &original {
            let mut raw = original.clone();
            raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON);
            if let Err(e) = termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw) {
                debug!("failed to enter raw terminal mode: {}", e);
            }
        }
        Self { original }
    }

    pub fn is_terminal(&self) -> bool {
        self.original.is_some()
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Some(original) = &self.original {
            let _ = termios::tcsetattr(io::stdin(), SetArg::TCSANOW, original);
        }
    }
}

/// Block until one byte arrives on stdin.
/// Returns `false` on end of input, which is not a key press.
pub fn wait_for_key() -> io::Result<bool> {
    let mut key = [0u8; 1];
    let n = io::stdin().lock().read(&mut key)?;
    Ok(n == 1)
}
