//! Discovery of device nodes by driver name.
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use super::{DeviceConfig, DeviceOpenError, M2mDevice, V4l2Device};

/// A candidate device node and the driver name it advertises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub name: String,
    pub path: PathBuf,
}

/// A place where device nodes can be looked up and opened.
pub trait DeviceNamespace {
    type Device: M2mDevice;

    /// Returns all nodes whose driver name contains `signature`, in ascending node order.
    fn find(&self, signature: &str) -> Vec<DeviceNode>;
    fn open(&self, node: &DeviceNode, config: &DeviceConfig)
        -> Result<Self::Device, DeviceOpenError>;
}

/// Namespace backed by the `video4linux` sysfs class.
#[derive(Debug, Clone)]
pub struct SysfsNamespace {
    class_root: PathBuf,
    dev_root: PathBuf,
}

impl Default for SysfsNamespace {
    fn default() -> Self {
        SysfsNamespace::new("/sys/class/video4linux", "/dev")
    }
}

/// Numeric suffix of a `videoN` entry.
fn node_number(entry: &str) -> Option<u32> {
    entry.strip_prefix("video")?.parse().ok()
}

impl SysfsNamespace {
    pub fn new(class_root: impl Into<PathBuf>, dev_root: impl Into<PathBuf>) -> Self {
        SysfsNamespace {
            class_root: class_root.into(),
            dev_root: dev_root.into(),
        }
    }

    fn read_name(&self, entry: &Path) -> Option<String> {
        fs::read_to_string(entry.join("name"))
            .ok()
            .map(|name| name.trim().to_owned())
    }
}

impl DeviceNamespace for SysfsNamespace {
    type Device = V4l2Device;

    fn find(&self, signature: &str) -> Vec<DeviceNode> {
        let entries = match fs::read_dir(&self.class_root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot scan {}: {}", self.class_root.display(), e);
                return Vec::new();
            }
        };

        let mut nodes: Vec<(u32, DeviceNode)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let number = node_number(&file_name)?;
                let name = self.read_name(&entry.path())?;
                trace!("{}: {}", file_name, name);
                if !name.contains(signature) {
                    return None;
                }
                Some((
                    number,
                    DeviceNode {
                        name,
                        path: self.dev_root.join(file_name),
                    },
                ))
            })
            .collect();
        nodes.sort_by_key(|(number, _)| *number);

        nodes.into_iter().map(|(_, node)| node).collect()
    }

    fn open(
        &self,
        node: &DeviceNode,
        config: &DeviceConfig,
    ) -> Result<Self::Device, DeviceOpenError> {
        V4l2Device::open(&node.path, config)
    }
}
