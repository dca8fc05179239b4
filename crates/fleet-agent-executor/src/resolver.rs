//! PCI address to host interface name resolution.

use std::path::PathBuf;

/// Maps a PCI address to the name the host network stack uses for it.
pub trait InterfaceResolver: Send + Sync {
    /// Host interface name, or `None` if the device is not bound to a
    /// host driver (e.g. already captured by the dataplane).
    fn host_name(&self, pci: &str) -> Option<String>;
}

/// Resolver reading `/sys/bus/pci/devices/<pci>/net/`.
#[derive(Debug, Clone)]
pub struct SysfsResolver {
    root: PathBuf,
}

impl Default for SysfsResolver {
    fn default() -> Self {
        Self::new("/sys/bus/pci/devices")
    }
}

impl SysfsResolver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl InterfaceResolver for SysfsResolver {
    fn host_name(&self, pci: &str) -> Option<String> {
        let dir = self.root.join(pci_addr_full(pci)).join("net");
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names.into_iter().next()
    }
}

/// Normalize a PCI address to the sysfs form `dddd:bb:ss.f`.
///
/// The manager sends addresses like `0000:00:08.00` or `00:08.0`.
#[must_use]
pub fn pci_addr_full(pci: &str) -> String {
    let (slot, function) = pci.rsplit_once('.').unwrap_or((pci, "0"));
    let slot = if slot.matches(':').count() == 1 {
        format!("0000:{slot}")
    } else {
        slot.to_string()
    };
    let function = function.trim_start_matches('0');
    let function = if function.is_empty() { "0" } else { function };
    format!("{slot}.{function}")
}
