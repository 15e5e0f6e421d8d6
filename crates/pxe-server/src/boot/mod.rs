//! Boot methods
//!
//! A boot method recognises the config paths one kind of firmware asks for and renders the
//! config for it. The [`BootMethodRegistry`] tries each method in registration order.

pub mod grub;
pub mod pxe;

use crate::error::Result;
use crate::kernel_params::KernelParameters;
use crate::reader::BootReader;
use regex::Captures;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

pub use grub::UefiGrubBootMethod;
pub use pxe::PxeBootMethod;

/// Transport a file was requested over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[default]
    Tftp,
    Http,
}

impl Protocol {
    /// Lowercase name, as used in boot configs.
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tftp => "tftp",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context carried through one boot request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootConfigParams {
    /// Client MAC, from the path or the ARP table.
    pub mac: Option<String>,
    /// Architecture, e.g. `amd64`.
    pub arch: Option<String>,
    /// Subarchitecture, e.g. `generic`.
    pub subarch: Option<String>,
    /// SMBIOS UUID, when the path carries one.
    pub hardware_uuid: Option<String>,
    /// Identifier of the boot method that matched.
    pub bios_boot_method: Option<String>,
    /// Address the request arrived on.
    pub local: Option<SocketAddr>,
    /// Client address.
    pub remote: Option<SocketAddr>,
    /// Transport the request used.
    pub protocol: Protocol,
}

impl BootConfigParams {
    /// Reads the `mac`, `arch` and `subarch` groups of a path match.
    pub(crate) fn from_captures(captures: &Captures<'_>) -> Self {
        let group = |name: &str| captures.name(name).map(|m| m.as_str().to_string());
        Self {
            mac: group("mac"),
            arch: group("arch"),
            subarch: group("subarch"),
            ..Default::default()
        }
    }
}

/// A boot loader family: which paths it owns and how its config is rendered.
pub trait BootMethod: Send + Sync {
    fn name(&self) -> &'static str;

    /// Identifier reported to the region as `bios_boot_method`.
    fn bios_boot_method(&self) -> &'static str;

    /// Parameters encoded in `path`, if this method serves it.
    fn match_path(&self, path: &str) -> Option<BootConfigParams>;

    /// Renders the config for a matched request.
    fn render(&self, params: &BootConfigParams, kernel_params: &KernelParameters) -> Result<BootReader>;
}

/// Boot methods, matched in registration order.
#[derive(Clone, Default)]
pub struct BootMethodRegistry {
    methods: Vec<Arc<dyn BootMethod>>,
}

impl BootMethodRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// PXELINUX, then UEFI GRUB.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PxeBootMethod::new()));
        registry.register(Arc::new(UefiGrubBootMethod::new()));
        registry
    }

    /// Adds `method` after those already registered.
    pub fn register(&mut self, method: Arc<dyn BootMethod>) {
        self.methods.push(method);
    }

    /// Method registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn BootMethod>> {
        self.methods.iter().find(|m| m.name() == name).cloned()
    }

    /// First method recognising `path`, with its parameters stamped with the method's
    /// `bios_boot_method`.
    pub fn match_path(&self, path: &str) -> Option<(Arc<dyn BootMethod>, BootConfigParams)> {
        self.methods.iter().find_map(|method| {
            method.match_path(path).map(|mut params| {
                params.bios_boot_method = Some(method.bios_boot_method().to_string());
                (Arc::clone(method), params)
            })
        })
    }

    /// Registered method names, in match order.
    pub fn names(&self) -> Vec<&'static str> {
        self.methods.iter().map(|m| m.name()).collect()
    }
}

impl fmt::Debug for BootMethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootMethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_registry_order_and_stamp() {
        let registry = BootMethodRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["pxe", "uefi_amd64_tftp"]);

        let (method, params) = registry.match_path("pxelinux.cfg/default").unwrap();
        assert_eq!(method.name(), "pxe");
        assert_eq!(params.bios_boot_method.as_deref(), Some("pxe"));

        let (method, params) = registry.match_path("/grub/grub.cfg-default-amd64").unwrap();
        assert_eq!(method.name(), "uefi_amd64_tftp");
        assert_eq!(params.bios_boot_method.as_deref(), Some("uefi"));
        assert_eq!(params.arch.as_deref(), Some("amd64"));
    }

    #[test]
    fn test_registry_no_match() {
        let registry = BootMethodRegistry::with_defaults();
        assert!(registry.match_path("pxelinux.0").is_none());
        assert!(registry.match_path("grub/grub.cfg").is_none());
        assert!(registry.get("pxe").is_some());
        assert!(registry.get("ipxe").is_none());
    }
}
