//! Architecture registry
//!
//! Boot firmware and boot-method paths name architectures the PXE way (`x86_64`,
//! `aarch64`, `arm`); the region expects MAAS names (`amd64/generic`).

use std::collections::HashMap;

/// A bootable architecture and the PXE aliases it answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Architecture {
    /// MAAS name, `<arch>/<subarch>`.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Names PXE clients use for this architecture.
    pub pxealiases: Vec<String>,
}

impl Architecture {
    /// `name` is `<arch>/<subarch>`.
    pub fn new(name: &str, description: &str, pxealiases: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            pxealiases: pxealiases.iter().map(|alias| alias.to_string()).collect(),
        }
    }

    /// The part of the name before `/`.
    pub fn arch(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }
}

/// Explicitly constructed lookup table, passed to whatever needs it.
#[derive(Debug, Clone, Default)]
pub struct ArchitectureRegistry {
    architectures: Vec<Architecture>,
    by_alias: HashMap<String, usize>,
}

impl ArchitectureRegistry {
    /// Empty registry; see [`ArchitectureRegistry::with_defaults`] for the MAAS set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The architectures MAAS boots.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Architecture::new("i386/generic", "i386", &["i386"]));
        registry.register(Architecture::new(
            "amd64/generic",
            "amd64",
            &["amd64", "x86_64"],
        ));
        registry.register(Architecture::new(
            "arm64/generic",
            "arm64",
            &["arm64", "aarch64"],
        ));
        registry.register(Architecture::new("armhf/generic", "armhf", &["arm", "armhf"]));
        registry.register(Architecture::new(
            "ppc64el/generic",
            "ppc64el",
            &["ppc64el", "ppc64le"],
        ));
        registry.register(Architecture::new("s390x/generic", "s390x", &["s390x"]));
        registry
    }

    /// Adds `architecture`. A later registration takes over any alias it shares.
    pub fn register(&mut self, architecture: Architecture) {
        let index = self.architectures.len();
        for alias in &architecture.pxealiases {
            self.by_alias.insert(alias.clone(), index);
        }
        self.architectures.push(architecture);
    }

    /// Looks up an architecture by a PXE alias such as `arm64`.
    pub fn get_by_pxealias(&self, alias: &str) -> Option<&Architecture> {
        self.by_alias
            .get(alias)
            .and_then(|index| self.architectures.get(*index))
    }

    /// Every registered architecture, in registration order.
    pub fn architectures(&self) -> &[Architecture] {
        &self.architectures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_alias() {
        let registry = ArchitectureRegistry::with_defaults();
        let arch = registry.get_by_pxealias("x86_64").unwrap();
        assert_eq!(arch.name, "amd64/generic");
        assert_eq!(arch.arch(), "amd64");
        assert_eq!(registry.get_by_pxealias("aarch64").unwrap().arch(), "arm64");
        assert_eq!(registry.get_by_pxealias("arm").unwrap().arch(), "armhf");
        assert!(registry.get_by_pxealias("riscv64").is_none());
    }

    #[test]
    fn test_later_registration_wins_alias() {
        let mut registry = ArchitectureRegistry::new();
        registry.register(Architecture::new("armhf/generic", "armhf", &["arm"]));
        registry.register(Architecture::new("armhf/hardbank", "armhf", &["arm"]));
        assert_eq!(registry.get_by_pxealias("arm").unwrap().name, "armhf/hardbank");
        assert_eq!(registry.architectures().len(), 2);
    }
}
