//! PXELINUX boot method

use super::{BootConfigParams, BootMethod, Protocol};
use crate::error::Result;
use crate::kernel_params::{KernelParameters, compose_kernel_command_line, host_to_uri};
use crate::reader::BootReader;
use regex::Regex;
use std::fmt::Write;
use std::sync::LazyLock;

/// ARP hardware type for Ethernet, the prefix PXELINUX puts before the MAC.
pub const ARP_HTYPE_ETHERNET: u8 = 0x01;

// PXELINUX asks for `pxelinux.cfg/01-<mac>` first, then falls back through
// `pxelinux.cfg/default.<arch>-<subarch>` style names. Both `.` and `-` separate the arch.
static CONFIG_FILE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = format!(
        r"^/*pxelinux\.cfg/(?:{ARP_HTYPE_ETHERNET:02x}-(?P<mac>[0-9a-fA-F]{{2}}(?:[:-][0-9a-fA-F]{{2}}){{5}})|default(?:[.-](?P<arch>\w+)(?:-(?P<subarch>\w+))?)?)$"
    );
    Regex::new(&pattern).unwrap_or_else(|e| panic!("pxelinux config regex: {e}"))
});

/// PXELINUX: `pxelinux.cfg/<mac>`, `pxelinux.cfg/<arch>/...` and friends.
#[derive(Debug, Clone, Copy, Default)]
pub struct PxeBootMethod;

impl PxeBootMethod {
    /// Stateless; every instance is equivalent.
    pub fn new() -> Self {
        Self
    }
}

impl BootMethod for PxeBootMethod {
    fn name(&self) -> &'static str {
        "pxe"
    }

    fn bios_boot_method(&self) -> &'static str {
        "pxe"
    }

    fn match_path(&self, path: &str) -> Option<BootConfigParams> {
        let captures = CONFIG_FILE.captures(path)?;
        let mut params = BootConfigParams::from_captures(&captures);
        params.mac = params.mac.map(|mac| mac.replace('-', ":").to_lowercase());
        Some(params)
    }

    fn render(&self, params: &BootConfigParams, kernel_params: &KernelParameters) -> Result<BootReader> {
        if kernel_params.is_local() {
            return Ok(BootReader::from(
                "DEFAULT local\n\nLABEL local\n  LOCALBOOT 0\n".to_string(),
            ));
        }

        let prefix = match params.protocol {
            Protocol::Tftp => kernel_params.kernel_image_dir(),
            Protocol::Http => format!(
                "http://{}:5248/images/{}",
                host_to_uri(&kernel_params.fs_host),
                kernel_params.kernel_image_dir()
            ),
        };

        let mut config = String::new();
        let _ = writeln!(config, "DEFAULT execute\n");
        let _ = writeln!(config, "LABEL execute");
        let _ = writeln!(config, "  SAY Booting under MAAS direction...");
        let _ = writeln!(config, "  KERNEL {}/{}", prefix, kernel_params.kernel_name());
        let _ = writeln!(config, "  INITRD {}/{}", prefix, kernel_params.initrd_name());
        if let Some(dtb) = kernel_params.dtb_name() {
            let _ = writeln!(config, "  FDT {prefix}/{dtb}");
        }
        let _ = writeln!(config, "  APPEND {}", compose_kernel_command_line(kernel_params));
        let _ = writeln!(config, "  IPAPPEND 2");
        Ok(BootReader::from(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(mac: Option<&str>, arch: Option<&str>, subarch: Option<&str>) -> BootConfigParams {
        BootConfigParams {
            mac: mac.map(str::to_string),
            arch: arch.map(str::to_string),
            subarch: subarch.map(str::to_string),
            ..Default::default()
        }
    }

    fn kernel_params(purpose: &str) -> KernelParameters {
        KernelParameters {
            arch: "amd64".into(),
            subarch: "generic".into(),
            osystem: "ubuntu".into(),
            release: "jammy".into(),
            kernel_osystem: "ubuntu".into(),
            kernel_release: "jammy".into(),
            kernel: Some("ubuntu/amd64/generic/jammy/stable/boot-kernel".into()),
            initrd: Some("ubuntu/amd64/generic/jammy/stable/boot-initrd".into()),
            purpose: purpose.into(),
            fs_host: "10.0.0.2".into(),
            label: "stable".into(),
            kernel_label: "stable".into(),
            ..Default::default()
        }
    }

    async fn render(params: &BootConfigParams, kernel_params: &KernelParameters) -> String {
        let reader = PxeBootMethod::new().render(params, kernel_params).unwrap();
        String::from_utf8(reader.into_bytes().await.unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_match_mac_path() {
        let method = PxeBootMethod::new();
        assert_eq!(
            method.match_path("pxelinux.cfg/01-AA-BB-CC-DD-EE-FF"),
            Some(params(Some("aa:bb:cc:dd:ee:ff"), None, None))
        );
        assert_eq!(
            method.match_path("//pxelinux.cfg/01-aa:bb:cc:dd:ee:ff"),
            Some(params(Some("aa:bb:cc:dd:ee:ff"), None, None))
        );
    }

    #[test]
    fn test_match_default_paths() {
        let method = PxeBootMethod::new();
        assert_eq!(method.match_path("/pxelinux.cfg/default"), Some(params(None, None, None)));
        assert_eq!(
            method.match_path("pxelinux.cfg/default.i386"),
            Some(params(None, Some("i386"), None))
        );
        assert_eq!(
            method.match_path("pxelinux.cfg/default-amd64-hwe"),
            Some(params(None, Some("amd64"), Some("hwe")))
        );
    }

    #[test]
    fn test_no_match() {
        let method = PxeBootMethod::new();
        assert_eq!(method.match_path("pxelinux.cfg/02-aa-bb-cc-dd-ee-ff"), None);
        assert_eq!(method.match_path("pxelinux.cfg/C0A80001"), None);
        assert_eq!(method.match_path("pxelinux.0"), None);
        assert_eq!(method.match_path("pxelinux.cfg/defaults"), None);
    }

    #[tokio::test]
    async fn test_render_local() {
        let config = render(&BootConfigParams::default(), &kernel_params("local")).await;
        assert!(config.starts_with("DEFAULT local"));
        assert!(config.contains("LOCALBOOT 0"));
    }

    #[tokio::test]
    async fn test_render_commissioning() {
        let mut kernel_params = kernel_params("commissioning");
        kernel_params.boot_dtb = Some("ubuntu/arm64/generic/jammy/stable/boot-dtb".into());
        let config = render(&BootConfigParams::default(), &kernel_params).await;
        assert!(config.starts_with("DEFAULT "));
        assert!(config.contains("  KERNEL ubuntu/amd64/generic/jammy/stable/boot-kernel\n"));
        assert!(config.contains("  INITRD ubuntu/amd64/generic/jammy/stable/boot-initrd\n"));
        assert!(config.contains("  FDT ubuntu/amd64/generic/jammy/stable/boot-dtb\n"));
        assert!(config.contains("  APPEND nomodeset"));
    }

    #[tokio::test]
    async fn test_render_http_and_missing_kernel() {
        let mut kernel_params = kernel_params("commissioning");
        kernel_params.kernel = None;
        kernel_params.kernel_label = "no-such-image".into();
        let params = BootConfigParams {
            protocol: Protocol::Http,
            ..Default::default()
        };
        let config = render(&params, &kernel_params).await;
        assert!(config.contains(
            "  KERNEL http://10.0.0.2:5248/images/ubuntu/amd64/generic/jammy/no-such-image/boot-kernel\n"
        ));
    }
}
