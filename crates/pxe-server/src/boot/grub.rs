//! UEFI GRUB boot method

use super::{BootConfigParams, BootMethod, Protocol};
use crate::error::Result;
use crate::kernel_params::{KernelParameters, compose_kernel_command_line, host_to_uri};
use crate::reader::BootReader;
use regex::Regex;
use std::fmt::Write;
use std::sync::LazyLock;

// GRUB asks for `grub/grub.cfg-<mac>`, then `grub/grub.cfg-default-<arch>-<subarch>` and
// its shorter forms. The bare `grub/grub.cfg` is a static file.
static CONFIG_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^/*grub/grub\.cfg-(?:(?P<mac>[0-9a-fA-F]{2}(?:[:-][0-9a-fA-F]{2}){5})|default(?:-(?P<arch>\w+)(?:-(?P<subarch>\w+))?)?)$",
    )
    .unwrap_or_else(|e| panic!("grub config regex: {e}"))
});

/// EFI loaders tried, in order, when booting from local disk.
const LOCAL_LOADERS: [&str; 3] = [
    "/efi/ubuntu/shimx64.efi",
    "/efi/ubuntu/grubx64.efi",
    "/efi/boot/bootx64.efi",
];

/// UEFI GRUB: `grub/grub.cfg` and its per-MAC variants.
#[derive(Debug, Clone, Copy, Default)]
pub struct UefiGrubBootMethod;

impl UefiGrubBootMethod {
    /// Stateless; every instance is equivalent.
    pub fn new() -> Self {
        Self
    }
}

/// GRUB reports the running architecture by its kernel name.
fn normalise_arch(arch: String) -> String {
    match arch.as_str() {
        "x86_64" => "amd64".to_string(),
        "powerpc" | "ppc64" | "ppc64le" => "ppc64el".to_string(),
        _ => arch,
    }
}

fn render_local() -> String {
    let mut config = String::from("set default=\"0\"\nset timeout=0\n\nmenuentry 'Local' {\n");
    config.push_str("    echo 'Booting local disk...'\n");
    for loader in LOCAL_LOADERS {
        let _ = writeln!(config, "    search --set=root --file {loader}");
        config.push_str("    if [ $? -eq 0 ]; then\n");
        let _ = writeln!(config, "        chainloader {loader}");
        config.push_str("        boot\n    fi\n");
    }
    config.push_str("    exit\n}\n");
    config
}

impl BootMethod for UefiGrubBootMethod {
    fn name(&self) -> &'static str {
        "uefi_amd64_tftp"
    }

    fn bios_boot_method(&self) -> &'static str {
        "uefi"
    }

    fn match_path(&self, path: &str) -> Option<BootConfigParams> {
        let captures = CONFIG_FILE.captures(path)?;
        let mut params = BootConfigParams::from_captures(&captures);
        params.mac = params.mac.map(|mac| mac.replace(':', "-").to_lowercase());
        params.arch = params.arch.map(normalise_arch);
        Some(params)
    }

    fn render(&self, params: &BootConfigParams, kernel_params: &KernelParameters) -> Result<BootReader> {
        if kernel_params.is_local() {
            return Ok(BootReader::from(render_local()));
        }

        let prefix = match params.protocol {
            Protocol::Tftp => format!("(http,{}:5248)/images", host_to_uri(&kernel_params.fs_host)),
            Protocol::Http => "/images".to_string(),
        };
        let image_dir = kernel_params.kernel_image_dir();
        let title = if kernel_params.is_ephemeral() {
            "Ephemeral"
        } else {
            "Install"
        };

        let mut config = String::from("set default=\"0\"\nset timeout=0\n\n");
        let _ = writeln!(config, "menuentry '{title}' {{");
        config.push_str("    echo   'Booting under MAAS direction...'\n");
        let _ = writeln!(
            config,
            "    echo   '{}/{}/{}/{} {}'",
            kernel_params.osystem,
            kernel_params.arch,
            kernel_params.subarch,
            kernel_params.release,
            kernel_params.purpose
        );
        let _ = writeln!(
            config,
            "    linux  {}/{}/{} {}",
            prefix,
            image_dir,
            kernel_params.kernel_name(),
            compose_kernel_command_line(kernel_params)
        );
        let _ = writeln!(
            config,
            "    initrd {}/{}/{}",
            prefix,
            image_dir,
            kernel_params.initrd_name()
        );
        if let Some(dtb) = kernel_params.dtb_name() {
            let _ = writeln!(config, "    devicetree {prefix}/{image_dir}/{dtb}");
        }
        config.push_str("    boot\n}\n");
        Ok(BootReader::from(config))
    }
}
