//! Kernel parameters
//!
//! What a boot method needs to render a config: the region's boot configuration with the
//! system id removed and the image labels resolved.

use crate::rpc::BootConfig;

/// Label used when the region names no image for a slot.
pub const NO_SUCH_IMAGE: &str = "no-such-image";

/// Label used for machines told to boot from local disk.
pub const LOCAL_LABEL: &str = "local";

/// Kernel file name when the region names none.
pub const DEFAULT_KERNEL_NAME: &str = "boot-kernel";
/// Initrd file name when the region names none.
pub const DEFAULT_INITRD_NAME: &str = "boot-initrd";
/// Device tree file name when the region names none.
pub const DEFAULT_DTB_NAME: &str = "boot-dtb";

/// Purposes that boot the ephemeral environment over the network.
const EPHEMERAL_PURPOSES: [&str; 3] = ["commissioning", "enlist", "xinstall"];

/// Everything a boot config template needs, derived from the region's boot config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelParameters {
    /// Architecture, e.g. `amd64`.
    pub arch: String,
    /// Subarchitecture, e.g. `generic`.
    pub subarch: String,
    /// Operating system, e.g. `ubuntu`.
    pub osystem: String,
    /// Release, e.g. `noble`.
    pub release: String,
    /// OS the kernel comes from; differs from `osystem` for custom images.
    pub kernel_osystem: String,
    /// Release the kernel comes from.
    pub kernel_release: String,
    /// Kernel path under the image directory.
    pub kernel: Option<String>,
    /// Initrd path under the image directory.
    pub initrd: Option<String>,
    /// Device tree, ARM only.
    pub boot_dtb: Option<String>,
    /// Root image path for ephemeral boots.
    pub xinstall_path: String,
    /// `commissioning`, `xinstall`, `local` and so on.
    pub purpose: String,
    /// Node hostname.
    pub hostname: String,
    /// Node domain.
    pub domain: String,
    /// Where the installer fetches its preseed.
    pub preseed_url: String,
    /// Host serving the root filesystem.
    pub fs_host: String,
    /// Remote syslog host.
    pub log_host: String,
    /// Remote syslog port.
    pub log_port: Option<u16>,
    /// Appended verbatim to the kernel command line.
    pub extra_opts: String,
    /// Options for ephemeral boots only.
    pub ephemeral_opts: Option<String>,
    /// Whether the kernel and initrd are loaded over HTTP.
    pub http_boot: bool,
    /// Label of the root/install image.
    pub label: String,
    /// Label of the kernel image.
    pub kernel_label: String,
}

impl KernelParameters {
    /// Builds parameters from a boot config whose labels have already been decided.
    pub fn from_boot_config(config: BootConfig, label: String, kernel_label: String) -> Self {
        Self {
            arch: config.arch,
            subarch: config.subarch,
            osystem: config.osystem,
            release: config.release,
            kernel_osystem: config.kernel_osystem,
            kernel_release: config.kernel_release,
            kernel: config.kernel,
            initrd: config.initrd,
            boot_dtb: config.boot_dtb,
            xinstall_path: config.xinstall_path.unwrap_or_default(),
            purpose: config.purpose,
            hostname: config.hostname,
            domain: config.domain,
            preseed_url: config.preseed_url,
            fs_host: config.fs_host,
            log_host: config.log_host,
            log_port: config.log_port,
            extra_opts: config.extra_opts,
            ephemeral_opts: config.ephemeral_opts,
            http_boot: config.http_boot.unwrap_or(false),
            label,
            kernel_label,
        }
    }

    /// Boots from the local disk.
    pub fn is_local(&self) -> bool {
        self.purpose == LOCAL_LABEL
    }

    /// Boots the ephemeral environment over the network.
    pub fn is_ephemeral(&self) -> bool {
        EPHEMERAL_PURPOSES.contains(&self.purpose.as_str())
    }

    /// Directory holding the kernel, initrd and dtb.
    pub fn kernel_image_dir(&self) -> String {
        compose_image_path(
            &self.kernel_osystem,
            &self.arch,
            &self.subarch,
            &self.kernel_release,
            &self.kernel_label,
        )
    }

    /// Directory holding the root/install image.
    pub fn image_dir(&self) -> String {
        compose_image_path(
            &self.osystem,
            &self.arch,
            &self.subarch,
            &self.release,
            &self.label,
        )
    }

    /// Kernel file name, without its directory.
    pub fn kernel_name(&self) -> &str {
        file_name_or(self.kernel.as_deref(), DEFAULT_KERNEL_NAME)
    }

    /// Initrd file name, without its directory.
    pub fn initrd_name(&self) -> &str {
        file_name_or(self.initrd.as_deref(), DEFAULT_INITRD_NAME)
    }

    /// Device tree file name, only when the region asked for one.
    pub fn dtb_name(&self) -> Option<&str> {
        self.boot_dtb
            .as_deref()
            .map(|dtb| file_name_or(Some(dtb), DEFAULT_DTB_NAME))
    }

    /// `hostname.domain`, or the bare hostname without a domain.
    pub fn fqdn(&self) -> String {
        if self.domain.is_empty() {
            self.hostname.clone()
        } else {
            format!("{}.{}", self.hostname, self.domain)
        }
    }
}

/// `<osystem>/<arch>/<subarch>/<release>/<label>`, relative to the image root.
pub fn compose_image_path(
    osystem: &str,
    arch: &str,
    subarch: &str,
    release: &str,
    label: &str,
) -> String {
    format!("{osystem}/{arch}/{subarch}/{release}/{label}")
}

/// Splits an image path into the label directory right above the file and the file name.
///
/// `ubuntu/amd64/ga-20.04/focal/stable/boot-kernel` gives `(Some("stable"), "boot-kernel")`.
pub fn split_image_path(path: &str) -> (Option<&str>, &str) {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some((dir, file)) => {
            let label = dir.rsplit('/').next().filter(|label| !label.is_empty());
            (label, file)
        }
        None => (None, path),
    }
}

fn file_name_or<'a>(path: Option<&'a str>, default: &'a str) -> &'a str {
    match path.map(|p| split_image_path(p).1) {
        Some(name) if !name.is_empty() => name,
        _ => default,
    }
}

/// Brackets IPv6 literals so they can sit in a URL authority.
pub fn host_to_uri(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// The kernel command line handed to every network-booted kernel.
pub fn compose_kernel_command_line(params: &KernelParameters) -> String {
    let mut options: Vec<String> = vec!["nomodeset".to_string()];

    if params.is_ephemeral() {
        if !params.xinstall_path.is_empty() {
            let (_, root_image) = split_image_path(&params.xinstall_path);
            options.push(format!(
                "ro root=squash:http://{}:5248/images/{}/{}",
                host_to_uri(&params.fs_host),
                params.image_dir(),
                root_image
            ));
        }
        options.push(format!("ip=::::{}:BOOTIF", params.hostname));
        if !params.fs_host.contains(':') {
            options.push("ip6=off".to_string());
        }
        options.push("overlayroot=tmpfs".to_string());
        options.push("overlayroot_cfgdisk=disabled".to_string());
        options.push("cc:{'datasource_list': ['MAAS']}end_cc".to_string());
        options.push(format!("cloud-config-url={}", params.preseed_url));
        options.push("apparmor=0".to_string());
        if let Some(ephemeral_opts) = params.ephemeral_opts.as_deref().filter(|o| !o.is_empty()) {
            options.push(ephemeral_opts.to_string());
        }
    } else {
        options.push(format!("cloud-config-url={}", params.preseed_url));
    }

    if !params.log_host.is_empty() {
        options.push(format!("log_host={}", params.log_host));
        if let Some(port) = params.log_port {
            options.push(format!("log_port={port}"));
        }
    }

    if !params.extra_opts.is_empty() {
        options.push(params.extra_opts.clone());
    }

    options.join(" ")
}
