//! TFTP backend
//!
//! Decides what to serve for a requested path. Paths a boot method recognises get a config
//! rendered from the region's boot configuration; everything else comes from the TFTP root,
//! then from the image cache.

use crate::arch::ArchitectureRegistry;
use crate::arp::ArpTable;
use crate::boot::{BootConfigParams, BootMethod, BootMethodRegistry, Protocol};
use crate::cache::ImageCache;
use crate::error::{BackendError, PxeError, Result, RpcError};
use crate::events::send_node_event_ip_address;
use crate::fetcher::BootConfigFetcher;
use crate::kernel_params::{KernelParameters, LOCAL_LABEL, NO_SUCH_IMAGE, split_image_path};
use crate::reader::BootReader;
use crate::rpc::{
    BootConfig, ClientService, GetBootConfigRequest, MarkNodeFailedRequest, NodeEventType,
    RegionClient,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

/// Where a request came from and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    /// Address the request arrived on.
    pub local: SocketAddr,
    /// Client address.
    pub remote: SocketAddr,
    /// Transport the request used.
    pub protocol: Protocol,
}

impl RequestContext {
    /// Context for a request that reached `local` from `remote`.
    pub fn new(local: SocketAddr, remote: SocketAddr, protocol: Protocol) -> Self {
        Self {
            local,
            remote,
            protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageKind {
    Kernel,
    Boot,
}

impl ImageKind {
    fn as_str(self) -> &'static str {
        match self {
            ImageKind::Kernel => "kernel",
            ImageKind::Boot => "boot",
        }
    }
}

/// Resolves requested paths to readers.
///
/// Boot config paths are rendered from the region's answer; other paths are served from
/// the TFTP root or fetched from the image cache.
pub struct TftpBackend {
    root: PathBuf,
    boot_methods: BootMethodRegistry,
    architectures: ArchitectureRegistry,
    client_service: Arc<dyn ClientService>,
    image_cache: Arc<dyn ImageCache>,
    arp: ArpTable,
    fetcher: BootConfigFetcher,
    /// Region connection each requesting machine was last served by.
    client_to_remote: Mutex<HashMap<IpAddr, Arc<dyn RegionClient>>>,
}

impl TftpBackend {
    /// Backend serving `root`, with the default boot methods, architectures and ARP table.
    pub fn new(
        root: impl Into<PathBuf>,
        client_service: Arc<dyn ClientService>,
        image_cache: Arc<dyn ImageCache>,
    ) -> Self {
        Self {
            root: root.into(),
            boot_methods: BootMethodRegistry::with_defaults(),
            architectures: ArchitectureRegistry::with_defaults(),
            client_service,
            image_cache,
            arp: ArpTable::default(),
            fetcher: BootConfigFetcher::new(),
            client_to_remote: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the default boot methods.
    pub fn with_boot_methods(mut self, boot_methods: BootMethodRegistry) -> Self {
        self.boot_methods = boot_methods;
        self
    }

    /// Replaces the default architectures.
    pub fn with_architectures(mut self, architectures: ArchitectureRegistry) -> Self {
        self.architectures = architectures;
        self
    }

    /// Reads MACs from `arp` instead of the kernel's table.
    pub fn with_arp_table(mut self, arp: ArpTable) -> Self {
        self.arp = arp;
        self
    }

    /// The TFTP root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reader for `file_name`, the entry point for every TFTP and HTTP boot request.
    pub async fn get_reader(
        &self,
        file_name: &str,
        context: RequestContext,
        skip_logging: bool,
    ) -> std::result::Result<BootReader, BackendError> {
        let file_name = file_name.replace('\\', "/");
        if !skip_logging {
            self.log_request(&file_name, &context);
        }

        let result = match self.get_boot_method(&file_name) {
            None => self.get_static_reader(&file_name).await,
            Some((method, mut params)) => {
                params.arch = params.arch.map(|arch| self.translate_arch(arch));
                params.local = Some(context.local);
                params.remote = Some(context.remote);
                params.protocol = context.protocol;
                self.get_boot_method_reader(method.as_ref(), params).await
            }
        };

        result.map_err(|e| match e {
            PxeError::FileNotFound(name) => BackendError::NotFound(name),
            PxeError::Rpc(RpcError::NoResponse) => BackendError::NotFound(file_name.clone()),
            other => {
                error!("TFTP back-end failed: {}", other);
                BackendError::Backend(other.to_string())
            }
        })
    }

    /// The boot method serving `file_name`, if any, with the parameters it decoded.
    pub fn get_boot_method(&self, file_name: &str) -> Option<(Arc<dyn BootMethod>, BootConfigParams)> {
        self.boot_methods.match_path(file_name)
    }

    /// Fetches kernel parameters for `params` and renders the config.
    pub async fn get_boot_method_reader(
        &self,
        method: &dyn BootMethod,
        params: BootConfigParams,
    ) -> Result<BootReader> {
        let kernel_params = self.get_kernel_params(&params).await?;
        method.render(&params, &kernel_params)
    }

    /// Asks the region for the boot configuration of the requesting machine.
    pub async fn get_kernel_params(&self, params: &BootConfigParams) -> Result<KernelParameters> {
        let remote_ip = params.remote.map(|addr| addr.ip());
        let client = self.get_client_for(remote_ip).await?;

        let request = GetBootConfigRequest {
            system_id: client.local_ident().to_string(),
            local_ip: params.local.map(|addr| addr.ip().to_string()).unwrap_or_default(),
            remote_ip: remote_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            arch: params.arch.clone(),
            subarch: params.subarch.clone(),
            mac: params.mac.clone(),
            hardware_uuid: params.hardware_uuid.clone(),
            bios_boot_method: params.bios_boot_method.clone(),
        };

        let config = self.fetcher.fetch(Arc::clone(&client), request).await?;
        Ok(self.get_boot_image(config, &client, remote_ip).await)
    }

    /// Resolves image labels, reporting any image the region pointed at but cannot be found.
    pub async fn get_boot_image(
        &self,
        mut config: BootConfig,
        client: &Arc<dyn RegionClient>,
        remote_ip: Option<IpAddr>,
    ) -> KernelParameters {
        if config.purpose == "local-device" {
            let mac = match remote_ip {
                Some(ip) => self.arp.find_mac(ip).await,
                None => None,
            };
            info!(
                "Device {} with MAC address {} is PXE booting; instructing the device to boot locally.",
                config.hostname,
                mac.as_deref().unwrap_or("unknown")
            );
            config.purpose = LOCAL_LABEL.to_string();
        }

        let system_id = config.system_id.take();

        if config.purpose == LOCAL_LABEL {
            config.xinstall_path = Some(String::new());
            return KernelParameters::from_boot_config(
                config,
                LOCAL_LABEL.to_string(),
                LOCAL_LABEL.to_string(),
            );
        }

        let kernel_label = match config.kernel.as_deref().and_then(|k| split_image_path(k).0) {
            Some(label) => label.to_string(),
            None => {
                let image = format!(
                    "{}/{}/{}/{}",
                    config.kernel_osystem, config.arch, config.subarch, config.kernel_release
                );
                self.handle_image_not_found(ImageKind::Kernel, &image, system_id.as_deref(), client, remote_ip);
                NO_SUCH_IMAGE.to_string()
            }
        };

        let label = match config
            .xinstall_path
            .as_deref()
            .and_then(|path| split_image_path(path).0)
        {
            Some(label) => label.to_string(),
            None => {
                let image = format!(
                    "{}/{}/{}/{}",
                    config.osystem, config.arch, config.subarch, config.release
                );
                self.handle_image_not_found(ImageKind::Boot, &image, system_id.as_deref(), client, remote_ip);
                NO_SUCH_IMAGE.to_string()
            }
        };

        KernelParameters::from_boot_config(config, label, kernel_label)
    }

    /// Fetches `file_name` from the image cache.
    pub async fn get_cache_reader(&self, file_name: &str) -> Result<BootReader> {
        self.image_cache.get(file_name).await
    }

    /// Region connection for `remote_ip`, reusing the one it was served by before while that
    /// connection is still live.
    pub async fn get_client_for(&self, remote_ip: Option<IpAddr>) -> Result<Arc<dyn RegionClient>> {
        let Some(ip) = remote_ip else {
            return Ok(self.client_service.get_client_now().await?);
        };

        let live = self.client_service.get_all_clients();
        let is_live = |client: &Arc<dyn RegionClient>| live.iter().any(|c| c.ident() == client.ident());

        let pinned = self.pinned().get(&ip).cloned();
        if let Some(client) = pinned {
            if is_live(&client) {
                return Ok(client);
            }
            debug!("Region connection for {} is gone, picking another", ip);
        }

        let client = self.client_service.get_client_now().await?;
        let mut pinned = self.pinned();
        pinned.retain(|_, c| is_live(c));
        pinned.insert(ip, Arc::clone(&client));
        Ok(client)
    }

    /// Number of machines pinned to a region connection.
    pub fn pinned_clients(&self) -> usize {
        self.pinned().len()
    }

    fn pinned(&self) -> MutexGuard<'_, HashMap<IpAddr, Arc<dyn RegionClient>>> {
        self.client_to_remote
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn translate_arch(&self, arch: String) -> String {
        match self.architectures.get_by_pxealias(&arch) {
            Some(architecture) => architecture.arch().to_string(),
            None => arch,
        }
    }

    fn log_request(&self, file_name: &str, context: &RequestContext) {
        let remote_ip = context.remote.ip();
        info!("{} requested by {}", file_name, remote_ip);
        let event = match context.protocol {
            Protocol::Tftp => NodeEventType::NodeTftpRequest,
            Protocol::Http => NodeEventType::NodeHttpRequest,
        };
        send_node_event_ip_address(
            Arc::clone(&self.client_service),
            event,
            remote_ip,
            file_name.to_string(),
        );
    }

    fn handle_image_not_found(
        &self,
        kind: ImageKind,
        image: &str,
        system_id: Option<&str>,
        client: &Arc<dyn RegionClient>,
        remote_ip: Option<IpAddr>,
    ) {
        match system_id {
            Some(system_id) => {
                let request = MarkNodeFailedRequest {
                    system_id: system_id.to_string(),
                    error_description: format!("Missing {} image {}.", kind.as_str(), image),
                };
                let client = Arc::clone(client);
                tokio::spawn(async move {
                    if let Err(e) = client.mark_node_failed(request).await {
                        error!("Failed to mark machine failed: {}", e);
                    }
                });
            }
            None => {
                let remote = remote_ip.map_or_else(|| "unknown".to_string(), |ip| ip.to_string());
                error!(
                    "Enlistment failed to boot {}; missing required {} image {}.",
                    remote,
                    kind.as_str(),
                    image
                );
            }
        }
    }

    async fn get_static_reader(&self, file_name: &str) -> Result<BootReader> {
        let Some(path) = resolve_path(&self.root, file_name) else {
            warn!("Rejecting request outside the TFTP root: {}", file_name);
            return Err(PxeError::FileNotFound(file_name.to_string()));
        };

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                debug!("{} not served from {}: {}", file_name, self.root.display(), e);
                return self.get_cache_reader(file_name).await;
            }
        };
        if !file.metadata().await.is_ok_and(|m| m.is_file()) {
            return self.get_cache_reader(file_name).await;
        }
        Ok(BootReader::open(file).await?)
    }
}

impl std::fmt::Debug for TftpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TftpBackend")
            .field("root", &self.root)
            .field("boot_methods", &self.boot_methods)
            .field("pinned_clients", &self.pinned_clients())
            .finish()
    }
}

/// Maps `file_name` under `root`, refusing anything that climbs out of it.
pub fn resolve_path(root: &Path, file_name: &str) -> Option<PathBuf> {
    let mut path = root.to_path_buf();
    for component in Path::new(file_name.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}
