//! Rack-side network boot
//!
//! Everything a rack controller needs to answer PXE/UEFI firmware:
//! - [`backend::TftpBackend`] decides what each requested path resolves to: a boot config
//!   rendered from the region's answer, a file under the TFTP root, or an image-cache download
//! - [`boot`] holds the boot methods (PXELINUX and UEFI GRUB) and their path patterns
//! - [`tftp`] and [`session`] speak the TFTP wire protocol; [`service::TftpService`] keeps one
//!   listener per host address
//! - [`http::HttpBridge`] serves the same backend over HTTP and exposes [`metrics`]
//! - [`server::RackServer`] wires it all together from a [`config::RackConfig`]

pub mod arch;
pub mod arp;
pub mod backend;
pub mod boot;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod http;
pub mod interfaces;
pub mod kernel_params;
pub mod metrics;
pub mod packet;
pub mod reader;
pub mod rpc;
pub mod server;
pub mod service;
pub mod session;
pub mod tftp;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backend::{RequestContext, TftpBackend};
pub use config::RackConfig;
pub use error::{BackendError, PxeError, Result, RpcError};
pub use server::RackServer;
