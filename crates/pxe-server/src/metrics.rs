//! Transfer latency metrics

use crate::error::Result;
use prometheus::{Encoder, HistogramOpts, HistogramVec, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

/// Histogram of transfer durations, labelled by cleaned file name.
pub const TRANSFER_LATENCY: &str = "maas_tftp_file_transfer_latency";

/// Owns the registry the TFTP fleet records into.
#[derive(Debug, Clone)]
pub struct TftpMetrics {
    registry: Registry,
    transfer_latency: HistogramVec,
}

impl TftpMetrics {
    /// Fresh registry with the transfer histogram registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let transfer_latency = HistogramVec::new(
            HistogramOpts::new(TRANSFER_LATENCY, "Time required to transfer a file over TFTP")
                .buckets(prometheus::exponential_buckets(0.005, 2.0, 14)?),
            &["filename"],
        )?;
        registry.register(Box::new(transfer_latency.clone()))?;
        Ok(Self {
            registry,
            transfer_latency,
        })
    }

    /// Registry to gather or serve from.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a finished transfer of `filename`.
    pub fn observe_transfer(&self, filename: &str, seconds: f64) {
        self.transfer_latency
            .with_label_values(&[clean_filename(filename).as_str()])
            .observe(seconds);
    }

    /// Starts timing a transfer; the time is recorded when the returned guard is dropped.
    pub fn start_transfer(self: &Arc<Self>, filename: &str) -> TransferTimer {
        TransferTimer {
            metrics: Arc::clone(self),
            filename: filename.to_string(),
            started: Instant::now(),
        }
    }

    /// Text exposition of every metric in the registry.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Records the elapsed time of a transfer when dropped, whether it finished or was cut short.
#[derive(Debug)]
pub struct TransferTimer {
    metrics: Arc<TftpMetrics>,
    filename: String,
    started: Instant,
}

impl Drop for TransferTimer {
    fn drop(&mut self) {
        self.metrics
            .observe_transfer(&self.filename, self.started.elapsed().as_secs_f64());
    }
}

/// Metric label for a requested file.
///
/// Per-machine config paths collapse to one label each so the label set stays bounded.
pub fn clean_filename(filename: &str) -> String {
    let filename = filename.replace('\\', "/");
    let filename = filename.trim_start_matches('/');
    if filename.contains("pxelinux.cfg/") {
        "pxelinux.cfg".to_string()
    } else if filename.starts_with("grub/grub.cfg-") {
        "grub/grub.cfg".to_string()
    } else {
        filename.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("/pxelinux.cfg/01-aa-bb-cc-dd-ee-ff"), "pxelinux.cfg");
        assert_eq!(clean_filename("pxelinux.cfg/default.amd64"), "pxelinux.cfg");
        assert_eq!(clean_filename("grub/grub.cfg-aa:bb:cc:dd:ee:ff"), "grub/grub.cfg");
        assert_eq!(clean_filename("\\grub\\grub.cfg"), "grub/grub.cfg");
        assert_eq!(clean_filename("/bootx64.efi"), "bootx64.efi");
    }

    #[test]
    fn test_timer_records_on_drop() {
        let metrics = Arc::new(TftpMetrics::new().unwrap());
        {
            let _timer = metrics.start_transfer("pxelinux.cfg/default");
        }
        metrics.observe_transfer("/lpxelinux.0", 0.25);

        let text = metrics.encode().unwrap();
        assert!(text.contains(&format!("{TRANSFER_LATENCY}_count{{filename=\"pxelinux.cfg\"}} 1")));
        assert!(text.contains(&format!("{TRANSFER_LATENCY}_count{{filename=\"lpxelinux.0\"}} 1")));
    }
}
