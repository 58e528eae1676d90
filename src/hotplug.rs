use crate::errors::{Result, SpoolerError};
use rusb::{Context, Device, Hotplug, HotplugBuilder, UsbContext};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// How long one `handle_events` call may block before the thread checks
/// whether anyone is still listening.
const EVENT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HotplugKind {
    Arrived,
    Left,
}

/// A USB device was plugged in or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HotplugEvent {
    pub kind: HotplugKind,
    pub vendor_id: u16,
    pub product_id: u16,
}

impl fmt::Display for HotplugEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HotplugKind::Arrived => "arrived",
            HotplugKind::Left => "left",
        };
        write!(f, "USB device {:04x}:{:04x} {}", self.vendor_id, self.product_id, kind)
    }
}

struct Forwarder {
    tx: UnboundedSender<HotplugEvent>,
}

impl Forwarder {
    fn forward<T: UsbContext>(&self, kind: HotplugKind, device: &Device<T>) {
        let (vendor_id, product_id) = match device.device_descriptor() {
            Ok(descriptor) => (descriptor.vendor_id(), descriptor.product_id()),
            Err(e) => {
                debug!("No descriptor for bus {} address {}: {}", device.bus_number(), device.address(), e);
                (0, 0)
            }
        };

        let event = HotplugEvent { kind, vendor_id, product_id };
        debug!("{}", event);
        // Receiver gone means the daemon is shutting down
        let _ = self.tx.send(event);
    }
}

impl<T: UsbContext> Hotplug<T> for Forwarder {
    fn device_arrived(&mut self, device: Device<T>) {
        self.forward(HotplugKind::Arrived, &device);
    }

    fn device_left(&mut self, device: Device<T>) {
        self.forward(HotplugKind::Left, &device);
    }
}

/// Watch for USB plug/unplug on a dedicated thread.
///
/// Fails when libusb has no hot-plug support on this platform; callers are
/// expected to carry on without it. The thread exits once the receiver is
/// dropped.
pub fn spawn_watcher() -> Result<UnboundedReceiver<HotplugEvent>> {
    if !rusb::has_hotplug() {
        return Err(SpoolerError::Config(
            "libusb hot-plug is not supported on this platform".to_string(),
        ));
    }

    let context = Context::new()?;
    let (tx, rx) = mpsc::unbounded_channel();

    let callback: Box<dyn Hotplug<Context>> = Box::new(Forwarder { tx: tx.clone() });
    let registration = HotplugBuilder::new()
        .enumerate(false)
        .register(context.clone(), callback)?;

    std::thread::Builder::new()
        .name("usb-hotplug".to_string())
        .spawn(move || {
            // Dropping the registration deregisters the callback
            let _registration = registration;

            while !tx.is_closed() {
                if let Err(e) = context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
                    error!("USB event loop failed: {}", e);
                    break;
                }
            }

            warn!("USB hot-plug watcher stopped");
        })?;

    info!("USB hot-plug watcher started");
    Ok(rx)
}
