//! Serial port enumeration

use anyhow::Context;
use serialport::{available_ports, SerialPortType};
use tracing::info;

/// A serial port the host could run on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortEntry {
    /// Port name (e.g., /dev/ttyACM0, COM3)
    pub port: String,
    /// USB product string, when the port is USB
    pub product: Option<String>,
}

impl PortEntry {
    fn from_serialport(port: String, port_type: &SerialPortType) -> Self {
        let product = match port_type {
            SerialPortType::UsbPort(usb) => usb.product.clone(),
            _ => None,
        };
        Self { port, product }
    }

    /// Label for listings: "ttyACM0 (Product)" or just the port name
    pub fn label(&self) -> String {
        match &self.product {
            Some(product) => format!("{} ({})", self.port, product),
            None => self.port.clone(),
        }
    }
}

/// Skip ports that are never a modem link
fn should_skip(entry: &PortEntry) -> bool {
    ["Bluetooth", "debug"]
        .iter()
        .any(|pattern| entry.port.contains(pattern))
}

/// Enumerate available serial ports
pub fn list_ports() -> anyhow::Result<Vec<PortEntry>> {
    let ports = available_ports().context("Failed to enumerate serial ports")?;
    let entries: Vec<_> = ports
        .into_iter()
        .map(|p| PortEntry::from_serialport(p.port_name, &p.port_type))
        .filter(|p| !should_skip(p))
        .collect();

    if entries.is_empty() {
        info!("No serial ports found");
    } else {
        info!("Found {} serial port(s)", entries.len());
    }
    Ok(entries)
}
