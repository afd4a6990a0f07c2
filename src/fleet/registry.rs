//! Device registry loaded from a comma-separated file.
//!
//! ```text
//! name,address,username,secret
//! sw1,10.0.0.1,admin,env:SW1_PASSWORD
//! sw2,[fe80::2]:2222,admin,key:/etc/switchyard/id_ed25519
//! ```
//!
//! The first row is a header. Fields may be wrapped in double quotes, with
//! `""` standing for a literal quote, and are trimmed. The secret column is a
//! reference (see `secrets`); it may itself contain commas.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

use super::error::RegistryError;
use super::types::DeviceRecord;

const COLUMNS: usize = 4;

/// Snapshot of the device list, in file order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Vec<DeviceRecord>,
    by_name: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Read and parse the registry at `path`.
    pub async fn load(path: &Path) -> Result<Self, RegistryError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        let registry = Self::parse(&text)?;
        debug!("Loaded {} device(s) from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn parse(text: &str) -> Result<Self, RegistryError> {
        let mut registry = Self::default();

        for (i, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let [name, address, username, secret]: [String; COLUMNS] = split_row(line)
                .try_into()
                .map_err(|columns: Vec<String>| RegistryError::MalformedRow {
                    line: i + 1,
                    columns: columns.len(),
                })?;

            registry.insert(DeviceRecord {
                name,
                address,
                username,
                secret,
            });
        }

        Ok(registry)
    }

    fn insert(&mut self, device: DeviceRecord) {
        match self.by_name.get(&device.name) {
            Some(&slot) => {
                warn!(
                    "Device '{}' listed more than once; using the last entry",
                    device.name
                );
                self.devices[slot] = device;
            }
            None => {
                self.by_name.insert(device.name.clone(), self.devices.len());
                self.devices.push(device);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.by_name.get(name).map(|&slot| &self.devices[slot])
    }

    pub fn names(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Split a row into at most [`COLUMNS`] trimmed fields.
///
/// The last field takes the rest of the line, unquoted commas included.
fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::with_capacity(COLUMNS);
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' if quoted => quoted = false,
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ',' if !quoted && fields.len() < COLUMNS - 1 => {
                fields.push(field.trim().to_string());
                field.clear();
            }
            _ => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}
