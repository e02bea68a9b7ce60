//! The ESI device registry: PDO layouts for known EtherCAT devices.
//!
//! The registry is a little-endian binary blob: a header, a vendor table, a
//! device index sorted by `(vendor_id, product_code)` for binary search, a
//! device table, a PDO table, and a NUL-terminated string table. The
//! builder here produces the same layout the lookup path consumes, which
//! keeps the format round-trip tested and lets the built-in device table be
//! encoded at startup instead of shipping an opaque asset.

use std::sync::OnceLock;

use thiserror::Error as ThisError;

use weir_core::series::DataType;

pub const REGISTRY_MAGIC: u32 = u32::from_le_bytes(*b"WESI");
pub const REGISTRY_VERSION: u32 = 1;

const HEADER_SIZE: usize = 32;
const VENDOR_SIZE: usize = 8;
const DEVICE_INDEX_SIZE: usize = 16;
const DEVICE_SIZE: usize = 16;
const PDO_SIZE: usize = 12;

/// Registry decode failures.
#[derive(Debug, ThisError)]
pub enum RegistryError {
    #[error("registry blob too short: {0} bytes")]
    Truncated(usize),
    #[error("bad registry magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported registry version {0}")]
    BadVersion(u32),
    #[error("registry tables exceed blob bounds")]
    OutOfBounds,
}

/// One process-data object of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct PdoEntry {
    /// Index of the PDO assignment object this entry belongs to.
    pub pdo_index: u16,
    /// Object dictionary index.
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
    pub is_input: bool,
    pub name: String,
    pub data_type: DataType,
}

/// A resolved device: its name plus input and output PDOs, inputs first.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub name: String,
    pub inputs: Vec<PdoEntry>,
    pub outputs: Vec<PdoEntry>,
}

struct Header {
    vendor_count: u32,
    device_index_count: u32,
    device_count: u32,
    pdo_count: u32,
    string_table_offset: u32,
    string_table_size: u32,
}

/// A decoded, immutable registry.
pub struct Registry {
    blob: Vec<u8>,
    header: Header,
}

fn read_u32(blob: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([blob[at], blob[at + 1], blob[at + 2], blob[at + 3]])
}

fn read_u16(blob: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([blob[at], blob[at + 1]])
}

fn data_type_id(dt: DataType) -> u8 {
    match dt {
        DataType::Uint8 => 1,
        DataType::Int8 => 2,
        DataType::Int16 => 3,
        DataType::Uint16 => 4,
        DataType::Int32 => 5,
        DataType::Uint32 => 6,
        DataType::Int64 => 7,
        DataType::Uint64 => 8,
        DataType::Float32 => 9,
        DataType::Float64 => 10,
        _ => 1,
    }
}

fn id_to_data_type(id: u8) -> DataType {
    match id {
        1 => DataType::Uint8,
        2 => DataType::Int8,
        3 => DataType::Int16,
        4 => DataType::Uint16,
        5 => DataType::Int32,
        6 => DataType::Uint32,
        7 => DataType::Int64,
        8 => DataType::Uint64,
        9 => DataType::Float32,
        10 => DataType::Float64,
        _ => DataType::Uint8,
    }
}

impl Registry {
    /// Decodes and bounds-checks a registry blob.
    pub fn from_blob(blob: Vec<u8>) -> Result<Self, RegistryError> {
        if blob.len() < HEADER_SIZE {
            return Err(RegistryError::Truncated(blob.len()));
        }
        let magic = read_u32(&blob, 0);
        if magic != REGISTRY_MAGIC {
            return Err(RegistryError::BadMagic(magic));
        }
        let version = read_u32(&blob, 4);
        if version != REGISTRY_VERSION {
            return Err(RegistryError::BadVersion(version));
        }
        let header = Header {
            vendor_count: read_u32(&blob, 8),
            device_index_count: read_u32(&blob, 12),
            device_count: read_u32(&blob, 16),
            pdo_count: read_u32(&blob, 20),
            string_table_offset: read_u32(&blob, 24),
            string_table_size: read_u32(&blob, 28),
        };
        let tables_end = HEADER_SIZE
            + header.vendor_count as usize * VENDOR_SIZE
            + header.device_index_count as usize * DEVICE_INDEX_SIZE
            + header.device_count as usize * DEVICE_SIZE
            + header.pdo_count as usize * PDO_SIZE;
        let strings_end = header.string_table_offset as usize + header.string_table_size as usize;
        if tables_end > blob.len()
            || header.string_table_offset as usize != tables_end
            || strings_end > blob.len()
        {
            return Err(RegistryError::OutOfBounds);
        }
        Ok(Self { blob, header })
    }

    /// The built-in registry of commonly deployed devices.
    pub fn builtin() -> &'static Registry {
        static BUILTIN: OnceLock<Registry> = OnceLock::new();
        BUILTIN.get_or_init(|| {
            Registry::from_blob(builtin_blob())
                .unwrap_or_else(|e| unreachable!("builtin registry is well-formed: {e}"))
        })
    }

    fn vendors_at(&self) -> usize {
        HEADER_SIZE
    }

    fn device_index_at(&self) -> usize {
        self.vendors_at() + self.header.vendor_count as usize * VENDOR_SIZE
    }

    fn devices_at(&self) -> usize {
        self.device_index_at() + self.header.device_index_count as usize * DEVICE_INDEX_SIZE
    }

    fn pdos_at(&self) -> usize {
        self.devices_at() + self.header.device_count as usize * DEVICE_SIZE
    }

    fn string_at(&self, offset: u32) -> String {
        let start = self.header.string_table_offset as usize + offset as usize;
        let end = self.blob[start..]
            .iter()
            .position(|b| *b == 0)
            .map(|p| start + p)
            .unwrap_or(self.blob.len());
        String::from_utf8_lossy(&self.blob[start..end]).into_owned()
    }

    /// Binary search of the device index for `(vendor_id, product_code)`.
    fn find_index_entry(&self, vendor_id: u32, product_code: u32) -> Option<usize> {
        let base = self.device_index_at();
        let count = self.header.device_index_count as usize;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let at = base + mid * DEVICE_INDEX_SIZE;
            let entry = (read_u32(&self.blob, at), read_u32(&self.blob, at + 4));
            if entry < (vendor_id, product_code) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == count {
            return None;
        }
        let at = base + lo * DEVICE_INDEX_SIZE;
        if read_u32(&self.blob, at) == vendor_id && read_u32(&self.blob, at + 4) == product_code {
            Some(at)
        } else {
            None
        }
    }

    pub fn is_device_known(&self, vendor_id: u32, product_code: u32) -> bool {
        self.find_index_entry(vendor_id, product_code).is_some()
    }

    /// The vendor's registered name.
    pub fn vendor_name(&self, vendor_id: u32) -> Option<String> {
        let base = self.vendors_at();
        let count = self.header.vendor_count as usize;
        let mut lo = 0usize;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let at = base + mid * VENDOR_SIZE;
            if read_u32(&self.blob, at) < vendor_id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo == count {
            return None;
        }
        let at = base + lo * VENDOR_SIZE;
        if read_u32(&self.blob, at) != vendor_id {
            return None;
        }
        Some(self.string_at(read_u32(&self.blob, at + 4)))
    }

    /// Looks up a device's PDO layout. An exact revision match is
    /// preferred; otherwise the first registered revision of the
    /// `(vendor, product)` pair is used.
    pub fn lookup_device_pdos(
        &self,
        vendor_id: u32,
        product_code: u32,
        revision: u32,
    ) -> Option<DeviceEntry> {
        let idx_at = self.find_index_entry(vendor_id, product_code)?;
        let first_device = read_u32(&self.blob, idx_at + 8) as usize;
        let device_count = read_u32(&self.blob, idx_at + 12) as usize;

        let devices = self.devices_at();
        let mut chosen = None;
        for i in 0..device_count {
            let at = devices + (first_device + i) * DEVICE_SIZE;
            if read_u32(&self.blob, at) == revision {
                chosen = Some(at);
                break;
            }
            if chosen.is_none() {
                chosen = Some(at);
            }
        }
        let dev_at = chosen?;

        let name = self.string_at(read_u32(&self.blob, dev_at + 4));
        let pdo_offset = read_u32(&self.blob, dev_at + 8) as usize;
        let input_count = read_u16(&self.blob, dev_at + 12) as usize;
        let output_count = read_u16(&self.blob, dev_at + 14) as usize;

        let pdos = self.pdos_at();
        let read_entry = |slot: usize, is_input: bool| {
            let at = pdos + slot * PDO_SIZE;
            PdoEntry {
                pdo_index: read_u16(&self.blob, at),
                index: read_u16(&self.blob, at + 2),
                sub_index: self.blob[at + 4],
                bit_length: self.blob[at + 5],
                data_type: id_to_data_type(self.blob[at + 6]),
                is_input,
                name: self.string_at(read_u32(&self.blob, at + 8)),
            }
        };
        // Inputs precede outputs in the PDO table.
        let inputs = (0..input_count)
            .map(|i| read_entry(pdo_offset + i, true))
            .collect();
        let outputs = (0..output_count)
            .map(|i| read_entry(pdo_offset + input_count + i, false))
            .collect();
        Some(DeviceEntry { name, inputs, outputs })
    }
}

/// Builder producing the registry blob layout.
#[derive(Default)]
pub struct RegistryBuilder {
    vendors: Vec<(u32, String)>,
    devices: Vec<BuilderDevice>,
}

struct BuilderDevice {
    vendor_id: u32,
    product_code: u32,
    revision: u32,
    name: String,
    inputs: Vec<PdoEntry>,
    outputs: Vec<PdoEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vendor(mut self, vendor_id: u32, name: &str) -> Self {
        self.vendors.push((vendor_id, name.to_string()));
        self
    }

    #[allow(clippy::too_many_arguments)]
    pub fn device(
        mut self,
        vendor_id: u32,
        product_code: u32,
        revision: u32,
        name: &str,
        inputs: Vec<PdoEntry>,
        outputs: Vec<PdoEntry>,
    ) -> Self {
        self.devices.push(BuilderDevice {
            vendor_id,
            product_code,
            revision,
            name: name.to_string(),
            inputs,
            outputs,
        });
        self
    }

    pub fn encode(mut self) -> Vec<u8> {
        let mut strings: Vec<u8> = Vec::new();
        let mut intern = |s: &str, strings: &mut Vec<u8>| -> u32 {
            let offset = strings.len() as u32;
            strings.extend_from_slice(s.as_bytes());
            strings.push(0);
            offset
        };

        self.vendors.sort_by_key(|(id, _)| *id);
        self.vendors.dedup_by_key(|(id, _)| *id);
        self.devices
            .sort_by_key(|d| (d.vendor_id, d.product_code, d.revision));

        // Group devices into index entries per (vendor, product).
        let mut index_entries: Vec<(u32, u32, u32, u32)> = Vec::new();
        for (pos, dev) in self.devices.iter().enumerate() {
            match index_entries.last_mut() {
                Some(entry) if entry.0 == dev.vendor_id && entry.1 == dev.product_code => {
                    entry.3 += 1;
                }
                _ => index_entries.push((dev.vendor_id, dev.product_code, pos as u32, 1)),
            }
        }

        let pdo_count: usize = self
            .devices
            .iter()
            .map(|d| d.inputs.len() + d.outputs.len())
            .sum();
        let string_table_offset = HEADER_SIZE
            + self.vendors.len() * VENDOR_SIZE
            + index_entries.len() * DEVICE_INDEX_SIZE
            + self.devices.len() * DEVICE_SIZE
            + pdo_count * PDO_SIZE;

        let mut vendor_bytes = Vec::with_capacity(self.vendors.len() * VENDOR_SIZE);
        for (id, name) in &self.vendors {
            vendor_bytes.extend_from_slice(&id.to_le_bytes());
            vendor_bytes.extend_from_slice(&intern(name, &mut strings).to_le_bytes());
        }

        let mut index_bytes = Vec::with_capacity(index_entries.len() * DEVICE_INDEX_SIZE);
        for (vendor, product, first, count) in &index_entries {
            index_bytes.extend_from_slice(&vendor.to_le_bytes());
            index_bytes.extend_from_slice(&product.to_le_bytes());
            index_bytes.extend_from_slice(&first.to_le_bytes());
            index_bytes.extend_from_slice(&count.to_le_bytes());
        }

        let mut device_bytes = Vec::with_capacity(self.devices.len() * DEVICE_SIZE);
        let mut pdo_bytes = Vec::with_capacity(pdo_count * PDO_SIZE);
        let mut pdo_slot = 0u32;
        for dev in &self.devices {
            device_bytes.extend_from_slice(&dev.revision.to_le_bytes());
            device_bytes.extend_from_slice(&intern(&dev.name, &mut strings).to_le_bytes());
            device_bytes.extend_from_slice(&pdo_slot.to_le_bytes());
            device_bytes.extend_from_slice(&(dev.inputs.len() as u16).to_le_bytes());
            device_bytes.extend_from_slice(&(dev.outputs.len() as u16).to_le_bytes());
            for entry in dev.inputs.iter().chain(dev.outputs.iter()) {
                pdo_bytes.extend_from_slice(&entry.pdo_index.to_le_bytes());
                pdo_bytes.extend_from_slice(&entry.index.to_le_bytes());
                pdo_bytes.push(entry.sub_index);
                pdo_bytes.push(entry.bit_length);
                pdo_bytes.push(data_type_id(entry.data_type));
                pdo_bytes.push(0);
                pdo_bytes.extend_from_slice(&intern(&entry.name, &mut strings).to_le_bytes());
                pdo_slot += 1;
            }
        }

        let mut blob = Vec::with_capacity(string_table_offset + strings.len());
        blob.extend_from_slice(&REGISTRY_MAGIC.to_le_bytes());
        blob.extend_from_slice(&REGISTRY_VERSION.to_le_bytes());
        blob.extend_from_slice(&(self.vendors.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(index_entries.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(self.devices.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(pdo_count as u32).to_le_bytes());
        blob.extend_from_slice(&(string_table_offset as u32).to_le_bytes());
        blob.extend_from_slice(&(strings.len() as u32).to_le_bytes());
        blob.extend_from_slice(&vendor_bytes);
        blob.extend_from_slice(&index_bytes);
        blob.extend_from_slice(&device_bytes);
        blob.extend_from_slice(&pdo_bytes);
        blob.extend_from_slice(&strings);
        blob
    }
}

/// One analog-style PDO entry for the builder tables below.
fn pdo(
    pdo_index: u16,
    index: u16,
    sub_index: u8,
    bit_length: u8,
    is_input: bool,
    name: &str,
    data_type: DataType,
) -> PdoEntry {
    PdoEntry {
        pdo_index,
        index,
        sub_index,
        bit_length,
        is_input,
        name: name.to_string(),
        data_type,
    }
}

/// A starter set of common terminal blocks. Deployments extend the registry
/// by pointing the driver at a full blob.
fn builtin_blob() -> Vec<u8> {
    RegistryBuilder::new()
        .vendor(0x2, "Beckhoff Automation")
        .device(
            0x2,
            0x03F43052,
            0x00100000,
            "EL1012 2Ch. Dig. Input 24V",
            vec![
                pdo(0x1A00, 0x6000, 1, 1, true, "Input 1", DataType::Uint8),
                pdo(0x1A01, 0x6010, 1, 1, true, "Input 2", DataType::Uint8),
            ],
            vec![],
        )
        .device(
            0x2,
            0x07D23052,
            0x00100000,
            "EL2004 4Ch. Dig. Output 24V",
            vec![],
            vec![
                pdo(0x1600, 0x7000, 1, 1, false, "Output 1", DataType::Uint8),
                pdo(0x1601, 0x7010, 1, 1, false, "Output 2", DataType::Uint8),
                pdo(0x1602, 0x7020, 1, 1, false, "Output 3", DataType::Uint8),
                pdo(0x1603, 0x7030, 1, 1, false, "Output 4", DataType::Uint8),
            ],
        )
        .device(
            0x2,
            0x0C1E3052,
            0x00120000,
            "EL3102 2Ch. Ana. Input +/-10V",
            vec![
                pdo(0x1A00, 0x6000, 17, 16, true, "AI Value 1", DataType::Int16),
                pdo(0x1A01, 0x6010, 17, 16, true, "AI Value 2", DataType::Int16),
            ],
            vec![],
        )
        .device(
            0x2,
            0x0FA33052,
            0x00140000,
            "EL4002 2Ch. Ana. Output 0-10V",
            vec![],
            vec![
                pdo(0x1600, 0x7000, 17, 16, false, "AO Value 1", DataType::Int16),
                pdo(0x1601, 0x7010, 17, 16, false, "AO Value 2", DataType::Int16),
            ],
        )
        .encode()
}
