//! The narrow master contract the EtherCAT tasks run over, plus the
//! simulated master used by tests and cable-less bring-up.
//!
//! Real fieldbus masters (kernel or userspace stacks) live outside this
//! crate and implement [`Master`]; offsets into the consolidated process
//! image are theirs to compute during activation.

use std::collections::HashMap;

use parking_lot::Mutex;

use weir_core::errors::{self, Error};

use crate::esi::PdoEntry;
use crate::image::{read_pdo, write_pdo, PdoOffset};

/// A slave discovered on the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveInfo {
    /// Position on the bus, starting at zero.
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub name: String,
}

/// A PDO the task wants mapped into the process image.
#[derive(Debug, Clone)]
pub struct PdoMapping {
    pub slave: u16,
    pub entry: PdoEntry,
}

/// The cyclic-exchange contract.
pub trait Master: Send {
    /// Enumerates the slaves currently on the bus.
    fn scan(&mut self) -> errors::Result<Vec<SlaveInfo>>;

    /// Registers the requested PDOs and brings the bus into operation.
    /// Returns one process-image offset per mapping, in order.
    fn activate(&mut self, mappings: &[PdoMapping]) -> errors::Result<Vec<PdoOffset>>;

    /// Size of the consolidated process image after activation.
    fn image_size(&self) -> usize;

    /// One cyclic exchange: output regions of `image` are written to the
    /// bus, input regions are refreshed from it. Returns the working
    /// counter for the cycle.
    fn exchange(&mut self, image: &mut [u8]) -> errors::Result<u16>;

    /// The working counter value of a fully healthy cycle.
    fn expected_wkc(&self) -> u16;

    fn deactivate(&mut self) -> errors::Result<()>;
}

/// Opens masters by network interface name.
pub trait MasterProvider: Send + Sync {
    fn open(&self, interface: &str) -> errors::Result<Box<dyn Master>>;
}

/// In-process master: packs mappings into an image the way a real master
/// does (inputs first, bit-packed in mapping order) and lets tests script
/// input values and bus health.
pub struct SimulatedMaster {
    slaves: Vec<SlaveInfo>,
    inputs: Vec<(PdoMapping, PdoOffset)>,
    outputs: Vec<(PdoMapping, PdoOffset)>,
    image_size: usize,
    expected_wkc: u16,
    shared: std::sync::Arc<SimulatedBus>,
    active: bool,
}

/// Scripted bus state shared with the test body.
#[derive(Default)]
pub struct SimulatedBus {
    /// Input values keyed by `(slave, index, sub_index)`.
    pub input_values: Mutex<HashMap<(u16, u16, u8), f64>>,
    /// Output values observed on the bus, same key space.
    pub output_values: Mutex<HashMap<(u16, u16, u8), f64>>,
    /// When set, the next exchanges report a degraded working counter.
    pub degraded_cycles: Mutex<u32>,
}

impl SimulatedBus {
    pub fn set_input(&self, slave: u16, index: u16, sub_index: u8, value: f64) {
        self.input_values.lock().insert((slave, index, sub_index), value);
    }

    pub fn output(&self, slave: u16, index: u16, sub_index: u8) -> Option<f64> {
        self.output_values.lock().get(&(slave, index, sub_index)).copied()
    }

    pub fn degrade_for(&self, cycles: u32) {
        *self.degraded_cycles.lock() = cycles;
    }
}

impl SimulatedMaster {
    pub fn new(slaves: Vec<SlaveInfo>) -> (Self, std::sync::Arc<SimulatedBus>) {
        let shared = std::sync::Arc::new(SimulatedBus::default());
        (
            Self {
                slaves,
                inputs: Vec::new(),
                outputs: Vec::new(),
                image_size: 0,
                expected_wkc: 0,
                shared: shared.clone(),
                active: false,
            },
            shared,
        )
    }
}

impl Master for SimulatedMaster {
    fn scan(&mut self) -> errors::Result<Vec<SlaveInfo>> {
        Ok(self.slaves.clone())
    }

    fn activate(&mut self, mappings: &[PdoMapping]) -> errors::Result<Vec<PdoOffset>> {
        for mapping in mappings {
            if !self.slaves.iter().any(|s| s.position == mapping.slave) {
                return Err(Error::new(
                    errors::DEVICE_DISCONNECTED,
                    format!("no slave at position {}", mapping.slave),
                ));
            }
        }
        self.inputs.clear();
        self.outputs.clear();
        let mut cursor = PdoOffset::default();
        let mut offsets_by_order: Vec<(usize, PdoOffset)> = Vec::with_capacity(mappings.len());
        // Inputs first, then outputs, bit-packed in mapping order.
        for pass_inputs in [true, false] {
            // Output regions start byte-aligned.
            if !pass_inputs && cursor.bit != 0 {
                cursor = PdoOffset { byte: cursor.byte + 1, bit: 0 };
            }
            for (order, mapping) in mappings.iter().enumerate() {
                if mapping.entry.is_input != pass_inputs {
                    continue;
                }
                offsets_by_order.push((order, cursor));
                let slot = (mapping.clone(), cursor);
                if pass_inputs {
                    self.inputs.push(slot);
                } else {
                    self.outputs.push(slot);
                }
                cursor = cursor.advance(mapping.entry.bit_length);
            }
        }
        self.image_size = cursor.end_byte(0).max(1);
        self.expected_wkc = self.slaves.len() as u16 * 3;
        self.active = true;
        offsets_by_order.sort_by_key(|(order, _)| *order);
        Ok(offsets_by_order.into_iter().map(|(_, o)| o).collect())
    }

    fn image_size(&self) -> usize {
        self.image_size
    }

    fn exchange(&mut self, image: &mut [u8]) -> errors::Result<u16> {
        if !self.active {
            return Err(Error::new(errors::STREAM_NOT_INITIALIZED, "master is not active"));
        }
        {
            let mut degraded = self.shared.degraded_cycles.lock();
            if *degraded > 0 {
                *degraded -= 1;
                return Ok(self.expected_wkc.saturating_sub(1));
            }
        }
        // Outputs: image -> bus.
        {
            let mut observed = self.shared.output_values.lock();
            for (mapping, offset) in &self.outputs {
                let bits = read_pdo(image, *offset, mapping.entry.bit_length);
                let value = crate::coe::decode_value(
                    bits,
                    mapping.entry.data_type,
                    mapping.entry.bit_length,
                );
                observed.insert(
                    (mapping.slave, mapping.entry.index, mapping.entry.sub_index),
                    value,
                );
            }
        }
        // Inputs: bus -> image.
        {
            let scripted = self.shared.input_values.lock();
            for (mapping, offset) in &self.inputs {
                let value = scripted
                    .get(&(mapping.slave, mapping.entry.index, mapping.entry.sub_index))
                    .copied()
                    .unwrap_or(0.0);
                let bits = crate::coe::encode_value(
                    value,
                    mapping.entry.data_type,
                    mapping.entry.bit_length,
                );
                write_pdo(image, *offset, mapping.entry.bit_length, bits);
            }
        }
        Ok(self.expected_wkc)
    }

    fn expected_wkc(&self) -> u16 {
        self.expected_wkc
    }

    fn deactivate(&mut self) -> errors::Result<()> {
        self.active = false;
        Ok(())
    }
}

/// Provider handing out simulated masters with a fixed slave set.
pub struct SimulatedProvider {
    slaves: Vec<SlaveInfo>,
}

impl SimulatedProvider {
    pub fn new(slaves: Vec<SlaveInfo>) -> Self {
        Self { slaves }
    }
}

impl MasterProvider for SimulatedProvider {
    fn open(&self, _interface: &str) -> errors::Result<Box<dyn Master>> {
        let (master, _) = SimulatedMaster::new(self.slaves.clone());
        Ok(Box::new(master))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weir_core::series::DataType;

    fn slave(position: u16) -> SlaveInfo {
        SlaveInfo {
            position,
            vendor_id: 0x2,
            product_code: 0x100,
            revision: 1,
            name: format!("slave-{position}"),
        }
    }

    fn mapping(slave: u16, index: u16, bit_length: u8, is_input: bool) -> PdoMapping {
        PdoMapping {
            slave,
            entry: PdoEntry {
                pdo_index: 0x1A00,
                index,
                sub_index: 1,
                bit_length,
                is_input,
                name: format!("pdo-{index:#06x}"),
                data_type: if bit_length <= 8 { DataType::Uint8 } else { DataType::Int16 },
            },
        }
    }

    #[test]
    fn activation_packs_inputs_before_outputs() {
        let (mut master, _) = SimulatedMaster::new(vec![slave(0)]);
        let mappings = vec![
            mapping(0, 0x7000, 16, false),
            mapping(0, 0x6000, 1, true),
            mapping(0, 0x6010, 1, true),
        ];
        let offsets = master.activate(&mappings).unwrap();
        // Returned in request order: the output lands after both inputs.
        assert_eq!(offsets[1], PdoOffset { byte: 0, bit: 0 });
        assert_eq!(offsets[2], PdoOffset { byte: 0, bit: 1 });
        assert_eq!(offsets[0], PdoOffset { byte: 1, bit: 0 });
        assert_eq!(master.image_size(), 3);
    }

    #[test]
    fn exchange_moves_values_both_ways() {
        let (mut master, bus) = SimulatedMaster::new(vec![slave(0)]);
        let mappings = vec![mapping(0, 0x6000, 16, true), mapping(0, 0x7000, 16, false)];
        let offsets = master.activate(&mappings).unwrap();
        let mut image = vec![0u8; master.image_size()];

        bus.set_input(0, 0x6000, 1, -5.0);
        write_pdo(
            &mut image,
            offsets[1],
            16,
            crate::coe::encode_value(123.0, DataType::Int16, 16),
        );
        let wkc = master.exchange(&mut image).unwrap();
        assert_eq!(wkc, master.expected_wkc());

        let input_bits = read_pdo(&image, offsets[0], 16);
        assert_eq!(crate::coe::decode_value(input_bits, DataType::Int16, 16), -5.0);
        assert_eq!(bus.output(0, 0x7000, 1), Some(123.0));
    }

    #[test]
    fn degraded_bus_lowers_wkc() {
        let (mut master, bus) = SimulatedMaster::new(vec![slave(0), slave(1)]);
        master.activate(&[mapping(0, 0x6000, 8, true)]).unwrap();
        let mut image = vec![0u8; master.image_size()];
        bus.degrade_for(1);
        assert!(master.exchange(&mut image).unwrap() < master.expected_wkc());
        assert_eq!(master.exchange(&mut image).unwrap(), master.expected_wkc());
    }

    #[test]
    fn exchange_requires_activation() {
        let (mut master, _) = SimulatedMaster::new(vec![slave(0)]);
        let mut image = [0u8; 4];
        let err = master.exchange(&mut image).unwrap_err();
        assert!(err.matches(errors::TEMPORARY_HARDWARE_ERROR));
    }
}
