// weir-ethercat: EtherCAT slaves as Weir tasks
//
// The vendor master stacks stay outside this crate behind the `Master`
// contract; everything else lives here: the ESI device registry (a bit-exact
// binary blob with binary-searched lookup), sub-byte process-image access,
// CoE type mapping, and the read/write/scan task implementations.

pub mod coe;
pub mod esi;
pub mod factory;
pub mod image;
pub mod master;
pub mod read_task;
pub mod write_task;

pub use esi::{PdoEntry, Registry, RegistryBuilder};
pub use factory::EthercatFactory;
pub use image::{read_pdo, write_pdo, PdoOffset};
pub use master::{Master, MasterProvider, PdoMapping, SimulatedMaster, SlaveInfo};

pub const INTEGRATION_NAME: &str = "ethercat";
