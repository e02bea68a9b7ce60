// weir-opcua: OPC UA servers as Weir tasks
//
// The vendor client stack stays outside this crate behind the `UaClient`
// contract. This crate owns what the driver actually needs from it: variant
// to series conversion with type coercion, the array and unary read task
// shapes, and endpoint scanning.

pub mod client;
pub mod factory;
pub mod read_task;
pub mod scan;
pub mod variant;

pub use client::{ConnectionConfig, MockUaServer, NodeId, UaClient, UaConnector, UaNode};
pub use factory::OpcuaFactory;
pub use variant::{Value, Variant};

pub const INTEGRATION_NAME: &str = "opcua";
