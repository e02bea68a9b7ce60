// weir-core: shared value model for the Weir driver
//
// Everything in this crate is transport-agnostic: errors that travel over the
// cluster wire, the telemetry sample model, and the two timing primitives
// (breaker, loop timer) every pipeline in the driver is built on.

pub mod breaker;
pub mod errors;
pub mod frame;
pub mod series;
pub mod telem;
pub mod timer;

pub use errors::Error;
pub use frame::{ChannelKey, Frame};
pub use series::{DataType, Series};
pub use telem::{Rate, TimeSpan, TimeStamp};
