// weir-driver: the host-side driver for a Weir telemetry cluster
//
// Bridges field hardware to the cluster: each device is exposed as a set of
// tasks the cluster configures, commands, streams from, and pushes
// setpoints to. The member crates under rust/ carry the runtime; this
// package owns configuration, rack bootstrap, the built-in integrations,
// and the binary entry point.

pub mod config;
pub mod http;
pub mod integrations;
pub mod meminfo;
pub mod rack;
pub mod sequence;
