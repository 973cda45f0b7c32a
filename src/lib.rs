//! fleet-steward: keeps a fixed-size worker fleet running behind a gateway
//! and proxy on an OpenStack cloud.
//!
//! Each cycle observes the fleet through the provider and an independent
//! health oracle, decides what to create or destroy, carries that out, and
//! pushes the resulting topology to the edge.

pub mod config;
pub mod edge;
pub mod fleet;
pub mod oracle;
pub mod poll;
pub mod provider;
pub mod relay;

#[cfg(test)]
mod testing;
