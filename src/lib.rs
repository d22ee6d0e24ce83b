//! Adaptive LoRaWAN link agent for the Microchip RN2483.
//!
//! Drives the module over its serial line protocol, listens for per-uplink
//! link-quality reports from the network server over MQTT, and picks the
//! next datarate and transmit power from a pre-computed decision table.

pub mod config;
pub mod control;
pub mod decision;
pub mod device;
pub mod engine;
pub mod error;
pub mod mqtt;
pub mod parser;
pub mod persistence;
pub mod protocol;
pub mod telemetry;
pub mod transport;
