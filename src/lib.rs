//! carbridge: publishes an observable vehicle model to an MQTT broker and
//! applies writes coming back from it.

pub mod bridge;
pub mod config;
pub mod model;
pub mod mqtt;
