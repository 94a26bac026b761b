//! Hardware access: temperature sensors and BMC fan actuation.

pub mod ipmi;
pub mod sensors;
