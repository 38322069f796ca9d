//! I/O subsystem: device tree, Request Packets and enumeration.

pub mod dev;
pub mod enumeration;
pub mod fs;
pub mod res;
pub mod rp;
