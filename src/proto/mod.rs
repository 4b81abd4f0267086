//! Wire formats: control headers and acks, frame descriptors.

pub mod command;
pub mod frame;
