//! Event and suspension infrastructure.

pub mod wait;
