#![allow(clippy::uninlined_format_args)]

pub mod capture;
pub mod codec;
pub mod format;
pub mod reassembly;
pub mod replay;
pub mod schema;
pub mod transform;
