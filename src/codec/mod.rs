//! Declarative message codec: tagged runtime values, the schema-driven
//! decoder, and the symmetric encoder used by the replayer.

mod decoder;
mod encoder;
mod value;

pub use decoder::{Decoder, Message};
pub use encoder::Encoder;
pub use value::{FieldMap, Value};
