mod error;
mod reader;
mod value;
mod writer;

pub use error::WireError;
pub use reader::WireReader;
pub use value::{WireDecode, WireEncode, WireValue};
pub use writer::WireWriter;
