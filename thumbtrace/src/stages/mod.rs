//! The six pipeline stages, one module each (the Vector Table Reader lives in the `image`
//! crate since it only depends on the raw image, not on anything this crate produces).

pub mod code_base;
pub mod cross_reference;
pub mod data_code_separator;
pub mod disassemble;
pub mod vector_table_sizer;

mod util;
