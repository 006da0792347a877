pub mod document;
pub mod field;
pub mod result;
pub mod review;

pub use document::*;
pub use field::*;
pub use result::*;
pub use review::*;
