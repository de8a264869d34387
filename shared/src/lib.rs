pub mod codec;
pub mod protocol;
pub mod quantity;
pub mod types;
