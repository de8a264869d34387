pub mod host;
pub mod manager;
pub mod radio;
pub mod table;

pub use manager::{LinkManager, LinkSettings};
