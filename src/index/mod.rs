pub mod strategy;
pub mod key_index;
pub mod data_source;
