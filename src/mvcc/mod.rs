pub mod fulltext;
pub mod overlay;
