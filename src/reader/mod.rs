pub mod searcher_ref;
pub mod hits;
