pub mod resource;
pub mod xid;

pub use resource::{Vote, XaDataSource, XaResource};
pub use xid::Xid;
