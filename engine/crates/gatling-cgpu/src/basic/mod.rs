pub mod desc;
pub mod flags;
pub mod format;
pub mod limits;
