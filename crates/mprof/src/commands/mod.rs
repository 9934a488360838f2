pub mod import;
pub mod list;
pub mod query;
pub mod top;
