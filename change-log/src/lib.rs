pub mod change;
pub mod dialect;
pub mod store;

pub use change::{Change, EventType, NewChange, TableDef, TableRef};
pub use dialect::DialectCapabilities;
pub use store::{ChangeLogStore, IdFilter, LogQuery};
