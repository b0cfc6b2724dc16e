pub mod credentials;
pub mod error;
pub mod history;
pub mod identity;
pub mod speech;

pub use error::Error;
pub use history::{HistoryEntry, Role};
