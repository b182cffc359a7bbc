//! Storage backends for dieah-recall

mod sqlite;
pub mod vector;

pub use sqlite::{SqliteStorage, UnitOfWork};
pub use vector::LanceDbIndex;
