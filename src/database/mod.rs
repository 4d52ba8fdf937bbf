// Database module
// SQLite for the correction log and learned patterns, LanceDB for vectors

pub mod lancedb;
pub mod sqlite;

pub use self::lancedb::LanceBackend;
pub use self::sqlite::Database;
