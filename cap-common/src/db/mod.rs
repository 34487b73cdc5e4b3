//! Database schema, migrations, row models and lock retry

pub mod init;
pub mod migrations;
pub mod models;
pub mod retry;

pub use init::*;
pub use migrations::*;
pub use models::*;
pub use retry::{is_lock_error, retry_on_lock};
