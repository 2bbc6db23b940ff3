//! CLI command handlers.

mod object;
mod transfer;

pub use object::{run_delete_command, run_head_command};
pub use transfer::{run_get_command, run_migrate_command, run_put_command};
