//! Shared utilities: subprocess execution and validation helpers.

pub mod command;
pub mod validation;

pub use command::{CommandRunner, SystemRunner};
pub use validation::{find_role_overlap, validate_sdn_id, validate_tenant_count};
