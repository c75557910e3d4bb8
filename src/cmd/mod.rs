//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled              |
//! |------------|-------------------------------|
//! | `run`      | `Run`, `Resume`               |
//! | `status`   | `Status`, `History`, `Plans`  |
//! | `sandbox`  | `Sandbox`                     |

pub mod run;
pub mod sandbox;
pub mod status;

pub use run::{cmd_resume, cmd_run};
pub use sandbox::cmd_sandbox;
pub use status::{cmd_history, cmd_plans, cmd_status};
