//! Query rewriting for policy enforcement.
//!
//! - **guard**: guard evaluation and injection into query arguments
//! - **reversed**: filters reconstructed from nesting paths
//! - **read**: guarded lookups and read post-processing

pub mod guard;
pub mod read;
pub mod reversed;

pub use guard::PolicyUtil;
pub use read::{check_existence, check_policy_for_unique, post_process, read_back};
pub use reversed::{build_reversed_query, with_last_filter};
