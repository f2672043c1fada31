// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod downloads;
pub mod recovery;
pub mod resolve;
pub mod utils;

pub use utils::*;
