//! GitHub App authentication.
//!
//! - [`assertion`]: the app identity and the signed assertions it mints.
//! - [`installation`]: installation token exchange, validation and renewal.

pub mod assertion;
pub mod installation;

pub use assertion::AppIdentity;
pub use installation::{InstallationToken, TokenManager};
