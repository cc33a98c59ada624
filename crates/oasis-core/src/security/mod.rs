//! Security module - permissions and validation

pub mod permission;
pub mod validator;

pub use permission::*;
pub use validator::*;
