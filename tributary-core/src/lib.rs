pub mod condition;
pub mod crd;
pub mod error;

pub use error::AppError;

/// Comma-separated list of canonical label selectors which match the
/// Tributary Operator's labelling scheme.
pub const TRIBUTARY_OPERATOR_LABEL_SELECTORS: &str = "app=tributary,tributary.rs/controlled-by=tributary-operator";
