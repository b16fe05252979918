pub mod email;

pub use email::{extract_address, is_valid_address, validate_email};
