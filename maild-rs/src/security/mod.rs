pub mod tls;

pub use tls::{generate_self_signed_cert, TlsConfig};
