//! The concrete SSH stack behind the `Transport`/`Signer` traits, built on
//! `russh`/`russh-keys`. This is the implementation the public facade wires
//! up by default; a caller with a different SSH stack implements
//! `crate::transport::{Transport, Signer}` directly instead of using this
//! module.

mod russh_signer;
mod russh_transport;

pub use russh_signer::RusshSigner;
pub use russh_transport::RusshTransport;
