//! Supervision of the external PostgreSQL server process.
//!
//! [`ProcessSupervisor`] wraps `pg_ctl`: it launches the server, captures
//! and decodes its mixed-encoding output, polls until the server answers
//! queries, and shuts it down again.

pub mod decode;
pub mod readiness;
pub mod supervisor;

pub use decode::OutputDecoder;
pub use readiness::{ReadinessPoller, ReadinessState};
pub use supervisor::{OutputStream, ProcessSupervisor};
