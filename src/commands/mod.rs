//! One-shot commands
//!
//! Besides running as an operator, the binary is invoked by the scheduled
//! scale-down job and by the injected backup component. Each command
//! returns a report for the caller to log.

pub mod check;
pub mod scale;
