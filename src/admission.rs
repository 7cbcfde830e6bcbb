//! Admission predicate for BackupPolicy resources
//!
//! Pure validation shared by the reconciler, the `check` command, and any
//! admission webhook fronting the API server.

use std::str::FromStr;

use crate::crd::BackupPolicy;
use crate::error::{Error, Result};
use crate::selector::{self, Selector};

/// Validate a policy, returning the compiled selector on success.
///
/// A policy is valid when its selector is non-empty and compiles and its
/// schedule parses as a standard cron expression or an `@` macro.
pub fn validate(policy: &BackupPolicy) -> Result<Selector> {
    let selector = selector::compile(&policy.spec.selector)?;
    if selector.selects_all() {
        return Err(Error::validation(
            "selector must not be empty; an empty selector would match every workload",
        ));
    }

    validate_schedule(&policy.spec.schedule)?;

    Ok(selector)
}

/// Check a cron schedule. Standard expressions have five fields; the cron
/// crate expects a leading seconds field, so one is supplied.
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    if schedule.is_empty() {
        return Err(Error::validation("schedule is required"));
    }

    let expr = if schedule.starts_with('@') {
        schedule.to_string()
    } else {
        let fields = schedule.split_whitespace().count();
        if fields != 5 {
            return Err(Error::validation(format!(
                "schedule '{}' must have 5 fields, found {}",
                schedule, fields
            )));
        }
        format!("0 {}", schedule)
    };

    cron::Schedule::from_str(&expr)
        .map(|_| ())
        .map_err(|e| Error::validation(format!("invalid schedule '{}': {}", schedule, e)))
}

/// Admission verdict as reported to callers
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(String),
}

/// Evaluate the predicate without exposing the compiled selector
pub fn admit(policy: &BackupPolicy) -> Verdict {
    match validate(policy) {
        Ok(_) => Verdict::Allowed,
        Err(e) => Verdict::Denied(e.to_string()),
    }
}
