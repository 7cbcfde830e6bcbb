//! Label selectors
//!
//! Matching and rendering come from [`kube::core::Selector`]. This module
//! adds the syntax checks the API server applies to label keys and values,
//! which kube's conversion from `LabelSelector` does not perform, and the
//! parser for the string form taken by `scaledown --selector`.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use regex::Regex;

pub use kube::core::{Expression, Selector, SelectorExt};

use crate::error::{Error, Result};

lazy_static::lazy_static! {
    static ref LABEL_NAME: Regex =
        Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]{0,61}[A-Za-z0-9])?$").unwrap();
    static ref LABEL_PREFIX: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap();
}

/// Compile a structured selector as stored on a policy or workload spec
pub fn compile(selector: &LabelSelector) -> Result<Selector> {
    for (key, value) in selector.match_labels.iter().flatten() {
        validate_key(key)?;
        validate_value(value)?;
    }

    for requirement in selector.match_expressions.iter().flatten() {
        let values = requirement.values.as_deref().unwrap_or_default();
        validate_key(&requirement.key)?;
        match requirement.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(Error::selector(format!(
                    "'{}' requires at least one value for key '{}'",
                    requirement.operator, requirement.key
                )));
            }
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                return Err(Error::selector(format!(
                    "'{}' takes no values for key '{}'",
                    requirement.operator, requirement.key
                )));
            }
            "In" | "NotIn" | "Exists" | "DoesNotExist" => {}
            other => {
                return Err(Error::selector(format!(
                    "unsupported operator '{}' for key '{}'",
                    other, requirement.key
                )));
            }
        }
        for value in values {
            validate_value(value)?;
        }
    }

    Selector::try_from(selector.clone()).map_err(|e| Error::selector(e.to_string()))
}

/// Match against optional labels as found on object metadata
pub fn matches(selector: &Selector, labels: Option<&BTreeMap<String, String>>) -> bool {
    match labels {
        Some(labels) => selector.matches(labels),
        None => selector.matches(&BTreeMap::new()),
    }
}

/// Parse the API server's string form, e.g. `app=demo,tier in (web,api),!legacy`.
///
/// Accepts everything [`Selector`]'s `Display` produces.
pub fn parse(input: &str) -> Result<Selector> {
    let mut expressions = Vec::new();
    for clause in split_clauses(input)? {
        expressions.push(parse_clause(&clause)?);
    }
    Ok(expressions.into_iter().collect())
}

fn split_clauses(input: &str) -> Result<Vec<String>> {
    let mut clauses = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in input.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                if depth == 0 {
                    return Err(Error::selector(format!("unbalanced ')' in '{}'", input)));
                }
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                clauses.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(Error::selector(format!("unbalanced '(' in '{}'", input)));
    }
    clauses.push(current);

    let clauses: Vec<String> = clauses
        .into_iter()
        .map(|c| c.trim().to_string())
        .collect();
    if clauses.len() == 1 && clauses[0].is_empty() {
        return Ok(Vec::new());
    }
    if clauses.iter().any(|c| c.is_empty()) {
        return Err(Error::selector(format!("empty clause in '{}'", input)));
    }
    Ok(clauses)
}

fn parse_clause(clause: &str) -> Result<Expression> {
    if let Some(key) = clause.strip_prefix('!') {
        let key = checked_key(key)?;
        return Ok(Expression::DoesNotExist(key));
    }
    if let Some((key, value)) = clause.split_once("!=") {
        return Ok(Expression::NotEqual(checked_key(key)?, checked_value(value)?));
    }
    if let Some((key, value)) = clause
        .split_once("==")
        .or_else(|| clause.split_once('='))
    {
        return Ok(Expression::Equal(checked_key(key)?, checked_value(value)?));
    }
    if let Some(open) = clause.find('(') {
        let head: Vec<&str> = clause[..open].split_whitespace().collect();
        let close = clause
            .rfind(')')
            .filter(|close| *close == clause.len() - 1)
            .ok_or_else(|| Error::selector(format!("malformed set clause '{}'", clause)))?;
        let values = clause[open + 1..close]
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(checked_value)
            .collect::<Result<BTreeSet<String>>>()?;
        if values.is_empty() {
            return Err(Error::selector(format!(
                "set clause '{}' needs at least one value",
                clause
            )));
        }
        return match head.as_slice() {
            [key, "in"] => Ok(Expression::In(checked_key(key)?, values)),
            [key, "notin"] => Ok(Expression::NotIn(checked_key(key)?, values)),
            _ => Err(Error::selector(format!("malformed set clause '{}'", clause))),
        };
    }
    Ok(Expression::Exists(checked_key(clause)?))
}

fn checked_key(key: &str) -> Result<String> {
    let key = key.trim();
    validate_key(key)?;
    Ok(key.to_string())
}

fn checked_value(value: &str) -> Result<String> {
    let value = value.trim();
    validate_value(value)?;
    Ok(value.to_string())
}

fn validate_key(key: &str) -> Result<()> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };
    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 || !LABEL_PREFIX.is_match(prefix) {
            return Err(Error::selector(format!("invalid label key prefix in '{}'", key)));
        }
    }
    if !LABEL_NAME.is_match(name) {
        return Err(Error::selector(format!("invalid label key '{}'", key)));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.is_empty() || LABEL_NAME.is_match(value) {
        Ok(())
    } else {
        Err(Error::selector(format!("invalid label value '{}'", value)))
    }
}
