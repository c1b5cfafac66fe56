//! Response predicates shared by the retry engine and the circuit breaker.
//!
//! Conditions are compiled once per pipeline build and evaluated against
//! every response.

use std::collections::HashSet;

use edge_gateway_sdk::ConditionConfig;
use http::header::HeaderName;
use http::{HeaderMap, Response, StatusCode};

use crate::error::GatewayError;

/// A compiled response predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Inclusive status range; a single code is `lo == hi`.
    Status { lo: u16, hi: u16 },
    /// Header present with one of the accepted values.
    Header {
        name: HeaderName,
        values: HashSet<String>,
    },
}

impl Condition {
    /// Compile one declarative condition.
    ///
    /// # Errors
    /// Returns [`GatewayError::InvalidCondition`] for malformed status specs,
    /// unparsable header value lists, bad header names, or a condition with
    /// neither a header nor a status.
    pub fn parse(config: &ConditionConfig) -> Result<Self, GatewayError> {
        if let Some(header) = &config.header {
            let name = HeaderName::from_bytes(header.name.as_bytes())
                .map_err(|e| invalid(&header.name, e))?;
            let values = if header.value.starts_with('[') {
                serde_json::from_str::<Vec<String>>(&header.value)
                    .map_err(|e| invalid(&header.value, e))?
                    .into_iter()
                    .collect()
            } else {
                HashSet::from([header.value.clone()])
            };
            return Ok(Self::Header { name, values });
        }
        if let Some(spec) = &config.status_code {
            return parse_status(spec);
        }
        Err(invalid("", "condition has neither header nor status_code"))
    }

    /// Whether the response satisfies this condition.
    #[must_use]
    pub fn matches(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        match self {
            Self::Status { lo, hi } => (*lo..=*hi).contains(&status.as_u16()),
            Self::Header { name, values } => headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .is_some_and(|v| values.contains(v)),
        }
    }
}

/// Compile a list of declarative conditions, failing on the first bad one.
///
/// # Errors
/// Propagates [`Condition::parse`] failures.
pub fn parse_conditions(configs: &[ConditionConfig]) -> Result<Vec<Condition>, GatewayError> {
    configs.iter().map(Condition::parse).collect()
}

/// `empty_default` for an empty list, otherwise true iff any condition matches.
#[must_use]
pub fn judge_conditions<B>(
    conditions: &[Condition],
    response: &Response<B>,
    empty_default: bool,
) -> bool {
    if conditions.is_empty() {
        return empty_default;
    }
    conditions
        .iter()
        .any(|c| c.matches(response.status(), response.headers()))
}

fn parse_status(spec: &str) -> Result<Condition, GatewayError> {
    let parts: Vec<&str> = spec.split('-').collect();
    let code = |s: &str| s.trim().parse::<u16>().map_err(|e| invalid(spec, e));
    match parts.as_slice() {
        [single] => {
            let c = code(*single)?;
            Ok(Condition::Status { lo: c, hi: c })
        }
        [lo, hi] => {
            let (lo, hi) = (code(*lo)?, code(*hi)?);
            if lo > hi {
                return Err(invalid(spec, "range start is greater than range end"));
            }
            Ok(Condition::Status { lo, hi })
        }
        _ => Err(invalid(spec, "expected \"N\" or \"A-B\"")),
    }
}

fn invalid(spec: &str, reason: impl ToString) -> GatewayError {
    GatewayError::InvalidCondition {
        spec: spec.to_owned(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn response(status: u16, headers: &[(&str, &str)]) -> Response<()> {
        let mut builder = Response::builder().status(status);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        builder.body(()).unwrap()
    }

    fn status(spec: &str) -> Condition {
        Condition::parse(&ConditionConfig::status(spec)).unwrap()
    }

    #[test]
    fn status_range_is_inclusive() {
        let c = status("500-504");
        let matched: Vec<u16> = [499, 500, 502, 504, 505]
            .into_iter()
            .filter(|s| c.matches(StatusCode::from_u16(*s).unwrap(), &HeaderMap::new()))
            .collect();
        assert_eq!(matched, vec![500, 502, 504]);
    }

    #[test]
    fn single_status_matches_exactly() {
        let c = status("503");
        assert!(c.matches(StatusCode::SERVICE_UNAVAILABLE, &HeaderMap::new()));
        assert!(!c.matches(StatusCode::BAD_GATEWAY, &HeaderMap::new()));
    }

    #[test]
    fn malformed_status_specs_are_rejected() {
        for spec in ["1-2-3", "abc", "500-", "70000", "504-500", ""] {
            let err = Condition::parse(&ConditionConfig::status(spec)).unwrap_err();
            assert!(
                matches!(err, GatewayError::InvalidCondition { .. }),
                "{spec}: {err}"
            );
        }
    }

    #[test]
    fn header_value_list_is_a_set() {
        let c = Condition::parse(&ConditionConfig::header("X-Retry", r#"["a","b"]"#)).unwrap();
        assert!(judge_conditions(&[c.clone()], &response(200, &[("x-retry", "b")]), false));
        assert!(!judge_conditions(&[c.clone()], &response(200, &[("x-retry", "c")]), false));
        assert!(!judge_conditions(&[c], &response(200, &[]), false));
    }

    #[test]
    fn header_literal_and_empty_value() {
        let c = Condition::parse(&ConditionConfig::header("x-flag", "on")).unwrap();
        assert!(c.matches(StatusCode::OK, response(200, &[("x-flag", "on")]).headers()));
        assert!(!c.matches(StatusCode::OK, response(200, &[("x-flag", "")]).headers()));
    }

    #[test]
    fn bad_header_list_is_rejected() {
        let err = Condition::parse(&ConditionConfig::header("x", "[not json")).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCondition { .. }));
    }

    #[test]
    fn empty_condition_is_rejected() {
        let err = Condition::parse(&ConditionConfig::default()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidCondition { .. }));
    }

    #[test]
    fn judge_uses_default_when_empty_and_or_otherwise() {
        let resp = response(502, &[]);
        assert!(judge_conditions(&[], &resp, true));
        assert!(!judge_conditions(&[], &resp, false));

        let conditions = parse_conditions(&[
            ConditionConfig::status("404"),
            ConditionConfig::status("500-599"),
        ])
        .unwrap();
        assert!(judge_conditions(&conditions, &resp, false));
        assert!(!judge_conditions(&conditions, &response(200, &[]), true));
    }
}
