//! The error taxonomy (spec §7) and the `Controller` status condition it drives.
//!
//! Grounded on `pkg/conditions/setter.go`: the original's `ErrTerminal` wrapper and
//! `ErrorMiddleware` become [`TerminalError`] and the plain functions below, since the
//! handler-chain-level wiring (reading the prior condition, writing the new one,
//! disabling prune) lives in the error-to-condition wrapper built in `handler.rs` --
//! this module only owns the taxonomy and the condition value itself.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use std::{error::Error as StdError, fmt};

/// The well-known condition type this framework reports on parent objects.
pub const CONDITION_TYPE: &str = "Controller";

/// How a handler error should be treated by the dispatcher (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Conflict, not-found-then-found, network blip: re-enqueue with backoff.
    Transient,
    /// Requires external change. No retry; recorded as a `Controller=False` condition.
    Terminal,
    /// A registration-time mistake (unknown scheme type, unknown list kind). Fail fast.
    Programmer,
    /// The framework itself cannot proceed (informer cache failed to sync). Refuse to start.
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Mirrors the Go middleware's `reflect.TypeOf(err).Name()` reason string, which
        // for a terminal error is the wrapper type's own name (S4: reason `ErrTerminal`).
        let s = match self {
            ErrorKind::Transient => "Transient",
            ErrorKind::Terminal => "ErrTerminal",
            ErrorKind::Programmer => "Programmer",
            ErrorKind::Fatal => "Fatal",
        };
        f.write_str(s)
    }
}

/// Wraps a cause that cannot be recovered from until some other part of the system
/// changes -- typically additional user input, or a dependency becoming available.
///
/// Ported from Go's `ErrTerminal`/`NewErrTerminal`/`NewErrTerminalf`.
#[derive(Debug)]
pub struct TerminalError {
    cause: Box<dyn StdError + Send + Sync + 'static>,
}

impl TerminalError {
    pub fn new<E>(cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            cause: Box::new(cause),
        }
    }
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)
    }
}

impl StdError for TerminalError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Build the `Controller=True` condition recorded after a successful, non-retrying
/// reconciliation (spec §4.2, S1).
#[must_use]
pub fn success_condition(observed_generation: i64) -> Condition {
    Condition {
        type_: CONDITION_TYPE.to_owned(),
        status: "True".to_owned(),
        observed_generation: Some(observed_generation),
        reason: "ReconcileSucceeded".to_owned(),
        message: String::new(),
        last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            now_for_condition(),
        ),
    }
}

/// Build the `Controller=False` condition recorded when a handler error surfaces to
/// the user (terminal error, or not-found-after-retry) -- spec §4.2, S4.
#[must_use]
pub fn error_condition(kind: ErrorKind, message: impl Into<String>, observed_generation: i64) -> Condition {
    Condition {
        type_: CONDITION_TYPE.to_owned(),
        status: "False".to_owned(),
        observed_generation: Some(observed_generation),
        reason: kind.to_string(),
        message: message.into(),
        last_transition_time: k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            now_for_condition(),
        ),
    }
}

fn now_for_condition() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
    k8s_openapi::chrono::Utc::now()
}

/// Read `status.conditions` off a [`kontrol_client::api::DynamicObject`]'s untyped
/// payload.
///
/// Handlers operate on `DynamicObject` (design note "Dynamic object materialization"),
/// so there is no `Status()` accessor to reflect into as the original does; this walks
/// the JSON tree instead.
#[must_use]
pub fn read_conditions(obj: &kontrol_client::api::DynamicObject) -> Vec<Condition> {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default()
}

/// Write `cond` into `status.conditions`, replacing any existing condition of the same
/// `type_` (mirrors `meta.SetStatusCondition`).
pub fn write_condition(obj: &mut kontrol_client::api::DynamicObject, cond: Condition) {
    let mut conditions = read_conditions(obj);
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == cond.type_) {
        *existing = cond;
    } else {
        conditions.push(cond);
    }
    let status = obj
        .data
        .as_object_mut()
        .expect("DynamicObject payload is a JSON object")
        .entry("status")
        .or_insert_with(|| serde_json::json!({}));
    status["conditions"] = serde_json::to_value(conditions).expect("Condition always serializes");
}

/// The `status` subtree, for the deep-equality check that decides whether a status
/// subresource update is needed after a successful apply (spec §4.3 "Status update
/// ordering").
#[must_use]
pub fn status_subtree(obj: &kontrol_client::api::DynamicObject) -> serde_json::Value {
    obj.data.get("status").cloned().unwrap_or(serde_json::Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_reason_strings_match_go_type_names() {
        assert_eq!(ErrorKind::Terminal.to_string(), "ErrTerminal");
        assert_eq!(ErrorKind::Transient.to_string(), "Transient");
    }

    #[test]
    fn success_condition_has_true_status_and_no_message() {
        let cond = success_condition(3);
        assert_eq!(cond.status, "True");
        assert_eq!(cond.observed_generation, Some(3));
        assert!(cond.message.is_empty());
    }

    #[test]
    fn error_condition_carries_kind_as_reason() {
        let cond = error_condition(ErrorKind::Terminal, "credentials missing", 1);
        assert_eq!(cond.status, "False");
        assert_eq!(cond.reason, "ErrTerminal");
        assert_eq!(cond.message, "credentials missing");
    }

    #[test]
    fn write_condition_replaces_existing_type() {
        use kontrol_client::api::DynamicObject;
        let mut obj = DynamicObject::new("foo", &kontrol_core::ApiResource::from_gvk(&kontrol_core::GroupVersionKind::gvk("", "v1", "App")));
        write_condition(&mut obj, error_condition(ErrorKind::Transient, "boom", 1));
        assert_eq!(read_conditions(&obj).len(), 1);
        write_condition(&mut obj, success_condition(2));
        let conds = read_conditions(&obj);
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].status, "True");
        assert_eq!(conds[0].observed_generation, Some(2));
    }
}
