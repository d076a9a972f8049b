//! Permission table for named operations.
//!
//! Each operation the service exposes maps to a [`Policy`] that must pass
//! before its resolver runs.  Lookups are default-deny: an unknown operation
//! name, or a known operation without a table entry, is rejected as
//! forbidden.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::auth::{Identity, Role};
use crate::error::AppError;
use crate::validate::ArgSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Health,
    Me,
    ChatHistory,
    RateLimitStatus,
    AskQuestion,
    ResetRateLimit,
}

impl Operation {
    pub const ALL: [Operation; 6] = [
        Operation::Health,
        Operation::Me,
        Operation::ChatHistory,
        Operation::RateLimitStatus,
        Operation::AskQuestion,
        Operation::ResetRateLimit,
    ];

    pub fn kind(self) -> OperationKind {
        match self {
            Operation::Health
            | Operation::Me
            | Operation::ChatHistory
            | Operation::RateLimitStatus => OperationKind::Query,
            Operation::AskQuestion | Operation::ResetRateLimit => OperationKind::Mutation,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::Health => "health",
            Operation::Me => "me",
            Operation::ChatHistory => "chatHistory",
            Operation::RateLimitStatus => "rateLimitStatus",
            Operation::AskQuestion => "askQuestion",
            Operation::ResetRateLimit => "resetRateLimit",
        }
    }

    /// Resolve an operation by kind and exact name.
    pub fn lookup(kind: OperationKind, name: &str) -> Option<Operation> {
        Self::ALL
            .into_iter()
            .find(|op| op.kind() == kind && op.name() == name)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind().as_str(), self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    Allow,
    RequireAuth,
    RequireRole(Role),
    Validate { schema: ArgSchema, path: &'static str },
    /// Every sub-policy must pass; evaluated in order, stops at the first failure.
    All(Vec<Policy>),
    Deny,
}

impl Policy {
    pub fn check(&self, identity: Option<&Identity>, args: &Value) -> Result<(), AppError> {
        match self {
            Policy::Allow => Ok(()),
            Policy::RequireAuth => identity.map(|_| ()).ok_or(AppError::Unauthenticated),
            Policy::RequireRole(required) => match identity {
                None => Err(AppError::Unauthenticated),
                Some(id) if id.role.satisfies(*required) => Ok(()),
                Some(_) => Err(AppError::Forbidden),
            },
            Policy::Validate { schema, path } => schema.check(args, path),
            Policy::All(policies) => policies
                .iter()
                .try_for_each(|policy| policy.check(identity, args)),
            Policy::Deny => Err(AppError::Forbidden),
        }
    }
}

/// Process-wide, read-only operation → policy mapping.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    rules: HashMap<Operation, Policy>,
}

impl PermissionTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(mut self, op: Operation, policy: Policy) -> Self {
        self.rules.insert(op, policy);
        self
    }

    /// The table the service runs with.
    pub fn standard() -> Self {
        Self::empty()
            .with(Operation::Health, Policy::Allow)
            .with(Operation::Me, Policy::RequireAuth)
            .with(
                Operation::ChatHistory,
                Policy::All(vec![
                    Policy::RequireAuth,
                    Policy::Validate {
                        schema: ArgSchema::Int {
                            label: "limit",
                            min: 1,
                            max: Some(100),
                        },
                        path: "limit",
                    },
                    Policy::Validate {
                        schema: ArgSchema::Int {
                            label: "offset",
                            min: 0,
                            max: None,
                        },
                        path: "offset",
                    },
                ]),
            )
            .with(Operation::RateLimitStatus, Policy::RequireAuth)
            .with(
                Operation::AskQuestion,
                Policy::All(vec![
                    Policy::RequireAuth,
                    Policy::Validate {
                        schema: ArgSchema::question(),
                        path: "question",
                    },
                ]),
            )
            .with(
                Operation::ResetRateLimit,
                Policy::All(vec![
                    Policy::RequireRole(Role::Admin),
                    Policy::Validate {
                        schema: ArgSchema::Text {
                            label: "subjectId",
                            min: 1,
                            max: 128,
                        },
                        path: "subjectId",
                    },
                ]),
            )
    }

    pub fn policy(&self, op: Operation) -> Option<&Policy> {
        self.rules.get(&op)
    }

    /// Decide whether `op` may run for `identity` with `args`.
    pub fn authorize(
        &self,
        op: Operation,
        identity: Option<&Identity>,
        args: &Value,
    ) -> Result<(), AppError> {
        match self.rules.get(&op) {
            Some(policy) => policy.check(identity, args),
            None => {
                tracing::warn!(operation = %op, "operation has no permission entry; denying");
                Err(AppError::Forbidden)
            }
        }
    }

    /// Resolve and authorize a request addressed by raw kind and name.
    pub fn authorize_named(
        &self,
        kind: OperationKind,
        name: &str,
        identity: Option<&Identity>,
        args: &Value,
    ) -> Result<Operation, AppError> {
        let op = Operation::lookup(kind, name).ok_or_else(|| {
            tracing::debug!(kind = kind.as_str(), name, "unknown operation; denying");
            AppError::Forbidden
        })?;
        self.authorize(op, identity, args)?;
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn user() -> Identity {
        Identity {
            subject_id: "u1".into(),
            email: "u1@example.com".into(),
            role: Role::User,
        }
    }

    fn admin() -> Identity {
        Identity {
            subject_id: "a1".into(),
            email: "a1@example.com".into(),
            role: Role::Admin,
        }
    }

    fn kind_of(r: Result<(), AppError>) -> Option<ErrorKind> {
        r.err().map(|e| e.kind())
    }

    #[test]
    fn every_operation_has_an_entry() {
        let table = PermissionTable::standard();
        for op in Operation::ALL {
            assert!(table.policy(op).is_some(), "{} missing", op);
        }
    }

    #[test]
    fn ask_question_checks_auth_before_input() {
        let table = PermissionTable::standard();
        let bad = json!({"question": "x"});
        assert_eq!(
            kind_of(table.authorize(Operation::AskQuestion, None, &bad)),
            Some(ErrorKind::Unauthenticated)
        );
        assert_eq!(
            kind_of(table.authorize(Operation::AskQuestion, Some(&user()), &bad)),
            Some(ErrorKind::BadInput)
        );
        let good = json!({"question": "What is Rust?"});
        assert!(table
            .authorize(Operation::AskQuestion, Some(&user()), &good)
            .is_ok());
    }

    #[test]
    fn role_requirements() {
        let table = PermissionTable::standard();
        let args = json!({"subjectId": "u1"});
        assert_eq!(
            kind_of(table.authorize(Operation::ResetRateLimit, None, &args)),
            Some(ErrorKind::Unauthenticated)
        );
        assert_eq!(
            kind_of(table.authorize(Operation::ResetRateLimit, Some(&user()), &args)),
            Some(ErrorKind::Forbidden)
        );
        assert!(table
            .authorize(Operation::ResetRateLimit, Some(&admin()), &args)
            .is_ok());
        // admin also passes plain user requirements
        let policy = Policy::RequireRole(Role::User);
        assert!(policy.check(Some(&admin()), &json!({})).is_ok());
    }

    #[test]
    fn public_operations_need_no_identity() {
        let table = PermissionTable::standard();
        assert!(table.authorize(Operation::Health, None, &json!({})).is_ok());
    }

    #[test]
    fn unlisted_and_unknown_operations_are_denied() {
        let table = PermissionTable::empty().with(Operation::Health, Policy::Allow);
        assert_eq!(
            kind_of(table.authorize(Operation::Me, Some(&admin()), &json!({}))),
            Some(ErrorKind::Forbidden)
        );
        let err = PermissionTable::standard()
            .authorize_named(OperationKind::Mutation, "deleteEverything", Some(&admin()), &json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        // kind must match as well as name
        let err = PermissionTable::standard()
            .authorize_named(OperationKind::Query, "askQuestion", Some(&user()), &json!({}))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn conjunction_short_circuits() {
        let policy = Policy::All(vec![Policy::Deny, Policy::RequireAuth]);
        assert_eq!(kind_of(policy.check(None, &json!({}))), Some(ErrorKind::Forbidden));
    }

    #[test]
    fn chat_history_pagination_bounds() {
        let table = PermissionTable::standard();
        let id = user();
        assert!(table
            .authorize(Operation::ChatHistory, Some(&id), &json!({}))
            .is_ok());
        assert_eq!(
            kind_of(table.authorize(Operation::ChatHistory, Some(&id), &json!({"offset": -1}))),
            Some(ErrorKind::BadInput)
        );
        assert_eq!(
            kind_of(table.authorize(Operation::ChatHistory, Some(&id), &json!({"limit": 1000}))),
            Some(ErrorKind::BadInput)
        );
    }
}
