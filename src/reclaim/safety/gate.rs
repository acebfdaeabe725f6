use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::context::RootSet;
use super::validation::{OwnershipCheck, SignatureCheck};
use crate::config::PolicyConfig;
use crate::reclaim::types::Action;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum RejectionReason {
    Unresolvable { detail: String },
    Blacklisted { root: PathBuf },
    OutsideWhitelist,
    TooRecent { age_hours: i64, min_hours: u64 },
    ValidationFailed { detail: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Unresolvable { detail } => {
                write!(f, "cannot resolve target: {}", detail)
            }
            RejectionReason::Blacklisted { root } => {
                write!(f, "under blacklisted root {}", root.display())
            }
            RejectionReason::OutsideWhitelist => f.write_str("not under any whitelisted root"),
            RejectionReason::TooRecent {
                age_hours,
                min_hours,
            } => write!(
                f,
                "modified {}h ago, minimum age is {}h",
                age_hours, min_hours
            ),
            RejectionReason::ValidationFailed { detail } => {
                write!(f, "failed validation: {}", detail)
            }
        }
    }
}

/// An action the gate authorized. Only the gate can construct one, so the
/// apply stage cannot be handed anything that skipped review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ApprovedAction(Action);

impl ApprovedAction {
    pub fn action(&self) -> &Action {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedAction {
    pub action: Action,
    pub reason: RejectionReason,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GateReview {
    pub approved: Vec<ApprovedAction>,
    pub rejected: Vec<RejectedAction>,
}

impl GateReview {
    pub fn approved_bytes(&self) -> u64 {
        self.approved
            .iter()
            .map(|a| a.action().estimated_bytes_freed)
            .sum()
    }
}

/// The only place destructive work is authorized. Rules run in order and the
/// first rejection wins.
pub struct SafetyGate<'p> {
    policy: &'p PolicyConfig,
    blacklist: RootSet,
    whitelist: RootSet,
    validator: Arc<dyn SignatureCheck>,
}

impl<'p> SafetyGate<'p> {
    pub fn new(policy: &'p PolicyConfig) -> Self {
        SafetyGate {
            policy,
            blacklist: RootSet::new(&policy.blacklist_paths),
            whitelist: RootSet::new(&policy.whitelist_paths),
            validator: Arc::new(OwnershipCheck),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SignatureCheck>) -> Self {
        self.validator = validator;
        self
    }

    /// Root rules see both the path as scanned and the path it resolves to, so
    /// a followed symlink cannot smuggle a protected file past them.
    pub fn verdict(&self, action: &Action, now: DateTime<Utc>) -> Result<(), RejectionReason> {
        let path = &action.target_path;
        let real = fs::canonicalize(path).map_err(|e| RejectionReason::Unresolvable {
            detail: e.to_string(),
        })?;

        if let Some(root) = self
            .blacklist
            .containing(path)
            .or_else(|| self.blacklist.containing(&real))
        {
            return Err(RejectionReason::Blacklisted {
                root: root.to_path_buf(),
            });
        }

        if self.policy.enforce_whitelist
            && !self.whitelist.is_empty()
            && (self.whitelist.containing(path).is_none()
                || self.whitelist.containing(&real).is_none())
        {
            return Err(RejectionReason::OutsideWhitelist);
        }

        let age = now.signed_duration_since(action.modified);
        if age < self.policy.min_file_age() {
            return Err(RejectionReason::TooRecent {
                age_hours: age.num_hours(),
                min_hours: self.policy.min_file_age_hours,
            });
        }

        if self.policy.validate_file_signatures {
            self.validator
                .validate(path)
                .map_err(|detail| RejectionReason::ValidationFailed { detail })?;
        }

        Ok(())
    }

    pub fn review(&self, actions: &[Action], now: DateTime<Utc>) -> GateReview {
        let mut review = GateReview::default();
        for action in actions {
            match self.verdict(action, now) {
                Ok(()) => review.approved.push(ApprovedAction(action.clone())),
                Err(reason) => {
                    log::debug!(
                        "Safety gate rejected {}: {}",
                        action.target_path.display(),
                        reason
                    );
                    review.rejected.push(RejectedAction {
                        action: action.clone(),
                        reason,
                    });
                }
            }
        }
        log::info!(
            "Safety gate approved {} and rejected {} of {} actions",
            review.approved.len(),
            review.rejected.len(),
            actions.len()
        );
        review
    }
}

#[cfg(test)]
pub(crate) fn approve_unchecked(action: Action) -> ApprovedAction {
    ApprovedAction(action)
}
