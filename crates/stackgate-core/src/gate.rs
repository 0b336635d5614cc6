//! Gate evaluation engine.
//!
//! Turns a stage's parsed findings into a [`Verdict`] — the pass/fail
//! decision that halts or allows progression toward Apply. Supports
//! suppression rules that downgrade specific Blocking findings to advisory
//! warnings.
//!
//! Evaluation is pure and deterministic: identical findings and ruleset
//! always yield an identical verdict, which is what makes audits
//! reproducible and retries safe.

use serde::{Deserialize, Serialize};

use crate::domain::finding::{Finding, Severity};
use crate::domain::stage::Stage;

// ---------------------------------------------------------------------------
// Policy rules
// ---------------------------------------------------------------------------

/// Marks a rule as advisory-only for a stage: matching Blocking findings are
/// downgraded to Warning instead of failing the gate.
///
/// A suppression with `resource: None` matches the rule on every resource;
/// with `Some(resource)` it matches that resource only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suppression {
    /// Rule identifier to suppress (e.g. "S3_BUCKET_ENCRYPTION")
    pub rule_id: String,
    /// Restrict the suppression to one resource reference
    pub resource: Option<String>,
}

impl Suppression {
    fn matches(&self, finding: &Finding) -> bool {
        if self.rule_id != finding.rule_id {
            return false;
        }
        match &self.resource {
            Some(resource) => resource == &finding.resource,
            None => true,
        }
    }
}

/// The declarative ruleset a stage's gate evaluates under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRuleset {
    pub suppressions: Vec<Suppression>,
}

impl PolicyRuleset {
    /// Ruleset with no suppressions — every Blocking finding blocks.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Add a suppression for a rule across all resources.
    pub fn suppress_rule(mut self, rule_id: impl Into<String>) -> Self {
        self.suppressions.push(Suppression {
            rule_id: rule_id.into(),
            resource: None,
        });
        self
    }

    /// Add a suppression scoped to one resource.
    pub fn suppress_rule_on(
        mut self,
        rule_id: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        self.suppressions.push(Suppression {
            rule_id: rule_id.into(),
            resource: Some(resource.into()),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// The outcome of evaluating a stage's findings against its ruleset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the gate passed (no remaining Blocking finding).
    pub passed: bool,
    /// All findings, with suppressed ones downgraded in place. Input order
    /// is preserved.
    pub findings: Vec<Finding>,
}

impl Verdict {
    /// Findings still Blocking after suppression.
    pub fn blocking_count(&self) -> usize {
        self.findings.iter().filter(|f| f.is_blocking()).count()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate a stage's findings under its ruleset.
///
/// The decision rule: `passed` iff no finding remains Blocking after
/// suppressions are applied. Suppressed findings are kept in the output,
/// downgraded to Warning and flagged, so the audit record shows what was
/// waived and where.
pub fn evaluate(stage: Stage, findings: Vec<Finding>, ruleset: &PolicyRuleset) -> Verdict {
    let findings: Vec<Finding> = findings
        .into_iter()
        .map(|mut finding| {
            if finding.severity == Severity::Blocking
                && ruleset.suppressions.iter().any(|s| s.matches(&finding))
            {
                finding.severity = Severity::Warning;
                finding.suppressed = true;
            }
            finding
        })
        .collect();

    let blocking = findings.iter().filter(|f| f.is_blocking()).count();
    let passed = blocking == 0;

    tracing::debug!(
        stage = %stage,
        total = findings.len(),
        blocking = blocking,
        passed = passed,
        "gate evaluated"
    );

    Verdict { passed, findings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blocking(rule: &str, resource: &str) -> Finding {
        Finding::new(rule, Severity::Blocking, resource, "violation")
    }

    fn warning(rule: &str, resource: &str) -> Finding {
        Finding::new(rule, Severity::Warning, resource, "advisory")
    }

    #[test]
    fn test_no_findings_passes() {
        let verdict = evaluate(Stage::SecurityScan, vec![], &PolicyRuleset::strict());
        assert!(verdict.passed);
        assert!(verdict.findings.is_empty());
    }

    #[test]
    fn test_warnings_alone_pass() {
        let verdict = evaluate(
            Stage::Lint,
            vec![warning("L1", "module.vpc"), warning("L2", "module.vpc")],
            &PolicyRuleset::strict(),
        );
        assert!(verdict.passed);
        assert_eq!(verdict.findings.len(), 2);
    }

    #[test]
    fn test_blocking_finding_fails() {
        let verdict = evaluate(
            Stage::SecurityScan,
            vec![blocking("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs")],
            &PolicyRuleset::strict(),
        );
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking_count(), 1);
    }

    #[test]
    fn test_rule_wide_suppression_downgrades() {
        let ruleset = PolicyRuleset::strict().suppress_rule("S3_BUCKET_ENCRYPTION");
        let verdict = evaluate(
            Stage::SecurityScan,
            vec![blocking("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs")],
            &ruleset,
        );
        assert!(verdict.passed);
        assert_eq!(verdict.findings[0].severity, Severity::Warning);
        assert!(verdict.findings[0].suppressed);
    }

    #[test]
    fn test_resource_scoped_suppression() {
        let ruleset =
            PolicyRuleset::strict().suppress_rule_on("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs");
        let verdict = evaluate(
            Stage::SecurityScan,
            vec![
                blocking("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs"),
                blocking("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.audit"),
            ],
            &ruleset,
        );
        // Only the scoped resource is waived; the other still blocks.
        assert!(!verdict.passed);
        assert_eq!(verdict.blocking_count(), 1);
        assert!(verdict.findings[0].suppressed);
        assert!(!verdict.findings[1].suppressed);
    }

    #[test]
    fn test_suppression_does_not_touch_other_rules() {
        let ruleset = PolicyRuleset::strict().suppress_rule("OTHER_RULE");
        let verdict = evaluate(
            Stage::SecurityScan,
            vec![blocking("S3_BUCKET_ENCRYPTION", "aws_s3_bucket.logs")],
            &ruleset,
        );
        assert!(!verdict.passed);
    }

    #[test]
    fn test_deterministic_verdicts() {
        let ruleset = PolicyRuleset::strict().suppress_rule_on("R1", "a");
        let findings = vec![
            blocking("R1", "a"),
            blocking("R2", "b"),
            warning("R3", "c"),
        ];

        let v1 = evaluate(Stage::SecurityScan, findings.clone(), &ruleset);
        let v2 = evaluate(Stage::SecurityScan, findings, &ruleset);
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_input_order_preserved() {
        let findings = vec![warning("Z", "z"), blocking("A", "a"), warning("M", "m")];
        let verdict = evaluate(Stage::Lint, findings, &PolicyRuleset::strict());
        let rules: Vec<&str> = verdict.findings.iter().map(|f| f.rule_id.as_str()).collect();
        assert_eq!(rules, vec!["Z", "A", "M"]);
    }
}
