//! Binding of guest policy artifacts to pending tasks.
//!
//! The deployment client drops one descriptor per assigned task into its policy
//! directory. The task identifier is embedded in the file name as a
//! `CP<d><dddd><d>` token; the inner four digits are the identifier.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::{info, warn};

use crate::task::Task;

/// Extension of policy descriptors; other files in the directory are ignored
pub const POLICY_EXTENSION: &str = ".xml";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"CP\d(\d{4})\d").expect("static pattern compiles"))
}

/// Numeric task identifier embedded in an artifact name
pub fn extract_task_id(artifact: &str) -> Option<u32> {
    id_pattern()
        .captures(artifact)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Outcome of binding artifacts to tasks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchReport {
    /// Artifacts considered (after extension filtering)
    pub artifacts: usize,

    /// Tasks that received a command
    pub bound: usize,

    /// Tasks expected
    pub tasks: usize,

    /// Artifacts that matched no pending task
    pub unmatched: Vec<String>,
}

impl MatchReport {
    /// Whether every artifact lines up with a task
    pub fn is_complete(&self) -> bool {
        self.artifacts == self.tasks
    }
}

/// Maps policy artifacts to tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyMatcher;

impl PolicyMatcher {
    /// Bind each matching artifact's file name as its task's command.
    ///
    /// Tasks are matched by numeric identifier, so `CP001230.xml` binds task
    /// `"123"`. Tasks left unbound stay not deployable. A count mismatch is
    /// logged as a warning.
    pub fn bind(&self, artifacts: &[String], tasks: &mut [Task]) -> MatchReport {
        let by_id: HashMap<u32, usize> = tasks
            .iter()
            .enumerate()
            .filter_map(|(idx, task)| task.id.trim().parse().ok().map(|id| (id, idx)))
            .collect();

        let policies: Vec<&String> = artifacts
            .iter()
            .filter(|name| name.to_ascii_lowercase().ends_with(POLICY_EXTENSION))
            .collect();

        let mut report = MatchReport {
            artifacts: policies.len(),
            tasks: tasks.len(),
            ..Default::default()
        };

        for artifact in policies {
            match extract_task_id(artifact).and_then(|id| by_id.get(&id)) {
                Some(&idx) => {
                    if tasks[idx].command.replace(artifact.clone()).is_none() {
                        report.bound += 1;
                    }
                }
                None => report.unmatched.push(artifact.clone()),
            }
        }

        if report.is_complete() {
            info!(tasks = report.tasks, "all packages can be deployed");
        } else {
            warn!(
                artifacts = report.artifacts,
                tasks = report.tasks,
                "policy file count does not match assigned task count"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_task_id() {
        assert_eq!(extract_task_id("CP012340.xml"), Some(1234));
        assert_eq!(extract_task_id("LD_CP900017.xml"), Some(1));
        assert_eq!(extract_task_id("CPx12340.xml"), None);
        assert_eq!(extract_task_id("CP0123.xml"), None);
    }

    #[test]
    fn test_bind_matches_and_ignores() {
        let mut tasks = vec![Task::new("1234", "7-Zip"), Task::new("42", "Java"), Task::new("777", "Office")];
        let artifacts = vec![
            "CP012340.xml".to_string(),
            "CP000420.xml".to_string(),
            "CP099990.xml".to_string(),
            "CP077770.log".to_string(),
        ];

        let report = PolicyMatcher.bind(&artifacts, &mut tasks);

        assert_eq!(tasks[0].command.as_deref(), Some("CP012340.xml"));
        assert_eq!(tasks[1].command.as_deref(), Some("CP000420.xml"));
        assert!(!tasks[2].is_deployable());
        assert_eq!(report.artifacts, 3);
        assert_eq!(report.bound, 2);
        assert_eq!(report.unmatched, vec!["CP099990.xml".to_string()]);
        assert!(report.is_complete());
    }

    #[test]
    fn test_count_mismatch_is_not_an_error() {
        let mut tasks = vec![Task::new("1", "a"), Task::new("2", "b")];
        let report = PolicyMatcher.bind(&["CP000010.xml".to_string()], &mut tasks);
        assert!(!report.is_complete());
        assert_eq!(report.bound, 1);
    }
}
