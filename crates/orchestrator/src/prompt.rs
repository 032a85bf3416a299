use anyhow::Result;
use async_trait::async_trait;
use common::OrcError;

/// Embedding-backed memory. External collaborator; when absent the prompt
/// simply carries no memory section.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Top-k memory hits relevant to the task description.
    async fn top_hits(&self, project: &str, query: &str, k: usize) -> Result<Vec<String>>;
    /// Standing rules for the project.
    async fn project_rules(&self, project: &str) -> Result<Vec<String>>;
    /// Ingest a finished session's transcript so future tasks can recall
    /// what was done. Runs in the background after a session ends.
    async fn record_transcript(&self, project: &str, task_id: &str, transcript: &str)
        -> Result<()>;
}

pub const MEMORY_TOP_K: usize = 5;

const BEHAVIOR_RULES: &[&str] = &[
    "Work autonomously; do not wait for confirmation unless something is destructive.",
    "Keep the diff minimal and focused on the task.",
    "Commit your work with a descriptive message.",
    "Push the feature branch to origin.",
    "Open a pull request if the change is ready for review.",
];

/// Assemble the prompt handed to the engine: project header, the task
/// description verbatim, behavior rules, then memory context when a store
/// is configured. Empty descriptions are rejected outright.
pub fn assemble_prompt(
    project: &str,
    description: &str,
    memory_hits: &[String],
    project_rules: &[String],
) -> Result<String, OrcError> {
    if description.trim().is_empty() {
        return Err(OrcError::fatal("task description is empty"));
    }

    let mut prompt = format!("Project: {}\n\n{}\n", project, description.trim());

    prompt.push_str("\nGuidelines:\n");
    for rule in BEHAVIOR_RULES {
        prompt.push_str("- ");
        prompt.push_str(rule);
        prompt.push('\n');
    }

    if !project_rules.is_empty() {
        prompt.push_str("\nProject rules:\n");
        for rule in project_rules {
            prompt.push_str("- ");
            prompt.push_str(rule);
            prompt.push('\n');
        }
    }

    if !memory_hits.is_empty() {
        prompt.push_str("\nRelevant context from previous work:\n");
        for hit in memory_hits {
            prompt.push_str("- ");
            prompt.push_str(hit);
            prompt.push('\n');
        }
    }

    Ok(prompt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_description() {
        assert!(assemble_prompt("foo", "", &[], &[]).is_err());
        assert!(assemble_prompt("foo", "   \n", &[], &[]).is_err());
    }

    #[test]
    fn description_is_verbatim() {
        let prompt = assemble_prompt("foo", "add readme", &[], &[]).unwrap();
        assert!(prompt.starts_with("Project: foo\n\nadd readme\n"));
        assert!(prompt.contains("Guidelines:"));
        assert!(prompt.contains("pull request"));
        assert!(!prompt.contains("Relevant context"));
    }

    #[test]
    fn memory_and_rules_sections_present_when_supplied() {
        let hits = vec!["the API uses cursor pagination".to_string()];
        let rules = vec!["run `make lint` before committing".to_string()];
        let prompt = assemble_prompt("foo", "fix the pager", &hits, &rules).unwrap();
        assert!(prompt.contains("Project rules:\n- run `make lint`"));
        assert!(prompt.contains("Relevant context from previous work:\n- the API uses cursor"));
    }
}
