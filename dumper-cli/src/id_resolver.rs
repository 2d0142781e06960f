//! ID resolver module
//!
//! Lets users name a job by a short, unambiguous prefix of its UUID
//! instead of the full identifier.

use anyhow::{Context, Result, anyhow, bail};
use dumper_client::OrchestratorClient;
use std::str::FromStr;
use uuid::Uuid;

/// A job identifier as typed on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRef {
    /// Full UUID
    Id(Uuid),
    /// Lowercased prefix of a UUID
    Prefix(String),
}

impl FromStr for JobRef {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let input = input.trim();
        if let Ok(uuid) = Uuid::parse_str(input) {
            return Ok(JobRef::Id(uuid));
        }

        if input.is_empty() {
            bail!("Job ID cannot be empty");
        }
        if !input.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            bail!("'{}' is not a job ID or ID prefix", input);
        }

        Ok(JobRef::Prefix(input.to_lowercase()))
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobRef::Id(uuid) => write!(f, "{}", uuid),
            JobRef::Prefix(prefix) => f.write_str(prefix),
        }
    }
}

/// Resolve a job reference to a full UUID
///
/// A full UUID is returned as is. A prefix is matched against every job
/// the orchestrator still holds.
///
/// # Errors
/// Returns an error if:
/// - No job matches the prefix
/// - Multiple jobs match the prefix (ambiguous)
/// - API call fails
pub async fn resolve_job_id(client: &OrchestratorClient, job: &JobRef) -> Result<Uuid> {
    let prefix = match job {
        JobRef::Id(uuid) => return Ok(*uuid),
        JobRef::Prefix(prefix) => prefix,
    };

    let jobs = client
        .list_jobs(None)
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    match_prefix(prefix, jobs.iter().map(|j| j.job_id))
}

/// Picks the single id starting with `prefix`
fn match_prefix(prefix: &str, ids: impl IntoIterator<Item = Uuid>) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids
        .into_iter()
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "3f2a0c9e-1b7d-4c55-9a0e-6b1f2d3c4e5f";
    const B: &str = "3f2b7d10-0c4e-4a11-8f21-9d8e7c6b5a49";

    fn ids() -> Vec<Uuid> {
        vec![Uuid::parse_str(A).unwrap(), Uuid::parse_str(B).unwrap()]
    }

    #[test]
    fn test_parse_full_id_and_prefix() {
        assert_eq!(
            A.parse::<JobRef>().unwrap(),
            JobRef::Id(Uuid::parse_str(A).unwrap())
        );
        assert_eq!(
            "3F2A".parse::<JobRef>().unwrap(),
            JobRef::Prefix("3f2a".to_string())
        );
        assert!("".parse::<JobRef>().is_err());
        assert!("marble".parse::<JobRef>().is_err());
    }

    #[test]
    fn test_unique_prefix_resolves() {
        assert_eq!(match_prefix("3f2a", ids()).unwrap().to_string(), A);
    }

    #[test]
    fn test_ambiguous_prefix_lists_candidates() {
        let err = match_prefix("3f2", ids()).unwrap_err().to_string();
        assert!(err.starts_with("Ambiguous prefix '3f2'"));
        assert!(err.contains(A) && err.contains(B));
    }

    #[test]
    fn test_unknown_prefix_fails() {
        let err = match_prefix("ffff", ids()).unwrap_err().to_string();
        assert_eq!(err, "No job found with ID starting with 'ffff'");
    }
}
