use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::Set;

/// Why a job carries a synthetic identifier instead of one assigned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FakeReason {
    /// The job was never dispatched, e.g. because a parent failed a pre-flight check
    /// or the submission command failed.
    NotExecuted,
    /// The job only stands in for a job that is not managed by this process.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobId {
    /// Identifier assigned by the backend.
    Backend(String),
    Fake(FakeReason),
}

impl JobId {
    pub fn backend(id: impl Into<String>) -> Self {
        JobId::Backend(id.into())
    }

    pub fn is_fake(&self) -> bool {
        matches!(self, JobId::Fake(_))
    }

    /// Returns the backend identifier, or `None` for sentinel identifiers.
    pub fn as_backend(&self) -> Option<&str> {
        match self {
            JobId::Backend(id) => Some(id.as_str()),
            JobId::Fake(_) => None,
        }
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobId::Backend(id) => f.write_str(id),
            JobId::Fake(FakeReason::NotExecuted) => f.write_str("<not-executed>"),
            JobId::Fake(FakeReason::Placeholder) => f.write_str("<placeholder>"),
        }
    }
}

/// Returns backend identifiers from `ids`, skipping sentinels and duplicates (by their string
/// form) while keeping the original order.
pub fn unique_backend_ids<'a>(ids: impl IntoIterator<Item = &'a JobId>) -> Vec<String> {
    let mut seen = Set::default();
    ids.into_iter()
        .filter_map(|id| id.as_backend())
        .filter(|id| seen.insert(*id))
        .map(|id| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{FakeReason, JobId, unique_backend_ids};

    #[test]
    fn unique_ids_skip_sentinels_and_duplicates() {
        let ids = [
            JobId::backend("2"),
            JobId::Fake(FakeReason::NotExecuted),
            JobId::backend("1"),
            JobId::backend("2"),
            JobId::Fake(FakeReason::Placeholder),
        ];
        assert_eq!(unique_backend_ids(&ids), vec!["2", "1"]);
    }

    #[test]
    fn display_sentinel() {
        assert_eq!(JobId::backend("15").to_string(), "15");
        assert!(JobId::Fake(FakeReason::NotExecuted).is_fake());
        assert_eq!(JobId::Fake(FakeReason::NotExecuted).as_backend(), None);
    }
}
