use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a replica or client, assigned at process startup.
pub type NodeId = String;

/// Election epoch. Higher terms always win comparisons.
pub type Term = u64;

/// Position in the replicated log. Entries are 0-based; [`NO_INDEX`] marks an empty log.
pub type LogIndex = i64;

/// Index reported by a replica whose log is still empty.
pub const NO_INDEX: LogIndex = -1;

/// Role a replica currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// Smallest number of distinct votes (self-vote included) that elects a leader.
///
/// `N/2 + 1` equals `ceil(N/2)` for odd clusters and keeps even clusters from
/// electing two leaders in the same term.
pub fn quorum(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_matches_majority_for_odd_clusters() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);
        assert_eq!(quorum(7), 4);
    }

    #[test]
    fn test_quorum_never_drops_below_half_for_even_clusters() {
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(4), 3);
        for n in 1..20usize {
            assert!(quorum(n) >= n.div_ceil(2));
        }
    }

    #[test]
    fn test_role_display_is_lowercase() {
        assert_eq!(Role::Leader.to_string(), "leader");
        assert_eq!(Role::Candidate.to_string(), "candidate");
    }
}
