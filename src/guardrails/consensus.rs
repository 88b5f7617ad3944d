use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::permissions::Agent;

/// Weight each role carries in a consensus round.
#[must_use]
pub fn voting_weight(agent: Agent) -> u32 {
    match agent {
        Agent::Orchestrator => 3,
        Agent::Approver => 2,
        Agent::Prospector | Agent::Copywriter | Agent::Dispatcher => 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub voter: Agent,
    pub approve: bool,
}

impl Vote {
    #[must_use]
    pub fn approve(voter: Agent) -> Self {
        Self { voter, approve: true }
    }

    #[must_use]
    pub fn deny(voter: Agent) -> Self {
        Self { voter, approve: false }
    }
}

/// Weighted outcome of one consensus round. Integer arithmetic only, so the
/// two-thirds comparison has no float edge cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusTally {
    pub approved_weight: u32,
    pub total_weight: u32,
}

impl ConsensusTally {
    /// Accepted when approving weight is at least two thirds of the weight
    /// cast. An empty round never accepts.
    #[must_use]
    pub fn accepted(self) -> bool {
        self.total_weight > 0 && self.approved_weight * 3 >= self.total_weight * 2
    }
}

/// Tally a round. A voter appearing more than once counts once, with their
/// latest vote.
#[must_use]
pub fn tally(votes: &[Vote]) -> ConsensusTally {
    let mut latest: HashMap<Agent, bool> = HashMap::new();
    for vote in votes {
        latest.insert(vote.voter, vote.approve);
    }

    let mut approved_weight = 0;
    let mut total_weight = 0;
    for (voter, approve) in latest {
        let weight = voting_weight(voter);
        total_weight += weight;
        if approve {
            approved_weight += weight;
        }
    }
    ConsensusTally {
        approved_weight,
        total_weight,
    }
}
