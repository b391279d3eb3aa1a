//! Replica-set configuration

use rook_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Member id within a set.
pub type MemberId = u32;

/// One member's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Unique id within the set.
    pub id: MemberId,
    /// `host:port`.
    pub host: String,
    /// Voting weight (0 or 1).
    pub votes: u32,
    /// Election priority; 0 never becomes primary.
    pub priority: f64,
    /// Arbiter: votes but holds no data.
    pub arbiter_only: bool,
}

impl MemberConfig {
    /// Standard data-bearing voting member.
    pub fn new(id: MemberId, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            votes: 1,
            priority: 1.0,
            arbiter_only: false,
        }
    }

    /// True when the member casts a vote.
    pub fn is_voter(&self) -> bool {
        self.votes > 0
    }
}

/// Configuration of the whole set, monotonically versioned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplSetConfig {
    /// Set name; every member must agree.
    pub name: String,
    /// Bumped on every reconfiguration.
    pub version: u64,
    /// All members.
    pub members: Vec<MemberConfig>,
}

impl ReplSetConfig {
    /// Build and validate a configuration.
    pub fn new(name: impl Into<String>, members: Vec<MemberConfig>) -> Result<Self> {
        let config = Self {
            name: name.into(),
            version: 1,
            members,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validation: non-empty, unique ids and hosts, at least one voter,
    /// vote weights 0/1.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::bad_value("replica set name must not be empty"));
        }
        if self.members.is_empty() {
            return Err(Error::bad_value("replica set needs at least one member"));
        }
        for m in &self.members {
            if m.votes > 1 {
                return Err(Error::bad_value(format!(
                    "member {} has invalid vote weight {}",
                    m.id, m.votes
                )));
            }
            if self.members.iter().filter(|o| o.id == m.id).count() > 1 {
                return Err(Error::bad_value(format!("duplicate member id {}", m.id)));
            }
            if self.members.iter().filter(|o| o.host == m.host).count() > 1 {
                return Err(Error::bad_value(format!("duplicate member host {}", m.host)));
            }
        }
        if self.voting_members() == 0 {
            return Err(Error::bad_value("replica set needs at least one voter"));
        }
        Ok(())
    }

    /// Member config by id.
    pub fn member(&self, id: MemberId) -> Option<&MemberConfig> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Number of voting members.
    pub fn voting_members(&self) -> usize {
        self.members.iter().filter(|m| m.is_voter()).count()
    }

    /// Votes needed for a majority.
    pub fn majority(&self) -> usize {
        self.voting_members() / 2 + 1
    }
}
