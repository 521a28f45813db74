//! Authorization boundary. The privilege-verification service is an
//! external collaborator; handlers only ever talk to this trait.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privilege {
    /// Full administrative rights (entity creation/deletion, shutdown).
    Admin,
    /// Tape operator: volume entry and modification, tag override.
    TapeOperator,
    /// Tape-handling daemons: mount notifications.
    TapeSystem,
}

pub trait PrivilegeChecker: Send + Sync {
    /// True when the caller holds `privilege`.
    fn check(&self, uid: u32, gid: u32, client_host: &str, privilege: Privilege) -> bool;
}

/// One grant line from the server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub uid: u32,
    #[serde(default)]
    pub gid: Option<u32>,
    pub privilege: Privilege,
}

/// Static grant table. `Admin` implies the two lower levels, and
/// `TapeOperator` implies `TapeSystem`.
#[derive(Debug, Default, Clone)]
pub struct StaticPrivileges {
    grants: Vec<Grant>,
    allow_all: bool,
}

impl StaticPrivileges {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self {
            grants,
            allow_all: false,
        }
    }

    /// Grants everything to everyone; test fixtures only.
    pub fn allow_all() -> Self {
        Self {
            grants: Vec::new(),
            allow_all: true,
        }
    }

    fn level(privilege: Privilege) -> u8 {
        match privilege {
            Privilege::TapeSystem => 0,
            Privilege::TapeOperator => 1,
            Privilege::Admin => 2,
        }
    }
}

impl PrivilegeChecker for StaticPrivileges {
    fn check(&self, uid: u32, gid: u32, _client_host: &str, privilege: Privilege) -> bool {
        if self.allow_all {
            return true;
        }
        let needed = Self::level(privilege);
        self.grants.iter().any(|grant| {
            grant.uid == uid
                && grant.gid.map_or(true, |g| g == gid)
                && Self::level(grant.privilege) >= needed
        })
    }
}
