//! Database roles the operator manages credentials for

use std::fmt;
use std::str::FromStr;

use rand::Rng;

use crate::Error;

/// Length of generated passwords
pub const PASSWORD_LENGTH: usize = 16;

/// A database role whose password is generated at bootstrap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SystemUser {
    /// Superuser the operator connects as
    Operator,
    /// Streaming replication
    Replication,
    /// pg_rewind after failover
    Rewind,
    /// Metrics exporter
    Monitoring,
}

impl SystemUser {
    /// Every system user, in bootstrap order
    pub const ALL: [SystemUser; 4] = [
        SystemUser::Operator,
        SystemUser::Replication,
        SystemUser::Rewind,
        SystemUser::Monitoring,
    ];

    /// Role name in the database
    pub fn username(&self) -> &'static str {
        match self {
            SystemUser::Operator => "operator",
            SystemUser::Replication => "replication",
            SystemUser::Rewind => "rewind",
            SystemUser::Monitoring => "monitoring",
        }
    }

    /// Secret key the password is stored under (application scope)
    pub fn password_key(&self) -> String {
        format!("{}-password", self.username())
    }

    /// Resolve an optional caller-supplied username, defaulting to the operator
    pub fn from_optional(username: Option<&str>) -> Result<Self, Error> {
        username.map_or(Ok(SystemUser::Operator), str::parse)
    }
}

impl fmt::Display for SystemUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.username())
    }
}

impl FromStr for SystemUser {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SystemUser::ALL
            .into_iter()
            .find(|u| u.username() == s)
            .ok_or_else(|| {
                let known: Vec<_> = SystemUser::ALL.iter().map(|u| u.username()).collect();
                Error::validation_for(
                    "username",
                    format!(
                        "'{s}' is not a user managed by the operator ({})",
                        known.join(", ")
                    ),
                )
            })
    }
}

/// Generate a random alphanumeric password
pub fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LENGTH)
        .map(|_| {
            let idx = rng.gen_range(0..62u8);
            match idx {
                0..=9 => (b'0' + idx) as char,
                10..=35 => (b'a' + idx - 10) as char,
                _ => (b'A' + idx - 36) as char,
            }
        })
        .collect()
}
