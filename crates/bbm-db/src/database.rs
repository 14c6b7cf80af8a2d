use std::fmt;
use std::str::FromStr;

use bbm_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::schema::GitlabSchema;

/// One of the fixed set of logical databases a deployment can connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalDatabase {
    Main,
    Ci,
}

impl LogicalDatabase {
    pub const ALL: [LogicalDatabase; 2] = [LogicalDatabase::Main, LogicalDatabase::Ci];

    pub fn as_str(self) -> &'static str {
        match self {
            LogicalDatabase::Main => "main",
            LogicalDatabase::Ci => "ci",
        }
    }

    /// The gitlab schema whose tables live only in this database.
    pub fn gitlab_schema(self) -> GitlabSchema {
        match self {
            LogicalDatabase::Main => GitlabSchema::Main,
            LogicalDatabase::Ci => GitlabSchema::Ci,
        }
    }
}

impl fmt::Display for LogicalDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalDatabase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LogicalDatabase::ALL
            .into_iter()
            .find(|db| db.as_str() == s)
            .ok_or_else(|| Error::UnknownDatabase(s.to_string()))
    }
}
