use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bbm_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::registry::DatabaseConnection;

/// Label classifying which logical database a table or migration belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GitlabSchema {
    #[serde(rename = "gitlab_main")]
    Main,
    #[serde(rename = "gitlab_ci")]
    Ci,
    /// Tables present on every connection.
    #[serde(rename = "gitlab_shared")]
    Shared,
    /// Bookkeeping tables (schema migrations and the like).
    #[serde(rename = "gitlab_internal")]
    Internal,
}

pub type GitlabSchemaSet = BTreeSet<GitlabSchema>;

impl GitlabSchema {
    pub const ALL: [GitlabSchema; 4] = [
        GitlabSchema::Main,
        GitlabSchema::Ci,
        GitlabSchema::Shared,
        GitlabSchema::Internal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GitlabSchema::Main => "gitlab_main",
            GitlabSchema::Ci => "gitlab_ci",
            GitlabSchema::Shared => "gitlab_shared",
            GitlabSchema::Internal => "gitlab_internal",
        }
    }
}

impl fmt::Display for GitlabSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GitlabSchema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        GitlabSchema::ALL
            .into_iter()
            .find(|schema| schema.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = GitlabSchema::ALL.iter().map(|s| s.as_str()).collect();
                Error::UnknownGitlabSchema(format!(
                    "Unknown 'gitlab_schema: {s}' specified. It needs to be one of: {}",
                    known.join(", ")
                ))
            })
    }
}

/// Schemas a connection serves: the owned schema of every logical database
/// bound to it, plus the shared and internal schemas every connection has.
pub fn gitlab_schemas_for_connection(connection: &DatabaseConnection) -> GitlabSchemaSet {
    let mut schemas: GitlabSchemaSet = connection
        .databases()
        .iter()
        .map(|db| db.gitlab_schema())
        .collect();
    schemas.insert(GitlabSchema::Shared);
    schemas.insert(GitlabSchema::Internal);
    schemas
}
