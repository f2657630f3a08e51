use serde::{Deserialize, Serialize};

/// Final result of a build as reported by the CI server. A build that is
/// still running has no result (`None` on [`Build::result`]).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildResult {
    Success,
    Failure,
    Unstable,
    Aborted,
    NotBuilt,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub file_name: String,
    pub relative_path: String,
    #[serde(default)]
    pub display_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub full_name: String,
    #[serde(default)]
    pub absolute_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSetItem {
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default, alias = "comment")]
    pub msg: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub affected_paths: Vec<String>,
    #[serde(default)]
    pub commit_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChangeSet {
    #[serde(default)]
    pub items: Vec<ChangeSetItem>,
    #[serde(default)]
    pub kind: Option<String>,
}

/// One run of a job. Freestyle jobs report a single `changeSet`, pipeline
/// jobs a `changeSets` list; both are kept as received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub number: u64,
    #[serde(default)]
    pub result: Option<BuildResult>,
    #[serde(default)]
    pub building: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub culprits: Vec<User>,
    #[serde(default)]
    pub change_set: ChangeSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub change_sets: Vec<ChangeSet>,
    pub url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl Build {
    /// Completed with a result that is allowed to be installed.
    pub fn is_installable(&self) -> bool {
        !self.building
            && matches!(
                self.result,
                Some(BuildResult::Success) | Some(BuildResult::Unstable)
            )
    }

    /// Remote location of an artifact: `<build url>/artifact/<relativePath>`.
    pub fn artifact_url(&self, artifact: &Artifact) -> String {
        format!(
            "{}/artifact/{}",
            self.url.trim_end_matches('/'),
            artifact.relative_path.trim_start_matches('/')
        )
    }

    /// All change-set items, from `changeSet` followed by every `changeSets` entry.
    pub fn change_items(&self) -> impl Iterator<Item = &ChangeSetItem> {
        self.change_set
            .items
            .iter()
            .chain(self.change_sets.iter().flat_map(|cs| cs.items.iter()))
    }

    /// Flattened change set used as the snapshot stored with a package.
    pub fn merged_change_set(&self) -> ChangeSet {
        ChangeSet {
            items: self.change_items().cloned().collect(),
            kind: self
                .change_set
                .kind
                .clone()
                .or_else(|| self.change_sets.iter().find_map(|cs| cs.kind.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildRef {
    pub number: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub buildable: Option<bool>,
    #[serde(default)]
    pub last_build: Option<BuildRef>,
    #[serde(default)]
    pub last_successful_build: Option<BuildRef>,
    #[serde(default)]
    pub builds: Vec<BuildRef>,
}
