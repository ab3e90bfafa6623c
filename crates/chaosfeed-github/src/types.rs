//! Wire shapes returned by the platform's REST and GraphQL endpoints.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::FetchError;

/// `owner/name` repository identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSlug {
    pub owner: String,
    pub name: String,
}

impl FromStr for RepoSlug {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) if !owner.is_empty() && !name.is_empty() => Ok(Self {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            _ => Err(FetchError::InvalidRepo(s.to_string())),
        }
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub id: i64,
}

/// One entry of the chronological repository activity feed. The inner
/// `payload` stays untyped here; each normalizer strategy decodes its own shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFeedEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub actor: UserRef,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl RawFeedEvent {
    /// Feed-level identifier as a number, if it parses.
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub id: i64,
    pub content: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub id: i64,
    pub number: i32,
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged: Option<bool>,
}

impl PullRequestSummary {
    /// List endpoints omit `merged`; `merged_at` is authoritative there.
    pub fn is_merged(&self) -> bool {
        self.merged.unwrap_or(false) || self.merged_at.is_some()
    }

    pub fn is_open(&self) -> bool {
        self.state == "open"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stargazer {
    pub starred_at: DateTime<Utc>,
    pub user: UserRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fork {
    pub id: i64,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub owner: Option<UserRef>,
    pub created_at: DateTime<Utc>,
}

/// Entry of the issues listing. The listing also returns pull requests,
/// which carry a `pull_request` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueSummary {
    pub id: i64,
    pub number: i32,
    pub state: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<serde_json::Value>,
}

impl IssueSummary {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

/// Entry of the repository-wide issue comment listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueComment {
    pub id: i64,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user: Option<UserRef>,
    #[serde(default)]
    pub issue_url: String,
    #[serde(default)]
    pub html_url: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl IssueComment {
    /// Parent number from `.../issues/{number}`.
    pub fn parent_number(&self) -> Option<i32> {
        self.issue_url
            .rsplit_once('/')
            .and_then(|(_, tail)| tail.parse().ok())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphQlAuthor {
    #[serde(default)]
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionReaction {
    #[serde(default)]
    pub database_id: Option<i64>,
    /// GraphQL enum form, e.g. `THUMBS_UP`.
    pub content: String,
    #[serde(default)]
    pub user: Option<GraphQlAuthor>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscussionComment {
    #[serde(default)]
    pub database_id: Option<i64>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub author: Option<GraphQlAuthor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_answer: bool,
    #[serde(default)]
    pub reactions: Vec<DiscussionReaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discussion {
    #[serde(default)]
    pub database_id: Option<i64>,
    pub number: i32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<GraphQlAuthor>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comments: Vec<DiscussionComment>,
    #[serde(default)]
    pub reactions: Vec<DiscussionReaction>,
}
