//! Discussions over the GraphQL endpoint, cursor-paged.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::{
    Discussion, DiscussionComment, DiscussionReaction, FetchError, GitHubClient, GraphQlAuthor,
    RepoSlug,
};

const DISCUSSIONS_PAGE_CAP: usize = 10;

// 25 discussions x 50 comments x 50 reactions stays under the per-request node budget.
const DISCUSSIONS_QUERY: &str = r#"
query($owner: String!, $name: String!, $cursor: String) {
  repository(owner: $owner, name: $name) {
    discussions(first: 25, after: $cursor, orderBy: {field: UPDATED_AT, direction: DESC}) {
      pageInfo { hasNextPage endCursor }
      nodes {
        databaseId
        number
        title
        createdAt
        updatedAt
        author { login }
        reactions(first: 50) {
          nodes { databaseId content createdAt user { login } }
        }
        comments(first: 50) {
          nodes {
            databaseId
            body
            createdAt
            isAnswer
            author { login }
            reactions(first: 50) {
              nodes { databaseId content createdAt user { login } }
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
    variables: serde_json::Value,
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlErrorMessage>,
}

#[derive(Deserialize)]
struct GraphQlErrorMessage {
    message: String,
}

#[derive(Deserialize)]
struct RepositoryData {
    repository: Option<RepositoryNode>,
}

#[derive(Deserialize)]
struct RepositoryNode {
    discussions: DiscussionConnection,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscussionConnection {
    page_info: PageInfo,
    #[serde(default)]
    nodes: Vec<Option<DiscussionNode>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Nodes<T> {
    #[serde(default)]
    nodes: Vec<Option<T>>,
}

impl<T> Default for Nodes<T> {
    fn default() -> Self {
        Self { nodes: Vec::new() }
    }
}

impl<T> Nodes<T> {
    fn into_vec(self) -> Vec<T> {
        self.nodes.into_iter().flatten().collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscussionNode {
    database_id: Option<i64>,
    number: i32,
    #[serde(default)]
    title: String,
    author: Option<GraphQlAuthor>,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    reactions: Nodes<DiscussionReaction>,
    #[serde(default)]
    comments: Nodes<CommentNode>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentNode {
    database_id: Option<i64>,
    #[serde(default)]
    body: String,
    author: Option<GraphQlAuthor>,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    is_answer: bool,
    #[serde(default)]
    reactions: Nodes<DiscussionReaction>,
}

impl From<DiscussionNode> for Discussion {
    fn from(node: DiscussionNode) -> Self {
        Self {
            database_id: node.database_id,
            number: node.number,
            title: node.title,
            author: node.author,
            created_at: node.created_at,
            updated_at: node.updated_at,
            reactions: node.reactions.into_vec(),
            comments: node
                .comments
                .into_vec()
                .into_iter()
                .map(|comment| DiscussionComment {
                    database_id: comment.database_id,
                    body: comment.body,
                    author: comment.author,
                    created_at: comment.created_at,
                    is_answer: comment.is_answer,
                    reactions: comment.reactions.into_vec(),
                })
                .collect(),
        }
    }
}

impl GitHubClient {
    /// Most recently updated discussions with their comments and reactions.
    /// A failure after the first page returns the discussions already read.
    pub async fn discussions(&self, repo: &RepoSlug) -> Result<Vec<Discussion>, FetchError> {
        let mut discussions = Vec::new();
        let mut cursor: Option<String> = None;

        for page in 0..DISCUSSIONS_PAGE_CAP {
            let connection = match self.discussions_page(repo, cursor.as_deref()).await {
                Ok(connection) => connection,
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(err) if page == 0 => return Err(err),
                Err(err) => {
                    warn!(%repo, page, error = %err, "discussion paging stopped early, keeping partial results");
                    break;
                }
            };

            discussions.extend(
                connection
                    .nodes
                    .into_iter()
                    .flatten()
                    .map(Discussion::from),
            );

            match (connection.page_info.has_next_page, connection.page_info.end_cursor) {
                (true, Some(next)) => cursor = Some(next),
                _ => break,
            }
        }

        Ok(discussions)
    }

    async fn discussions_page(
        &self,
        repo: &RepoSlug,
        cursor: Option<&str>,
    ) -> Result<DiscussionConnection, FetchError> {
        let body = GraphQlRequest {
            query: DISCUSSIONS_QUERY,
            variables: json!({
                "owner": repo.owner,
                "name": repo.name,
                "cursor": cursor,
            }),
        };

        let response = self
            .send(|http| http.post(&self.graphql_url).json(&body))
            .await?;
        let bytes = response.bytes().await?;
        let decoded: GraphQlResponse<RepositoryData> =
            serde_json::from_slice(&bytes).map_err(|source| FetchError::Decode {
                url: self.graphql_url.clone(),
                source,
            })?;

        let messages = decoded
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");

        match decoded.data.and_then(|data| data.repository) {
            Some(repository) => {
                if !messages.is_empty() {
                    warn!(%repo, errors = %messages, "graphql returned partial data");
                }
                Ok(repository.discussions)
            }
            None if !messages.is_empty() => Err(FetchError::GraphQl(messages)),
            None => Err(FetchError::GraphQl(format!("repository {repo} not found"))),
        }
    }
}
