//! TTL tracker of work items believed to be open.
//!
//! A single mutex covers every read-modify-write sequence, so "check expiry,
//! then evict" is atomic with respect to the other loops.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::PullRequestSummary;

pub const DEFAULT_OPEN_ITEM_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenItem {
    pub number: i32,
    pub state: ItemState,
    pub title: Option<String>,
    pub refreshed_at: Instant,
}

#[derive(Debug)]
pub struct OpenItemCache {
    ttl: Duration,
    items: Mutex<HashMap<i32, OpenItem>>,
}

impl Default for OpenItemCache {
    fn default() -> Self {
        Self::new(DEFAULT_OPEN_ITEM_TTL)
    }
}

impl OpenItemCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            items: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_live(&self, item: &OpenItem, now: Instant) -> bool {
        now.duration_since(item.refreshed_at) < self.ttl
    }

    /// Inserts the item or refreshes its state and timestamp.
    pub async fn upsert(&self, number: i32, state: ItemState, title: Option<String>) {
        let mut items = self.items.lock().await;
        let refreshed_at = Instant::now();
        items
            .entry(number)
            .and_modify(|item| {
                item.state = state;
                item.refreshed_at = refreshed_at;
                if title.is_some() {
                    item.title = title.clone();
                }
            })
            .or_insert_with(|| OpenItem {
                number,
                state,
                title: title.clone(),
                refreshed_at,
            });
    }

    /// Point lookup; an expired entry is removed and reported as absent.
    pub async fn get(&self, number: i32) -> Option<OpenItem> {
        let mut items = self.items.lock().await;
        let now = Instant::now();
        match items.get(&number) {
            Some(item) if self.is_live(item, now) => Some(item.clone()),
            Some(_) => {
                items.remove(&number);
                None
            }
            None => None,
        }
    }

    /// Non-expired open item numbers, ascending.
    pub async fn open_numbers(&self) -> Vec<i32> {
        let items = self.items.lock().await;
        let now = Instant::now();
        let mut numbers: Vec<i32> = items
            .values()
            .filter(|item| item.state == ItemState::Open && self.is_live(item, now))
            .map(|item| item.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// Non-expired entries regardless of state, ordered by number.
    pub async fn all_items(&self) -> Vec<OpenItem> {
        let items = self.items.lock().await;
        let now = Instant::now();
        let mut live: Vec<OpenItem> = items
            .values()
            .filter(|item| self.is_live(item, now))
            .cloned()
            .collect();
        live.sort_unstable_by_key(|item| item.number);
        live
    }

    pub async fn evict(&self, number: i32) -> bool {
        self.items.lock().await.remove(&number).is_some()
    }

    /// Drops every expired entry and returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let mut items = self.items.lock().await;
        let now = Instant::now();
        let before = items.len();
        items.retain(|_, item| now.duration_since(item.refreshed_at) < self.ttl);
        before - items.len()
    }

    pub async fn clear(&self) {
        self.items.lock().await.clear();
    }

    /// Entry count including not-yet-swept expired entries.
    pub async fn count(&self) -> usize {
        self.items.lock().await.len()
    }

    /// Bulk refresh from a pull request listing: open ones are upserted, closed
    /// ones evicted. Returns the number of open entries written.
    pub async fn refresh_from(&self, pulls: &[PullRequestSummary]) -> usize {
        let mut items = self.items.lock().await;
        let refreshed_at = Instant::now();
        let mut written = 0;
        for pr in pulls {
            if pr.is_open() {
                items.insert(
                    pr.number,
                    OpenItem {
                        number: pr.number,
                        state: ItemState::Open,
                        title: Some(pr.title.clone()),
                        refreshed_at,
                    },
                );
                written += 1;
            } else {
                items.remove(&pr.number);
            }
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(number: i32, state: &str) -> PullRequestSummary {
        serde_json::from_value(serde_json::json!({
            "id": number as i64 * 10,
            "number": number,
            "state": state,
            "title": format!("PR {number}"),
            "created_at": "2026-01-02T03:04:05Z"
        }))
        .expect("pull request")
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = OpenItemCache::new(Duration::from_secs(60));
        cache.upsert(7, ItemState::Open, Some("feature".into())).await;
        cache.upsert(3, ItemState::Open, None).await;

        assert_eq!(cache.open_numbers().await, vec![3, 7]);
        assert_eq!(
            cache.get(7).await.and_then(|item| item.title),
            Some("feature".to_string())
        );

        tokio::time::advance(Duration::from_secs(30)).await;
        cache.upsert(3, ItemState::Open, None).await;
        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(cache.open_numbers().await, vec![3], "7 expired, 3 refreshed");
        assert!(cache.get(7).await.is_none());
        assert_eq!(cache.count().await, 1, "lazy lookup removed the stale entry");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_purges_only_expired() {
        let cache = OpenItemCache::new(Duration::from_secs(10));
        cache.upsert(1, ItemState::Open, None).await;
        cache.upsert(2, ItemState::Closed, None).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.upsert(3, ItemState::Open, None).await;

        assert_eq!(cache.sweep_expired().await, 2);
        assert_eq!(cache.count().await, 1);
        assert_eq!(cache.all_items().await[0].number, 3);
    }

    #[tokio::test]
    async fn closed_items_are_tracked_but_not_listed_as_open() {
        let cache = OpenItemCache::default();
        cache.upsert(4, ItemState::Open, None).await;
        cache.upsert(4, ItemState::Closed, None).await;

        assert!(cache.open_numbers().await.is_empty());
        assert_eq!(cache.all_items().await.len(), 1);
        assert!(cache.evict(4).await);
        assert!(!cache.evict(4).await);
    }

    #[tokio::test]
    async fn refresh_from_listing_upserts_open_and_evicts_closed() {
        let cache = OpenItemCache::default();
        cache.upsert(9, ItemState::Open, None).await;

        let written = cache
            .refresh_from(&[pull(1, "open"), pull(2, "open"), pull(9, "closed")])
            .await;

        assert_eq!(written, 2);
        assert_eq!(cache.open_numbers().await, vec![1, 2]);
        cache.clear().await;
        assert_eq!(cache.count().await, 0);
    }
}
