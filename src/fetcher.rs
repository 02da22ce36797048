use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::feed::{parse_news, FeedError, FeedSource, NewsEntry, ParseOptions};
use crate::store::Store;

/// Entries of one successful fetch, keyed by the feed's id.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedFeed {
    pub id: String,
    pub entries: Vec<NewsEntry>,
}

pub struct Fetcher {
    client: Client,
    store: Arc<Store>,
    options: ParseOptions,
    refreshing: Arc<RwLock<bool>>,
}

impl Fetcher {
    pub fn new(store: Arc<Store>, options: ParseOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("NewsReader/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            store,
            options,
            refreshing: Arc::new(RwLock::new(false)),
        })
    }

    pub async fn is_refreshing(&self) -> bool {
        *self.refreshing.read().await
    }

    /// One GET, no retry. Any transport problem, a non-2xx status or a body
    /// that is not UTF-8 ends up as [`FeedError::FetchFailed`].
    pub async fn fetch(&self, url: &str) -> Result<String, FeedError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    /// Fetches and parses one feed. Holds no state between calls and
    /// returns no partial entries on failure.
    pub async fn fetch_and_parse(&self, source: &FeedSource) -> Result<FetchedFeed, FeedError> {
        let raw = self.fetch(&source.url).await?;
        let entries = parse_news(&raw, &self.options)?;

        Ok(FetchedFeed {
            id: source.feed_id(),
            entries,
        })
    }

    /// Fetches a feed and records the outcome in the store. On failure the
    /// previously cached entries stay in place.
    pub async fn refresh_feed(&self, source: &FeedSource) -> anyhow::Result<()> {
        let fid = source.feed_id();
        let lock = self.store.feed_lock(&fid).await;
        let _guard = lock.lock().await;

        info!("Fetching feed: {} ({})", source.name, source.url);

        match self.fetch_and_parse(source).await {
            Ok(fetched) => {
                let count = fetched.entries.len();
                if self.store.record_success(&fetched.id, fetched.entries).await? {
                    info!("Stored {} entries for feed '{}'", count, source.name);
                } else {
                    debug!("Feed '{}' changed during fetch, result dropped", source.name);
                }
                Ok(())
            }
            Err(e) => {
                warn!("Update of feed '{}' failed: {}", source.name, e);
                self.store.record_failure(&fid, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    pub async fn refresh_all_feeds(&self) -> anyhow::Result<()> {
        // Check if already refreshing
        {
            let mut refreshing = self.refreshing.write().await;
            if *refreshing {
                info!("Refresh already in progress, skipping");
                return Ok(());
            }
            *refreshing = true;
        }

        let result = self.do_refresh_all().await;

        // Clear refreshing flag
        {
            let mut refreshing = self.refreshing.write().await;
            *refreshing = false;
        }

        result
    }

    async fn do_refresh_all(&self) -> anyhow::Result<()> {
        let feeds: Vec<FeedSource> = self
            .store
            .feeds()
            .await
            .into_iter()
            .filter(|f| f.active)
            .collect();
        info!("Refreshing {} feeds", feeds.len());

        for feed in feeds {
            if let Err(e) = self.refresh_feed(&feed).await {
                error!("Failed to refresh feed '{}': {}", feed.name, e);
            }
        }

        info!("Feed refresh complete");
        Ok(())
    }
}

/// Refreshes all active feeds every `interval_minutes` while auto-update is
/// switched on in the settings.
pub async fn start_background_refresh(fetcher: Arc<Fetcher>, interval_minutes: u64) {
    if interval_minutes == 0 {
        info!("Background refresh disabled");
        return;
    }
    let interval = Duration::from_secs(interval_minutes * 60);

    loop {
        if fetcher.store.settings().await.auto_update {
            info!("Starting scheduled feed refresh");
            if let Err(e) = fetcher.refresh_all_feeds().await {
                error!("Scheduled feed refresh failed: {}", e);
            }
        }
        tokio::time::sleep(interval).await;
    }
}
