use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::feed::{is_valid_url, FeedSource, NewsEntry};

const SETTINGS_FILENAME: &str = "settings.json";
const FEEDLIST_FILENAME: &str = "feeds.json";
const NEWS_FILENAME: &str = "news.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub remote_access: bool,
    #[serde(default)]
    pub auto_update: bool,
}

/// Cached entries keyed by feed id.
pub type NewsCache = HashMap<String, Vec<NewsEntry>>;

/// One row of the feed list form.
#[derive(Debug, Clone)]
pub struct FeedEdit {
    pub position: i64,
    pub url: String,
    pub active: bool,
}

#[derive(Clone)]
struct State {
    settings: Settings,
    feeds: Vec<FeedSource>,
    news: NewsCache,
    /// No feed list existed on disk when the store was opened
    fresh: bool,
}

/// Owner of settings, feed list and news cache, persisted as JSON files.
///
/// Every mutation happens under one lock and is written to disk before the
/// lock is released. Fetches of the same feed are serialized separately
/// through [`Store::feed_lock`].
pub struct Store {
    dir: PathBuf,
    state: Mutex<State>,
    feed_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

async fn load_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Writes `value` next to `path` as `<path>.tmp` and returns the temp path.
async fn stage_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<PathBuf> {
    let json = serde_json::to_vec_pretty(value)?;
    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);
    tokio::fs::write(&tmp_path, json).await?;
    Ok(tmp_path)
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp_path = stage_json(path, value).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    debug!("{} written", path.display());
    Ok(())
}

async fn backup(path: &Path) {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return;
    }
    let mut backup_path = path.as_os_str().to_owned();
    backup_path.push("~");
    if let Err(e) = tokio::fs::copy(path, &backup_path).await {
        error!("Could not create backup of {}: {}", path.display(), e);
    }
}

impl Store {
    pub async fn open<P: AsRef<Path>>(dir: P) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let settings_path = dir.join(SETTINGS_FILENAME);
        let settings = match load_json::<Settings>(&settings_path).await {
            Ok(settings) => settings,
            Err(e) => {
                info!(
                    "Error loading application settings from {} ({}), restoring default settings",
                    settings_path.display(),
                    e
                );
                let settings = Settings::default();
                write_json(&settings_path, &settings).await?;
                settings
            }
        };

        let feeds_path = dir.join(FEEDLIST_FILENAME);
        let fresh = !tokio::fs::try_exists(&feeds_path).await?;
        let mut feeds: Vec<FeedSource> = if fresh {
            Vec::new()
        } else {
            load_json(&feeds_path).await.unwrap_or_else(|e| {
                warn!("Error loading feed list from {}: {}", feeds_path.display(), e);
                Vec::new()
            })
        };
        for feed in &mut feeds {
            feed.id = feed.feed_id();
        }

        let news_path = dir.join(NEWS_FILENAME);
        let news: NewsCache = if tokio::fs::try_exists(&news_path).await? {
            load_json(&news_path).await.unwrap_or_else(|e| {
                warn!("Error loading news from {}: {}", news_path.display(), e);
                NewsCache::new()
            })
        } else {
            NewsCache::new()
        };

        Ok(Self {
            dir,
            state: Mutex::new(State {
                settings,
                feeds,
                news,
                fresh,
            }),
            feed_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Writes all three files. Every file is staged before any is renamed into
    /// place, so a failed write leaves the previous files untouched.
    async fn persist(&self, state: &State) -> anyhow::Result<()> {
        let news_path = self.dir.join(NEWS_FILENAME);
        let feeds_path = self.dir.join(FEEDLIST_FILENAME);
        let settings_path = self.dir.join(SETTINGS_FILENAME);

        let mut staged = Vec::with_capacity(3);
        let result = async {
            staged.push((stage_json(&news_path, &state.news).await?, &news_path));
            staged.push((stage_json(&feeds_path, &state.feeds).await?, &feeds_path));
            staged.push((stage_json(&settings_path, &state.settings).await?, &settings_path));
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = result {
            for (tmp_path, _) in &staged {
                let _ = tokio::fs::remove_file(tmp_path).await;
            }
            return Err(e);
        }

        backup(&feeds_path).await;
        for (tmp_path, path) in staged {
            tokio::fs::rename(&tmp_path, path).await?;
            debug!("{} written", path.display());
        }
        Ok(())
    }

    /// Persists `next` and only then makes it the current state.
    async fn commit(&self, state: &mut State, next: State) -> anyhow::Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    /// Installs the configured feeds if the store started without a feed list.
    pub async fn seed_feeds(&self, configs: &[FeedConfig]) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        if !state.fresh {
            return Ok(0);
        }
        let mut next = state.clone();
        next.fresh = false;
        next.feeds = configs
            .iter()
            .map(|c| FeedSource::new(&c.name, &c.url, c.active))
            .collect();
        self.commit(&mut state, next).await?;

        info!("Seeded feed list with {} feeds", state.feeds.len());
        Ok(state.feeds.len())
    }

    pub async fn settings(&self) -> Settings {
        self.state.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let next = State {
            settings,
            ..state.clone()
        };
        self.commit(&mut state, next).await
    }

    pub async fn feeds(&self) -> Vec<FeedSource> {
        self.state.lock().await.feeds.clone()
    }

    pub async fn feed(&self, idx: usize) -> Option<FeedSource> {
        self.state.lock().await.feeds.get(idx).cloned()
    }

    pub async fn entries(&self, fid: &str) -> Vec<NewsEntry> {
        self.state
            .lock()
            .await
            .news
            .get(fid)
            .cloned()
            .unwrap_or_default()
    }

    /// Appends a feed. Returns `None` when the list is already full.
    pub async fn add_feed(
        &self,
        name: &str,
        url: &str,
        active: bool,
        max_feeds: usize,
    ) -> anyhow::Result<Option<FeedSource>> {
        let mut state = self.state.lock().await;
        if state.feeds.len() >= max_feeds {
            warn!("Maximum number of feeds reached, submit of new feed was ignored");
            return Ok(None);
        }
        let feed = FeedSource::new(name, url, active);
        let mut next = state.clone();
        next.feeds.push(feed.clone());
        self.commit(&mut state, next).await?;

        info!("Feed {}: '{}' ({}) added", feed.id, feed.name, feed.url);
        Ok(Some(feed))
    }

    /// Applies the feed list form: one edit per feed, in current list order.
    ///
    /// Invalid URLs keep the old URL. A changed URL gets a new id and its
    /// cached entries move with it. Feeds are then reordered by position.
    pub async fn update_feed_list(&self, edits: &[FeedEdit]) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if edits.len() != state.feeds.len() {
            anyhow::bail!(
                "Feed list changed while editing ({} rows submitted, {} feeds stored)",
                edits.len(),
                state.feeds.len()
            );
        }

        let mut next = state.clone();
        let State { feeds, news, .. } = &mut next;
        // Remove every old key before inserting new ones so that swapped URLs
        // keep their entries.
        let mut moved = Vec::new();
        for (feed, edit) in feeds.iter_mut().zip(edits) {
            if is_valid_url(&edit.url) {
                if let Some(old_id) = feed.set_url(&edit.url) {
                    info!("Feed '{}' moved from {} to {}", feed.name, old_id, feed.id);
                    if let Some(entries) = news.remove(&old_id) {
                        moved.push((feed.id.clone(), entries));
                    }
                }
            } else {
                warn!("Ignoring invalid URL '{}' for feed '{}'", edit.url, feed.name);
            }
            feed.active = edit.active;
        }
        news.extend(moved);

        let mut ordered: Vec<(i64, FeedSource)> = edits
            .iter()
            .map(|e| e.position)
            .zip(feeds.drain(..))
            .collect();
        ordered.sort_by_key(|(position, _)| *position);
        *feeds = ordered.into_iter().map(|(_, feed)| feed).collect();

        self.commit(&mut state, next).await
    }

    /// Removes a feed together with its cached entries.
    pub async fn remove_feed(&self, idx: usize) -> anyhow::Result<Option<FeedSource>> {
        let mut state = self.state.lock().await;
        if idx >= state.feeds.len() {
            return Ok(None);
        }

        let mut next = state.clone();
        let feed = next.feeds.remove(idx);
        next.news.remove(&feed.id);
        self.commit(&mut state, next).await?;

        info!("Feed {}: '{}' ({}) removed", feed.id, feed.name, feed.url);
        Ok(Some(feed))
    }

    /// Drops all cached entries and fetch timestamps.
    pub async fn clear_news(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.news.clear();
        for feed in &mut next.feeds {
            feed.last_updated = None;
            feed.last_error = None;
        }
        self.commit(&mut state, next).await
    }

    /// Replaces the feed's cached entries. Returns `false` when no feed with
    /// this id exists anymore, in which case nothing is stored.
    pub async fn record_success(&self, fid: &str, entries: Vec<NewsEntry>) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let Some(feed) = next.feeds.iter_mut().find(|f| f.id == fid) else {
            return Ok(false);
        };
        feed.last_updated = Some(timestamp());
        feed.last_error = None;
        next.news.insert(fid.to_string(), entries);

        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Notes a failed fetch. Previously cached entries are kept.
    pub async fn record_failure(&self, fid: &str, error: &str) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let Some(feed) = next.feeds.iter_mut().find(|f| f.id == fid) else {
            return Ok(false);
        };
        feed.last_updated = Some(timestamp());
        feed.last_error = Some(error.to_string());

        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Lock held for the duration of one fetch of the given feed.
    ///
    /// Locks nobody holds a handle to are dropped here, so ids of removed or
    /// moved feeds do not pile up.
    pub async fn feed_lock(&self, fid: &str) -> Arc<Mutex<()>> {
        let mut locks = self.feed_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(fid.to_string()).or_default().clone()
    }
}
