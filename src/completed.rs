//! Completed-topic poller
//!
//! Periodically fetches a list of finished topics from an external source and
//! bans each one, which also stops any instance still running for it.

use crate::config::CompletedConfig;
use crate::supervisor::Supervisor;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Accepted response shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CompletedList {
    Wrapped {
        #[serde(alias = "finishedMatches")]
        completed: Vec<String>,
    },
    Bare(Vec<String>),
}

impl CompletedList {
    fn into_topics(self) -> Vec<String> {
        match self {
            CompletedList::Wrapped { completed } => completed,
            CompletedList::Bare(topics) => topics,
        }
    }
}

/// Parse a completed-topic response body
pub fn parse_completed(body: &str) -> anyhow::Result<Vec<String>> {
    let list: CompletedList = serde_json::from_str(body)?;
    Ok(list.into_topics())
}

pub struct CompletedPoller {
    url: String,
    interval: Duration,
    client: reqwest::Client,
    supervisor: Arc<Supervisor>,
    shutdown_rx: watch::Receiver<bool>,
}

impl CompletedPoller {
    /// `None` when no source URL is configured
    pub fn new(
        config: &CompletedConfig,
        supervisor: Arc<Supervisor>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<Self>> {
        let Some(url) = config.url.clone() else {
            return Ok(None);
        };
        if !supervisor.config().banning {
            warn!(url = %url, "Banning disabled, completed-topic poller not started");
            return Ok(None);
        }
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        Ok(Some(Self {
            url,
            interval: Duration::from_secs(config.interval_secs.max(1)),
            client,
            supervisor,
            shutdown_rx,
        }))
    }

    pub async fn run(mut self) {
        info!(url = %self.url, interval_secs = self.interval.as_secs(), "Polling for completed topics");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.fetch().await {
                        Ok(topics) => self.ban_all(topics).await,
                        Err(e) => warn!(url = %self.url, error = %e, "Failed to fetch completed topics"),
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        debug!("Completed-topic poller stopped");
                        break;
                    }
                }
            }
        }
    }

    async fn fetch(&self) -> anyhow::Result<Vec<String>> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_completed(&body)
    }

    async fn ban_all(&self, topics: Vec<String>) {
        let mut banned = 0;
        for topic in topics {
            if topic.is_empty() || self.supervisor.is_banned(&topic) {
                continue;
            }
            self.supervisor.notify_completed(&topic).await;
            banned += 1;
        }
        if banned > 0 {
            info!(count = banned, "Banned completed topics");
        }
    }
}
