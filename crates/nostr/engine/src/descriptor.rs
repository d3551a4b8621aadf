//! Feed-agnostic fetch descriptions.

use crate::message::{ClientMessage, Filter};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Most authors a single filter carries. Relays commonly reject larger filters.
pub const MAX_AUTHORS: usize = 1999;

/// What to fetch, independent of the feed asking for it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchDescriptor {
    pub authors: Vec<String>,
    pub hashtags: Vec<String>,
    pub kinds: Vec<u16>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<u64>,
    /// Only these relays; `None` means every read relay
    pub relays: Option<HashSet<String>>,
    /// Always kept when the author list is sampled
    pub account_pubkey: Option<String>,
}

impl FetchDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = authors.into_iter().map(Into::into).collect();
        self
    }

    pub fn hashtags(mut self, hashtags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.hashtags = hashtags.into_iter().map(Into::into).collect();
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn relays(mut self, relays: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.relays = Some(relays.into_iter().map(Into::into).collect());
        self
    }

    pub fn account(mut self, pubkey: impl Into<String>) -> Self {
        self.account_pubkey = Some(pubkey.into());
        self
    }

    /// Authors to put on the wire: all of them, or a random sample of
    /// [`MAX_AUTHORS`] plus the account key.
    pub fn limited_authors(&self) -> Vec<String> {
        if self.authors.len() <= MAX_AUTHORS {
            return self.authors.clone();
        }

        let mut rng = rand::thread_rng();
        let mut picked: Vec<String> = self
            .authors
            .choose_multiple(&mut rng, MAX_AUTHORS)
            .cloned()
            .collect();
        if let Some(account) = &self.account_pubkey
            && !picked.contains(account)
        {
            picked.push(account.clone());
        }
        picked
    }

    fn base_filter(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.kinds.is_empty() {
            filter = filter.kinds(self.kinds.iter().copied());
        }
        if let Some(since) = self.since {
            filter = filter.since(since);
        }
        if let Some(until) = self.until {
            filter = filter.until(until);
        }
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }

    /// Authors and hashtags become separate filters; with neither, one filter on the rest.
    pub fn filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if !self.authors.is_empty() {
            filters.push(self.base_filter().authors(self.limited_authors()));
        }
        if !self.hashtags.is_empty() {
            let tags: Vec<String> = self.hashtags.iter().map(|t| t.to_lowercase()).collect();
            filters.push(self.base_filter().tag("t", tags));
        }
        if filters.is_empty() {
            filters.push(self.base_filter());
        }
        filters
    }

    pub fn request(&self, subscription_id: impl Into<String>) -> ClientMessage {
        ClientMessage::Req {
            subscription_id: subscription_id.into(),
            filters: self.filters(),
        }
    }
}
