//! Known/new classification of scraped links against the article store.

use std::collections::HashSet;

use paw_core::ArticleRecord;
use paw_storage::ArticleStore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Links the store already holds.
    pub known: HashSet<String>,
    /// Links whose lookup failed; neither known nor new.
    pub unresolved: HashSet<String>,
    /// Candidates skipped because their link was blank.
    pub skipped: usize,
}

impl Classification {
    pub fn is_new(&self, link: &str) -> bool {
        !link.trim().is_empty() && !self.known.contains(link) && !self.unresolved.contains(link)
    }
}

/// Looks links up in batches of `batch_size`. When a batch query fails its
/// links are retried one at a time, so only links whose own lookup fails end
/// up unresolved.
pub async fn classify(store: &dyn ArticleStore, links: &[String], batch_size: usize) -> Classification {
    let mut classification = Classification::default();
    let mut seen = HashSet::new();
    let mut candidates = Vec::with_capacity(links.len());
    for link in links {
        if link.trim().is_empty() {
            classification.skipped += 1;
            continue;
        }
        if seen.insert(link.as_str()) {
            candidates.push(link.clone());
        }
    }

    for batch in candidates.chunks(batch_size.max(1)) {
        match store.existing_links(batch).await {
            Ok(found) => {
                debug!(batch = batch.len(), known = found.len(), "link lookup batch");
                record_known(&mut classification, batch, found);
            }
            Err(err) => {
                warn!(batch = batch.len(), error = %err, "batch link lookup failed; checking links one by one");
                for link in batch {
                    let single = std::slice::from_ref(link);
                    match store.existing_links(single).await {
                        Ok(found) => record_known(&mut classification, single, found),
                        Err(err) => {
                            warn!(%link, error = %err, "link lookup failed; link left unresolved");
                            classification.unresolved.insert(link.clone());
                        }
                    }
                }
            }
        }
    }
    classification
}

/// Only links that were actually asked about count as known.
fn record_known(classification: &mut Classification, asked: &[String], found: Vec<String>) {
    let asked: HashSet<&str> = asked.iter().map(String::as_str).collect();
    classification
        .known
        .extend(found.into_iter().filter(|l| asked.contains(l.as_str())));
}

/// Records whose link is new, first occurrence only, in scrape order.
pub fn new_records(records: &[ArticleRecord], classification: &Classification) -> Vec<ArticleRecord> {
    let mut emitted = HashSet::new();
    records
        .iter()
        .filter(|r| classification.is_new(&r.link) && emitted.insert(r.link.clone()))
        .cloned()
        .collect()
}
