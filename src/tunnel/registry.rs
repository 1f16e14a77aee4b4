//! Site registry (§4.4) and the suffix-matching resolver (§4.5).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::TunnelError;
use crate::tunnel::site::{Site, SiteConnection};

/// Registered sites in registration order (needed for `find_similar`'s
/// earliest-registration tiebreak) plus a name index for O(1) exact
/// lookup and upsert.
#[derive(Default)]
pub struct SiteRegistry {
    sites: RwLock<Vec<Arc<Site>>>,
    index: RwLock<HashMap<String, usize>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly-connected site, or reinitializes the existing one
    /// for `conn.domain_name` in place (closing its prior connection).
    /// Returns the (possibly pre-existing) `Arc<Site>`.
    pub async fn upsert(&self, conn: SiteConnection) -> Arc<Site> {
        let existing = {
            let index = self.index.read().unwrap();
            index.get(&conn.domain_name).copied()
        };

        if let Some(position) = existing {
            let site = {
                let sites = self.sites.read().unwrap();
                sites[position].clone()
            };
            site.reinitialize(conn).await;
            return site;
        }

        let site = Arc::new(Site::new(conn));
        let mut sites = self.sites.write().unwrap();
        let mut index = self.index.write().unwrap();
        index.insert(site.domain_name.clone(), sites.len());
        sites.push(site.clone());
        site
    }

    pub fn list(&self) -> Vec<Arc<Site>> {
        self.sites.read().unwrap().clone()
    }

    pub fn get_exact(&self, name: &str) -> Result<Arc<Site>, TunnelError> {
        let position = *self
            .index
            .read()
            .unwrap()
            .get(name)
            .ok_or_else(|| TunnelError::SiteNotFound(name.to_string()))?;
        Ok(self.sites.read().unwrap()[position].clone())
    }

    pub fn find_similar(&self, query: &str) -> Result<Arc<Site>, TunnelError> {
        let sites = self.list();
        find_similar(&sites, query).ok_or_else(|| TunnelError::SiteNotFound(query.to_string()))
    }
}

/// Longest right-anchored label-suffix match, earliest registration wins
/// ties, and a zero-length match still counts, so this only returns
/// `None` when `sites` is empty (§4.5).
pub fn find_similar(sites: &[Arc<Site>], query: &str) -> Option<Arc<Site>> {
    let query_labels: Vec<&str> = query.rsplit('.').collect();

    // `Iterator::max_by_key` keeps the *last* maximum on ties; the tie
    // rule here is "earliest registration wins", so the scan only
    // replaces the current best on a strictly greater match length.
    let mut best: Option<(usize, &Arc<Site>)> = None;
    for site in sites {
        let len = suffix_match_len(&query_labels, &site.domain_name);
        let replace = match best {
            Some((best_len, _)) => len > best_len,
            None => true,
        };
        if replace {
            best = Some((len, site));
        }
    }
    best.map(|(_, site)| site.clone())
}

fn suffix_match_len(query_labels: &[&str], candidate: &str) -> usize {
    candidate
        .rsplit('.')
        .zip(query_labels.iter())
        .take_while(|(a, b)| a == *b)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::site::fake_connection;

    fn site(domain: &str) -> Arc<Site> {
        Arc::new(Site::new_detached(domain))
    }

    #[tokio::test]
    async fn upsert_keeps_one_entry_per_domain() {
        let registry = SiteRegistry::new();
        let (a1, _) = fake_connection("edge-a");
        let (b, _) = fake_connection("edge-b");
        let (a2, _) = fake_connection("edge-a");

        registry.upsert(a1).await;
        registry.upsert(b).await;
        registry.upsert(a2).await;

        assert_eq!(registry.list().len(), 2);
    }

    #[tokio::test]
    async fn reconnecting_the_same_domain_supersedes_the_old_connection() {
        let registry = SiteRegistry::new();
        let (first, first_handle) = fake_connection("edge-a");
        let first_site = registry.upsert(first).await;

        let (second, _second_handle) = fake_connection("edge-a");
        registry.upsert(second).await;

        assert_eq!(registry.list().len(), 1);

        let looked_up = registry.get_exact("edge-a").unwrap();
        assert!(Arc::ptr_eq(&first_site, &looked_up));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(first_handle.was_disconnected());
    }

    #[test]
    fn empty_registry_has_no_match() {
        let sites: Vec<Arc<Site>> = Vec::new();
        assert!(find_similar(&sites, "anything.example.com").is_none());
    }

    #[test]
    fn suffix_match_length_favors_longer_right_anchored_overlap() {
        let query: Vec<&str> = "a.example.com".rsplit('.').collect();
        assert_eq!(suffix_match_len(&query, "a.example.com"), 3);
        assert_eq!(suffix_match_len(&query, "example.com"), 2);
        assert_eq!(suffix_match_len(&query, "b.example.com"), 2);
        assert_eq!(suffix_match_len(&query, "unrelated.org"), 0);
    }

    #[test]
    fn empty_suffix_match_still_counts() {
        let query: Vec<&str> = "foo".rsplit('.').collect();
        assert_eq!(suffix_match_len(&query, "bar"), 0);
    }

    #[test]
    fn find_similar_picks_longest_suffix_over_a_registered_set() {
        let sites = vec![
            site("a.example.com"),
            site("b.example.com"),
            site("example.com"),
        ];

        let found = find_similar(&sites, "c.example.com").unwrap();
        assert_eq!(found.domain_name, "example.com");

        let found = find_similar(&sites, "a.example.com").unwrap();
        assert_eq!(found.domain_name, "a.example.com");
    }

    #[test]
    fn find_similar_against_a_single_unrelated_site_still_matches() {
        let sites = vec![site("unrelated.org")];
        let found = find_similar(&sites, "anything.example.com").unwrap();
        assert_eq!(found.domain_name, "unrelated.org");
    }

    #[test]
    fn find_similar_breaks_ties_by_registration_order() {
        let sites = vec![site("first.org"), site("second.org")];
        // Neither shares a label with the query, so both tie at match
        // length zero; the earliest-registered site wins.
        let found = find_similar(&sites, "nothing.in.common").unwrap();
        assert_eq!(found.domain_name, "first.org");
    }
}
