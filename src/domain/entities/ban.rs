//! Ban/trust list mutated by scripts and operators

use std::collections::HashMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BanRank {
    Banned,
    Warned,
    Normal,
    Trusted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanListItem {
    pub id: String,
    pub rank: BanRank,
    pub score: i64,
    pub places: Vec<String>,
    pub reasons: Vec<String>,
    pub updated_at: i64,
}

/// Score-based ban list; crossing the threshold flips the rank to banned.
#[derive(Debug, Serialize, Deserialize)]
pub struct BanList {
    pub threshold_warn: i64,
    pub threshold_ban: i64,
    items: HashMap<String, BanListItem>,
}

impl Default for BanList {
    fn default() -> Self {
        Self {
            threshold_warn: 100,
            threshold_ban: 200,
            items: HashMap::new(),
        }
    }
}

impl BanList {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, id: &str) -> &mut BanListItem {
        self.items.entry(id.to_string()).or_insert_with(|| BanListItem {
            id: id.to_string(),
            rank: BanRank::Normal,
            score: 0,
            places: Vec::new(),
            reasons: Vec::new(),
            updated_at: Utc::now().timestamp(),
        })
    }

    pub fn add_score(&mut self, id: &str, score: i64, place: &str, reason: &str) {
        let warn = self.threshold_warn;
        let ban = self.threshold_ban;
        let item = self.entry(id);
        item.score += score;
        item.places.push(place.to_string());
        item.reasons.push(reason.to_string());
        item.updated_at = Utc::now().timestamp();
        if item.rank != BanRank::Trusted {
            item.rank = if item.score >= ban {
                BanRank::Banned
            } else if item.score >= warn {
                BanRank::Warned
            } else {
                BanRank::Normal
            };
        }
    }

    /// Ban outright, regardless of accumulated score
    pub fn add_ban(&mut self, id: &str, place: &str, reason: &str) {
        let threshold = self.threshold_ban;
        self.add_score(id, threshold, place, reason);
        self.entry(id).rank = BanRank::Banned;
    }

    pub fn set_trust(&mut self, id: &str, place: &str, reason: &str) {
        let item = self.entry(id);
        item.rank = BanRank::Trusted;
        item.places.push(place.to_string());
        item.reasons.push(reason.to_string());
        item.updated_at = Utc::now().timestamp();
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.items.remove(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&BanListItem> {
        self.items.get(id)
    }

    pub fn list(&self) -> Vec<BanListItem> {
        let mut items: Vec<_> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_crossing_threshold_bans() {
        let mut list = BanList::new();
        list.add_score("u1", 150, "g1", "spam");
        assert_eq!(list.get("u1").unwrap().rank, BanRank::Warned);
        list.add_score("u1", 100, "g1", "more spam");
        assert_eq!(list.get("u1").unwrap().rank, BanRank::Banned);
    }

    #[test]
    fn trust_sticks_through_score_changes() {
        let mut list = BanList::new();
        list.set_trust("u2", "g1", "operator");
        list.add_score("u2", 999, "g1", "noise");
        assert_eq!(list.get("u2").unwrap().rank, BanRank::Trusted);
    }

    #[test]
    fn remove_is_idempotent_lookup() {
        let mut list = BanList::new();
        list.add_ban("u3", "g1", "bad");
        assert!(list.remove("u3"));
        assert!(!list.remove("u3"));
        assert!(list.get("u3").is_none());
    }
}
