//! Account rotation over the credential list of a provider.
//!
//! Rotation is not round-robin: across requests the lowest available index
//! always wins, so a temporarily failing account is retried as soon as its
//! cool-down expires. Monotonicity within one logical request is the
//! caller's job (the handler never revisits an index it already tried).

use crate::cooldown::CooldownManager;

/// Selects accounts by index, skipping cooled-down ones.
#[derive(Clone)]
pub struct AccountRotator {
    cooldowns: CooldownManager,
}

impl AccountRotator {
    /// A rotator sharing the given cool-down table.
    pub fn new(cooldowns: CooldownManager) -> Self {
        Self { cooldowns }
    }

    fn key(provider: &str, model: &str, index: usize) -> String {
        format!("{provider}:{model}:{index}")
    }

    /// Lowest available account index, or `None` when every account is
    /// cooled down or the list is empty.
    pub fn get_next_available(&self, provider: &str, model: &str, account_count: usize) -> Option<usize> {
        (0..account_count).find(|&index| self.cooldowns.is_available(&Self::key(provider, model, index)))
    }

    /// Whether any index strictly greater than `from_index` is available.
    pub fn has_next(&self, provider: &str, model: &str, account_count: usize, from_index: usize) -> bool {
        (from_index + 1..account_count)
            .any(|index| self.cooldowns.is_available(&Self::key(provider, model, index)))
    }

    /// Record a rate limit for one account.
    pub fn mark_rate_limited(&self, provider: &str, model: &str, index: usize, retry_after_ms: Option<u64>) -> u64 {
        self.cooldowns
            .mark_rate_limited(&Self::key(provider, model, index), retry_after_ms)
    }

    /// Whether every account of the provider/model pair is cooled down.
    pub fn are_all_rate_limited(&self, provider: &str, model: &str, account_count: usize) -> bool {
        account_count > 0 && self.get_next_available(provider, model, account_count).is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_lowest_available_index() {
        let rotator = AccountRotator::new(CooldownManager::new());

        assert_eq!(rotator.get_next_available("openai", "gpt-4o", 3), Some(0));

        rotator.mark_rate_limited("openai", "gpt-4o", 0, Some(60_000));
        assert_eq!(rotator.get_next_available("openai", "gpt-4o", 3), Some(1));

        rotator.mark_rate_limited("openai", "gpt-4o", 1, Some(60_000));
        assert_eq!(rotator.get_next_available("openai", "gpt-4o", 3), Some(2));
    }

    #[test]
    fn empty_credential_list_has_no_accounts() {
        let rotator = AccountRotator::new(CooldownManager::new());
        assert_eq!(rotator.get_next_available("openai", "gpt-4o", 0), None);
        assert!(!rotator.are_all_rate_limited("openai", "gpt-4o", 0));
    }

    #[test]
    fn has_next_looks_strictly_past_the_current_index() {
        let rotator = AccountRotator::new(CooldownManager::new());

        assert!(rotator.has_next("openai", "gpt-4o", 3, 0));
        assert!(!rotator.has_next("openai", "gpt-4o", 3, 2));

        rotator.mark_rate_limited("openai", "gpt-4o", 1, Some(60_000));
        rotator.mark_rate_limited("openai", "gpt-4o", 2, Some(60_000));
        assert!(!rotator.has_next("openai", "gpt-4o", 3, 0));
    }

    #[test]
    fn all_rate_limited_after_marking_every_account() {
        let rotator = AccountRotator::new(CooldownManager::new());

        for index in 0..2 {
            rotator.mark_rate_limited("openai", "gpt-4o", index, Some(60_000));
        }

        assert!(rotator.are_all_rate_limited("openai", "gpt-4o", 2));
        assert_eq!(rotator.get_next_available("openai", "gpt-4o", 2), None);
    }

    #[test]
    fn keys_are_scoped_per_model() {
        let rotator = AccountRotator::new(CooldownManager::new());

        rotator.mark_rate_limited("openai", "gpt-4o", 0, Some(60_000));
        assert_eq!(rotator.get_next_available("openai", "gpt-4o-mini", 1), Some(0));
    }
}
