use crate::models::feed::Subscription;

/// Desired subscriptions in registration order, without duplicates.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionBook {
    entries: Vec<Subscription>,
}

impl SubscriptionBook {
    /// Returns false when the subscription was already registered.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        if self.entries.contains(&subscription) {
            return false;
        }
        self.entries.push(subscription);
        true
    }

    pub fn remove(&mut self, subscription: &Subscription) -> bool {
        let before = self.entries.len();
        self.entries.retain(|s| s != subscription);
        self.entries.len() != before
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
