use crate::account::AccountName;
use crate::crypto::PublicKey;

/// A producer authorized by the active schedule, with its block signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerKey {
    pub producer_name: AccountName,
    pub signing_key: PublicKey,
}

/// The ordered set of producers that own block slots, in round-robin order.
///
/// Each producer owns `producer_repetitions` consecutive slots before the
/// schedule rotates to the next entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerSchedule {
    pub version: u32,
    pub producers: Vec<ProducerKey>,
}

impl ProducerSchedule {
    /// The producer that owns `slot`.
    pub fn scheduled_producer(&self, slot: u64, repetitions: u32) -> &ProducerKey {
        let reps = repetitions as u64;
        let index = (slot % (self.producers.len() as u64 * reps)) / reps;
        &self.producers[index as usize]
    }

    pub fn position_of(&self, name: &AccountName) -> Option<usize> {
        self.producers.iter().position(|p| &p.producer_name == name)
    }

    pub fn contains(&self, name: &AccountName) -> bool {
        self.position_of(name).is_some()
    }

    pub fn key_of(&self, name: &AccountName) -> Option<&PublicKey> {
        self.producers.iter().find(|p| &p.producer_name == name).map(|p| &p.signing_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PrivateKey;

    fn schedule(names: &[&str]) -> ProducerSchedule {
        let producers = names
            .iter()
            .map(|name| ProducerKey {
                producer_name: name.parse().unwrap(),
                signing_key: PrivateKey::from_seed(name).public_key(),
            })
            .collect();
        ProducerSchedule { version: 1, producers }
    }

    #[test]
    fn round_robin_by_repetitions() {
        let schedule = schedule(&["alice", "bob", "carol"]);

        assert_eq!(schedule.scheduled_producer(0, 2).producer_name.as_str(), "alice");
        assert_eq!(schedule.scheduled_producer(1, 2).producer_name.as_str(), "alice");
        assert_eq!(schedule.scheduled_producer(2, 2).producer_name.as_str(), "bob");
        assert_eq!(schedule.scheduled_producer(5, 2).producer_name.as_str(), "carol");
        // wraps around after a full rotation
        assert_eq!(schedule.scheduled_producer(6, 2).producer_name.as_str(), "alice");
    }

    #[test]
    fn membership_queries() {
        let schedule = schedule(&["alice", "bob"]);
        assert!(schedule.contains(&"bob".parse().unwrap()));
        assert!(!schedule.contains(&"carol".parse().unwrap()));
        assert_eq!(schedule.position_of(&"bob".parse().unwrap()), Some(1));
    }
}
