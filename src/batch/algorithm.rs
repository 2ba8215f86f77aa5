use crate::model::{BatchAlgorithm, Channel};

/// Whether an open batch should be sealed after its latest row.
///
/// `at_boundary` is true when the row is the last of its transaction, which
/// is known only when the following row has a different transaction id or
/// none at all.
pub fn is_batch_complete(
    channel: &Channel,
    event_count: usize,
    byte_count: u64,
    at_boundary: bool,
) -> bool {
    let full = event_count >= channel.max_batch_size || byte_count >= channel.max_batch_bytes;
    match channel.batch_algorithm {
        BatchAlgorithm::Default => full && at_boundary,
        BatchAlgorithm::Nontransactional => full,
        BatchAlgorithm::Transactional => full || at_boundary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_waits_for_transaction_boundary() {
        let channel = Channel::new("sale", 1, 2);
        assert!(!is_batch_complete(&channel, 1, 10, true));
        assert!(!is_batch_complete(&channel, 2, 10, false));
        assert!(is_batch_complete(&channel, 3, 10, true));
    }

    #[test]
    fn test_nontransactional_seals_at_size() {
        let mut channel = Channel::new("sale", 1, 2);
        channel.batch_algorithm = BatchAlgorithm::Nontransactional;
        assert!(is_batch_complete(&channel, 2, 10, false));
        assert!(!is_batch_complete(&channel, 1, 10, true));
    }

    #[test]
    fn test_transactional_seals_each_transaction() {
        let mut channel = Channel::new("sale", 1, 100);
        channel.batch_algorithm = BatchAlgorithm::Transactional;
        assert!(is_batch_complete(&channel, 1, 10, true));
        assert!(!is_batch_complete(&channel, 5, 10, false));
    }

    #[test]
    fn test_byte_threshold() {
        let mut channel = Channel::new("sale", 1, 100);
        channel.max_batch_bytes = 64;
        assert!(is_batch_complete(&channel, 1, 64, true));
    }
}
