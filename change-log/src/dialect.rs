/// What the capture layer of a database can and cannot tell the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialectCapabilities {
    pub name: String,
    /// Whether captured rows carry the id of the source transaction.
    pub supports_transaction_id: bool,
    /// Upper bound on bind parameters in one statement.
    pub max_bind_parameters: usize,
}

impl DialectCapabilities {
    pub fn sqlite() -> Self {
        Self {
            name: "sqlite".to_string(),
            supports_transaction_id: true,
            max_bind_parameters: 999,
        }
    }

    /// Capture layer that cannot record transaction ids.
    pub fn without_transactions(mut self) -> Self {
        self.supports_transaction_id = false;
        self
    }

    /// Largest number of `BETWEEN` ranges a single query may carry.
    pub fn max_id_ranges(&self) -> usize {
        // two parameters per range plus the keyset cursor and the limit
        self.max_bind_parameters.saturating_sub(2) / 2
    }
}

impl Default for DialectCapabilities {
    fn default() -> Self {
        Self::sqlite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_budget_leaves_room_for_cursor() {
        let caps = DialectCapabilities::sqlite();
        assert_eq!(caps.max_id_ranges(), 498);
        assert!(!caps.without_transactions().supports_transaction_id);
    }
}
