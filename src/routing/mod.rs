// ABOUTME: Router engine: decides which target nodes receive each captured change
// ABOUTME: Rules are compiled once per configuration snapshot and evaluated in priority order

pub mod column_match;
pub mod context;
pub mod lookup_table;
pub mod script;
pub mod strategy;

pub use context::{RouterContext, RouterCounters};
pub use lookup_table::{LookupSnapshot, LookupSource, LookupTableSettings, SqliteLookupSource};
pub use strategy::Strategy;

use std::collections::{BTreeMap, BTreeSet};

use change_log::Change;

use crate::error::{ErrorCategory, Result, RouteError};
use crate::model::{Node, RoutingRule};

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: RoutingRule,
    pub strategy: Strategy,
}

/// Compiled routing rules of one configuration snapshot.
#[derive(Debug, Default)]
pub struct RouterSet {
    rules: Vec<CompiledRule>,
    rejected: Vec<(String, RouteError)>,
}

impl RouterSet {
    /// Compiles every rule. A rule that fails to compile is logged and left out.
    pub fn compile(rules: &[RoutingRule]) -> Self {
        let mut set = RouterSet::default();
        for rule in rules {
            match Strategy::compile(rule) {
                Ok(strategy) => set.rules.push(CompiledRule {
                    rule: rule.clone(),
                    strategy,
                }),
                Err(err) => {
                    tracing::error!(
                        router = %rule.router_id,
                        error = %err,
                        "Excluding router with invalid configuration"
                    );
                    set.rejected.push((rule.router_id.clone(), err));
                }
            }
        }
        set.rules.sort_by(|a, b| {
            a.rule
                .priority
                .cmp(&b.rule.priority)
                .then_with(|| a.rule.router_id.cmp(&b.rule.router_id))
        });
        set
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// Routers excluded at compile time, with the reason.
    pub fn rejected(&self) -> &[(String, RouteError)] {
        &self.rejected
    }

    /// Union of the targets of every applicable rule. Empty means route to nobody.
    pub fn route(&self, change: &Change, ctx: &mut RouterContext) -> Result<BTreeSet<String>> {
        Ok(self.route_targets(change, ctx)?.into_keys().collect())
    }

    /// Targets keyed by node id, each with the first rule (in evaluation order)
    /// that selected it.
    ///
    /// Evaluation failures count against the rule and route nowhere for it;
    /// anything else (a lookup source going away) fails the pass.
    pub fn route_targets(
        &self,
        change: &Change,
        ctx: &mut RouterContext,
    ) -> Result<BTreeMap<String, String>> {
        let mut targets = BTreeMap::new();
        for compiled in &self.rules {
            let rule = &compiled.rule;
            if rule.source_node_group != ctx.identity.node_group
                || !rule.applies_to_table(change.table.table_name())
                || !rule.syncs(change.event_type)
            {
                continue;
            }
            let candidates = ctx.candidates(rule);
            let candidates: Vec<Node> = candidates
                .iter()
                .filter(|n| {
                    rule.ping_back_enabled
                        || change.source_node_id.as_deref() != Some(n.node_id.as_str())
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }
            match compiled.strategy.evaluate(change, &candidates, ctx) {
                Ok(ids) => {
                    for id in ids {
                        targets.entry(id).or_insert_with(|| rule.router_id.clone());
                    }
                }
                Err(err) if err.category() == ErrorCategory::Evaluation => {
                    ctx.counters.evaluation_errors += 1;
                    tracing::warn!(
                        router = %rule.router_id,
                        channel = %ctx.channel.channel_id,
                        sequence_id = change.sequence_id,
                        error = %err,
                        "Routing rule failed for row; routing it nowhere for this rule"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(targets)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use change_log::{Change, EventType, TableDef, TableRef};
    use chrono::Utc;

    use crate::model::Node;

    pub fn node(id: &str, group: &str, external: &str) -> Node {
        Node {
            node_id: id.to_string(),
            node_group: group.to_string(),
            external_id: external.to_string(),
            enabled: true,
        }
    }

    pub fn identity() -> Node {
        node("corp-000", "corp", "000")
    }

    pub fn nodes() -> Vec<Node> {
        vec![
            node("store-001", "store", "001"),
            node("store-002", "store", "002"),
            node("store-003", "store", "003"),
        ]
    }

    /// An insert into `orders` with the given columns.
    pub fn change_with(columns: &[(&str, Option<&str>)]) -> Change {
        let names: Vec<&str> = columns.iter().map(|(n, _)| *n).collect();
        Change {
            sequence_id: 1,
            table: Arc::new(TableRef {
                trigger_hist_id: 1,
                def: TableDef::new("orders", &names, &[]),
            }),
            event_type: EventType::Insert,
            row_data: Some(columns.iter().map(|(_, v)| v.map(str::to_string)).collect()),
            old_data: None,
            pk_data: None,
            channel_id: "sale".to_string(),
            transaction_id: None,
            source_node_id: None,
            captured_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::test_support::*;
    use super::*;
    use crate::model::Channel;

    struct FixedLookup(Result<LookupSnapshot, String>);

    impl LookupSource for FixedLookup {
        fn load(&self, _table: &LookupTableSettings) -> Result<LookupSnapshot> {
            self.0.clone().map_err(RouteError::Transient)
        }
    }

    fn context(lookup: FixedLookup) -> RouterContext {
        let mut all = nodes();
        all.push(identity());
        all.push(node("corp-001", "corp", "C1"));
        RouterContext::new(
            Channel::new("sale", 1, 100),
            identity(),
            Arc::new(all),
            Arc::new(lookup),
        )
    }

    fn lookup_ok() -> FixedLookup {
        let mut map = HashMap::new();
        map.insert("east".to_string(), vec!["002".to_string()]);
        FixedLookup(Ok(map))
    }

    fn sorted(set: BTreeSet<String>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn test_rules_union_without_duplicates() {
        let rules = vec![
            RoutingRule::new("all", "corp", "store", "orders"),
            RoutingRule::new("active", "corp", "store", "orders")
                .with_strategy("column_match", "STATUS=ACTIVE"),
        ];
        let set = RouterSet::compile(&rules);
        let mut ctx = context(lookup_ok());
        let change = change_with(&[("status", Some("ACTIVE"))]);
        assert_eq!(set.route(&change, &mut ctx).unwrap().len(), 3);
    }

    #[test]
    fn test_invalid_rule_excluded_others_evaluated() {
        let rules = vec![
            RoutingRule::new("broken", "corp", "store", "orders")
                .with_strategy("lookup_table", "KEY_COLUMN=REGION"),
            RoutingRule::new("by_status", "corp", "store", "orders")
                .with_strategy("column_match", "STATUS=ACTIVE"),
        ];
        let set = RouterSet::compile(&rules);
        assert_eq!(set.rules().len(), 1);
        assert_eq!(set.rejected()[0].0, "broken");
        let mut ctx = context(lookup_ok());
        let change = change_with(&[("status", Some("ACTIVE"))]);
        assert_eq!(set.route(&change, &mut ctx).unwrap().len(), 3);
    }

    #[test]
    fn test_never_routes_to_self_or_back_to_source() {
        let rules = vec![RoutingRule::new("to_corp", "corp", "corp", "orders")];
        let set = RouterSet::compile(&rules);
        let mut ctx = context(lookup_ok());
        let mut change = change_with(&[("status", Some("A"))]);
        assert_eq!(sorted(set.route(&change, &mut ctx).unwrap()), vec!["corp-001"]);

        change.source_node_id = Some("corp-001".into());
        assert!(set.route(&change, &mut ctx).unwrap().is_empty());

        let mut ping_back = RoutingRule::new("to_corp", "corp", "corp", "orders");
        ping_back.ping_back_enabled = true;
        let set = RouterSet::compile(&[ping_back]);
        assert_eq!(sorted(set.route(&change, &mut ctx).unwrap()), vec!["corp-001"]);
    }

    #[test]
    fn test_rule_filters_by_group_table_and_event() {
        let mut rule = RoutingRule::new("r", "store", "corp", "orders");
        let set = RouterSet::compile(&[rule.clone()]);
        let mut ctx = context(lookup_ok());
        let change = change_with(&[("status", Some("A"))]);
        assert!(set.route(&change, &mut ctx).unwrap().is_empty());

        rule.source_node_group = "corp".into();
        rule.target_node_group = "store".into();
        rule.sync_on_insert = false;
        let set = RouterSet::compile(&[rule.clone()]);
        assert!(set.route(&change, &mut ctx).unwrap().is_empty());

        rule.sync_on_insert = true;
        rule.source_table = "customers".into();
        let set = RouterSet::compile(&[rule]);
        assert!(set.route(&change, &mut ctx).unwrap().is_empty());
    }

    #[test]
    fn test_evaluation_error_routes_nowhere_and_counts() {
        let rules = vec![
            RoutingRule::new("bad_script", "corp", "store", "orders")
                .with_strategy("script", "UNKNOWN_COLUMN = 'x'"),
            RoutingRule::new("lookup", "corp", "store", "orders").with_strategy(
                "lookup_table",
                "LOOKUP_TABLE=regions\nKEY_COLUMN=REGION\nLOOKUP_KEY_COLUMN=region\nEXTERNAL_ID_COLUMN=store",
            ),
        ];
        let set = RouterSet::compile(&rules);
        let mut ctx = context(lookup_ok());
        let change = change_with(&[("region", Some("east"))]);
        let routed = set.route(&change, &mut ctx).unwrap();
        assert_eq!(sorted(routed), vec!["store-002"]);
        assert_eq!(ctx.counters.evaluation_errors, 1);
    }

    #[test]
    fn test_lookup_outage_fails_the_pass() {
        let rules = vec![RoutingRule::new("lookup", "corp", "store", "orders").with_strategy(
            "lookup_table",
            "LOOKUP_TABLE=regions\nKEY_COLUMN=REGION\nLOOKUP_KEY_COLUMN=region\nEXTERNAL_ID_COLUMN=store",
        )];
        let set = RouterSet::compile(&rules);
        let mut ctx = context(FixedLookup(Err("database is locked".into())));
        let change = change_with(&[("region", Some("east"))]);
        let err = set.route(&change, &mut ctx).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_targets_remember_first_rule() {
        let rules = vec![
            RoutingRule::new("z_all", "corp", "store", "orders"),
            RoutingRule::new("a_active", "corp", "store", "orders")
                .with_strategy("column_match", "STATUS=ACTIVE"),
        ];
        let set = RouterSet::compile(&rules);
        let mut ctx = context(lookup_ok());
        let change = change_with(&[("status", Some("ACTIVE"))]);
        let targets = set.route_targets(&change, &mut ctx).unwrap();
        assert_eq!(targets.len(), 3);
        assert!(targets.values().all(|router| router == "a_active"));
    }

    #[test]
    fn test_routing_is_deterministic() {
        let rules = vec![RoutingRule::new("s", "corp", "store", "orders")
            .with_strategy("script", "ROUTE_TO(UPPER(STATUS) || '', 'store-003')")];
        let set = RouterSet::compile(&rules);
        let change = change_with(&[("status", Some("store-001"))]);
        let first = set.route(&change, &mut context(lookup_ok())).unwrap();
        let second = set.route(&change, &mut context(lookup_ok())).unwrap();
        assert_eq!(first, second);
        assert_eq!(sorted(first), vec!["store-003"]);
    }
}
