use std::collections::BTreeSet;

use change_log::Change;

use super::column_match::ColumnMatch;
use super::context::RouterContext;
use super::lookup_table::LookupTableSettings;
use super::script::{Script, ScriptScope};
use crate::error::{Result, RouteError};
use crate::model::{Node, RoutingRule};

/// A routing strategy compiled from a rule's type and expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Every candidate node.
    Default,
    ColumnMatch(ColumnMatch),
    LookupTable(LookupTableSettings),
    Script(Script),
}

impl Strategy {
    pub fn compile(rule: &RoutingRule) -> Result<Self> {
        let context = format!("router {}", rule.router_id);
        let expression = || {
            rule.expression
                .as_deref()
                .filter(|e| !e.trim().is_empty())
                .ok_or_else(|| RouteError::config(&context, "expression is required"))
        };
        let wrap = |err: RouteError| match err {
            RouteError::Configuration { message, .. } => RouteError::config(&context, message),
            other => other,
        };
        match rule.router_type.trim().to_ascii_lowercase().as_str() {
            "default" | "" => Ok(Strategy::Default),
            "column_match" | "column" => Ok(Strategy::ColumnMatch(
                ColumnMatch::parse(expression()?).map_err(wrap)?,
            )),
            "lookup_table" | "lookuptable" => Ok(Strategy::LookupTable(
                LookupTableSettings::parse(expression()?).map_err(wrap)?,
            )),
            "script" => Ok(Strategy::Script(Script::parse(expression()?).map_err(wrap)?)),
            other => Err(RouteError::config(
                &context,
                format!("unknown router type '{other}'"),
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::Default => "default",
            Strategy::ColumnMatch(_) => "column_match",
            Strategy::LookupTable(_) => "lookup_table",
            Strategy::Script(_) => "script",
        }
    }

    /// Node ids among `candidates` that should receive the change.
    pub fn evaluate(
        &self,
        change: &Change,
        candidates: &[Node],
        ctx: &mut RouterContext,
    ) -> Result<BTreeSet<String>> {
        match self {
            Strategy::Default => Ok(candidates.iter().map(|n| n.node_id.clone()).collect()),
            Strategy::ColumnMatch(matcher) => Ok(matcher.evaluate(change, candidates)),
            Strategy::LookupTable(settings) => {
                let snapshot = ctx.lookup_snapshot(settings)?;
                Ok(settings.evaluate(change, candidates, &snapshot))
            }
            Strategy::Script(script) => script.evaluate(&ScriptScope {
                change,
                candidates,
                identity: &ctx.identity,
                channel_id: &ctx.channel.channel_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_by_router_type() {
        let rule = RoutingRule::new("r1", "corp", "store", "orders");
        assert_eq!(Strategy::compile(&rule).unwrap(), Strategy::Default);

        let rule = rule.with_strategy("column", "STATUS=ACTIVE");
        assert_eq!(Strategy::compile(&rule).unwrap().kind(), "column_match");
    }

    #[test]
    fn test_unknown_type_and_missing_expression() {
        let mut rule = RoutingRule::new("r2", "corp", "store", "orders");
        rule.router_type = "bsh".into();
        let err = Strategy::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("router r2"));

        rule.router_type = "script".into();
        let err = Strategy::compile(&rule).unwrap_err();
        assert!(err.to_string().contains("expression is required"));
    }
}
