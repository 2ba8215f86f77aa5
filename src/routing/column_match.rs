// ABOUTME: Column-match routing: `COLUMN=value` style clauses over captured row values
// ABOUTME: Clauses are OR-ed; node tokens compare the column against each candidate node

use std::collections::BTreeSet;

use change_log::Change;

use crate::error::{Result, RouteError};
use crate::model::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

/// The operator appearing first in a clause wins.
const OPERATORS: [(&str, Operator); 4] = [
    ("!=", Operator::NotEquals),
    ("=", Operator::Equals),
    (" not contains ", Operator::NotContains),
    (" contains ", Operator::Contains),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeToken {
    NodeId,
    ExternalId,
    NodeGroupId,
}

impl NodeToken {
    fn of(self, node: &Node) -> &str {
        match self {
            NodeToken::NodeId => &node.node_id,
            NodeToken::ExternalId => &node.external_id,
            NodeToken::NodeGroupId => &node.node_group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(String),
    Null,
    Node(NodeToken),
    Column(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub column: String,
    pub operator: Operator,
    pub operand: Operand,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMatch {
    clauses: Vec<Clause>,
}

impl ColumnMatch {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        for line in expression.lines() {
            for part in split_or(line)? {
                if part.trim().is_empty() {
                    continue;
                }
                clauses.push(parse_clause(&part)?);
            }
        }
        if clauses.is_empty() {
            return Err(RouteError::config("column match", "expression has no clauses"));
        }
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Union of the candidates matched by each clause.
    pub fn evaluate(&self, change: &Change, candidates: &[Node]) -> BTreeSet<String> {
        let mut matched = BTreeSet::new();
        for clause in &self.clauses {
            let value = column_value(change, &clause.column);
            match &clause.operand {
                Operand::Node(token) => {
                    for node in candidates {
                        if compare(clause.operator, value, Some(token.of(node))) {
                            matched.insert(node.node_id.clone());
                        }
                    }
                }
                operand => {
                    let target = match operand {
                        Operand::Literal(text) => Some(text.as_str()),
                        Operand::Column(other) => column_value(change, other),
                        _ => None,
                    };
                    if compare(clause.operator, value, target) {
                        matched.extend(candidates.iter().map(|n| n.node_id.clone()));
                    }
                }
            }
        }
        matched
    }
}

/// Value of a column, reading the pre-image for `OLD_` prefixed names.
fn column_value<'a>(change: &'a Change, column: &str) -> Option<&'a str> {
    if change.has_column(column) {
        return change.value(column);
    }
    match column.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("OLD_") => change.old_value(&column[4..]),
        _ => None,
    }
}

fn compare(operator: Operator, value: Option<&str>, target: Option<&str>) -> bool {
    match operator {
        Operator::Equals => value == target,
        Operator::NotEquals => value != target,
        Operator::Contains => list_contains(value, target),
        Operator::NotContains => match (value, target) {
            (Some(_), Some(_)) => !list_contains(value, target),
            _ => false,
        },
    }
}

/// Both sides must be present; a null never contains or lacks anything.
fn list_contains(value: Option<&str>, target: Option<&str>) -> bool {
    match (value, target) {
        (Some(list), Some(item)) => list.split(',').any(|entry| entry == item),
        _ => false,
    }
}

/// Splits a line on whitespace-delimited `OR`, ignoring quoted text.
fn split_or(line: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            in_quote = !in_quote;
        }
        if !in_quote && c.is_whitespace() && i + 3 < chars.len() {
            let word: String = chars[i + 1..i + 3].iter().collect();
            if word.eq_ignore_ascii_case("or") && chars[i + 3].is_whitespace() {
                parts.push(std::mem::take(&mut current));
                i += 4;
                continue;
            }
        }
        current.push(c);
        i += 1;
    }
    if in_quote {
        return Err(RouteError::config(
            "column match",
            format!("unterminated quote in '{line}'"),
        ));
    }
    parts.push(current);
    Ok(parts)
}

/// Byte offset of `needle` in `haystack` outside single quotes, case-insensitive.
fn find_unquoted(haystack: &str, needle: &str) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    let mut in_quote = false;
    for (idx, c) in haystack.char_indices() {
        if c == '\'' {
            in_quote = !in_quote;
        }
        if !in_quote && lower[idx..].starts_with(needle) {
            return Some(idx);
        }
    }
    None
}

fn parse_clause(text: &str) -> Result<Clause> {
    let (idx, symbol, operator) = OPERATORS
        .iter()
        .filter_map(|(symbol, op)| find_unquoted(text, symbol).map(|idx| (idx, *symbol, *op)))
        .min_by_key(|(idx, _, _)| *idx)
        .ok_or_else(|| {
            RouteError::config("column match", format!("no operator in clause '{}'", text.trim()))
        })?;
    let column = text[..idx].trim();
    if column.is_empty() {
        return Err(RouteError::config(
            "column match",
            format!("missing column in clause '{}'", text.trim()),
        ));
    }
    let operand = parse_operand(text[idx + symbol.len()..].trim())?;
    Ok(Clause {
        column: column.to_string(),
        operator,
        operand,
    })
}

fn parse_operand(raw: &str) -> Result<Operand> {
    if let Some(inner) = raw.strip_prefix('\'') {
        let inner = inner.strip_suffix('\'').ok_or_else(|| {
            RouteError::config("column match", format!("unterminated quote in '{raw}'"))
        })?;
        return Ok(Operand::Literal(inner.replace("''", "'")));
    }
    if raw == "NULL" {
        return Ok(Operand::Null);
    }
    if let Some(name) = raw.strip_prefix(':') {
        let token = match name.to_ascii_uppercase().as_str() {
            "NODE_ID" => Operand::Node(NodeToken::NodeId),
            "EXTERNAL_ID" => Operand::Node(NodeToken::ExternalId),
            "NODE_GROUP_ID" => Operand::Node(NodeToken::NodeGroupId),
            _ if name.is_empty() => {
                return Err(RouteError::config("column match", "empty ':' reference"))
            }
            _ => Operand::Column(name.to_string()),
        };
        return Ok(token);
    }
    Ok(Operand::Literal(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_support::{change_with, nodes};

    #[test]
    fn test_or_clauses_union() {
        let matcher = ColumnMatch::parse("STATUS=ACTIVE OR STATUS=PENDING").unwrap();
        assert_eq!(matcher.clauses().len(), 2);
        let candidates = nodes();
        let active = change_with(&[("status", Some("ACTIVE"))]);
        assert_eq!(matcher.evaluate(&active, &candidates).len(), candidates.len());
        let closed = change_with(&[("status", Some("CLOSED"))]);
        assert!(matcher.evaluate(&closed, &candidates).is_empty());
    }

    #[test]
    fn test_newline_separated_and_quoted_values() {
        let matcher = ColumnMatch::parse("name='O''Brien or Sons'\nstatus != 'X'").unwrap();
        assert_eq!(
            matcher.clauses()[0].operand,
            Operand::Literal("O'Brien or Sons".into())
        );
        assert_eq!(matcher.clauses()[1].operator, Operator::NotEquals);
    }

    #[test]
    fn test_node_tokens_select_matching_candidates() {
        let matcher = ColumnMatch::parse("STORE_ID=:EXTERNAL_ID").unwrap();
        let change = change_with(&[("store_id", Some("002"))]);
        let matched = matcher.evaluate(&change, &nodes());
        assert_eq!(matched.into_iter().collect::<Vec<_>>(), vec!["store-002".to_string()]);
    }

    #[test]
    fn test_contains_checks_comma_list() {
        let matcher = ColumnMatch::parse("REGIONS contains east").unwrap();
        let yes = change_with(&[("regions", Some("west,east"))]);
        let no = change_with(&[("regions", Some("eastern"))]);
        assert!(!matcher.evaluate(&yes, &nodes()).is_empty());
        assert!(matcher.evaluate(&no, &nodes()).is_empty());

        let negated = ColumnMatch::parse("REGIONS not contains east").unwrap();
        assert!(negated.evaluate(&yes, &nodes()).is_empty());
        assert_eq!(negated.clauses()[0].operator, Operator::NotContains);
    }

    #[test]
    fn test_null_and_column_operands() {
        let matcher = ColumnMatch::parse("REGION=NULL").unwrap();
        let change = change_with(&[("region", None), ("status", Some("A"))]);
        assert!(!matcher.evaluate(&change, &nodes()).is_empty());

        let same = ColumnMatch::parse("STATUS=:STATUS").unwrap();
        assert!(!same.evaluate(&change, &nodes()).is_empty());
    }

    #[test]
    fn test_not_contains_skips_null_column() {
        let negated = ColumnMatch::parse("REGIONS not contains east").unwrap();
        let missing = change_with(&[("regions", None)]);
        assert!(negated.evaluate(&missing, &nodes()).is_empty());
        let other = change_with(&[("regions", Some("west"))]);
        assert_eq!(negated.evaluate(&other, &nodes()).len(), nodes().len());
    }

    #[test]
    fn test_earliest_operator_splits_clause() {
        let matcher = ColumnMatch::parse("REGIONS not contains B=C").unwrap();
        let clause = &matcher.clauses()[0];
        assert_eq!(clause.operator, Operator::NotContains);
        assert_eq!(clause.operand, Operand::Literal("B=C".into()));

        let matcher = ColumnMatch::parse("NOTE=a contains b").unwrap();
        assert_eq!(matcher.clauses()[0].operator, Operator::Equals);
        assert_eq!(
            matcher.clauses()[0].operand,
            Operand::Literal("a contains b".into())
        );
    }

    #[test]
    fn test_lowercase_null_is_a_literal() {
        let matcher = ColumnMatch::parse("REGION=null").unwrap();
        assert_eq!(matcher.clauses()[0].operand, Operand::Literal("null".into()));
        let missing = change_with(&[("region", None)]);
        assert!(matcher.evaluate(&missing, &nodes()).is_empty());
        let spelled = change_with(&[("region", Some("null"))]);
        assert!(!matcher.evaluate(&spelled, &nodes()).is_empty());
    }

    #[test]
    fn test_old_prefix_reads_pre_image() {
        let matcher = ColumnMatch::parse("OLD_STATUS=PENDING").unwrap();
        let mut change = change_with(&[("status", Some("ACTIVE"))]);
        change.old_data = Some(vec![Some("PENDING".into())]);
        assert!(!matcher.evaluate(&change, &nodes()).is_empty());
    }

    #[test]
    fn test_unparsable_expressions_are_config_errors() {
        for bad in ["STATUS", "=ACTIVE", "STATUS='open", ""] {
            let err = ColumnMatch::parse(bad).unwrap_err();
            assert_eq!(err.category(), crate::error::ErrorCategory::Configuration, "{bad}");
        }
    }
}
