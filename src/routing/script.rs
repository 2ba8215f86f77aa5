// ABOUTME: Script routing: a sandboxed SQL-style expression evaluated per captured row
// ABOUTME: Parsed once with sqlparser into a small expression tree, no host access

use std::cmp::Ordering;
use std::collections::BTreeSet;

use change_log::Change;
use sqlparser::ast as sql_ast;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use crate::error::{Result, RouteError};
use crate::model::Node;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Text(String),
    List(Vec<Value>),
}

impl Value {
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn into_text(self) -> Option<String> {
        match self {
            Value::Text(s) => Some(s),
            Value::Num(n) => Some(format_number(n)),
            Value::Bool(b) => Some(b.to_string()),
            Value::Null | Value::List(_) => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Plus,
    Minus,
    Concat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Upper,
    Lower,
    Coalesce,
    RouteTo,
    ExternalNodes,
}

#[derive(Debug, Clone, PartialEq)]
enum ScriptExpr {
    Literal(Value),
    Binding(String),
    Not(Box<ScriptExpr>),
    Negate(Box<ScriptExpr>),
    Binary(Box<ScriptExpr>, BinOp, Box<ScriptExpr>),
    IsNull(Box<ScriptExpr>, bool),
    InList {
        expr: Box<ScriptExpr>,
        list: Vec<ScriptExpr>,
        negated: bool,
    },
    List(Vec<ScriptExpr>),
    Call(Function, Vec<ScriptExpr>),
}

/// What a script can see while it runs.
pub struct ScriptScope<'a> {
    pub change: &'a Change,
    pub candidates: &'a [Node],
    pub identity: &'a Node,
    pub channel_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    root: ScriptExpr,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self> {
        let dialect = GenericDialect {};
        let syntax = |e: sqlparser::parser::ParserError| {
            RouteError::config("script", format!("cannot parse '{source}': {e}"))
        };
        let mut parser = Parser::new(&dialect).try_with_sql(source).map_err(syntax)?;
        let expr = parser.parse_expr().map_err(syntax)?;
        if parser.peek_token().token != Token::EOF {
            return Err(RouteError::config(
                "script",
                format!("unexpected trailing input in '{source}'"),
            ));
        }
        Ok(Self {
            root: convert(expr)?,
        })
    }

    /// Candidate node ids selected by the script.
    pub fn evaluate(&self, scope: &ScriptScope<'_>) -> Result<BTreeSet<String>> {
        let value = eval(&self.root, scope)?;
        let mut wanted = BTreeSet::new();
        match value {
            Value::Bool(true) => {
                return Ok(scope.candidates.iter().map(|n| n.node_id.clone()).collect())
            }
            Value::Bool(false) | Value::Null => return Ok(wanted),
            Value::Num(n) => {
                return Err(RouteError::Evaluation(format!(
                    "script returned number {n}, expected node ids or a boolean"
                )))
            }
            Value::Text(ids) => {
                wanted.extend(ids.split(',').map(|s| s.trim().to_string()));
            }
            Value::List(items) => collect_ids(items, &mut wanted),
        }
        Ok(scope
            .candidates
            .iter()
            .filter(|n| wanted.contains(&n.node_id))
            .map(|n| n.node_id.clone())
            .collect())
    }
}

fn collect_ids(items: Vec<Value>, out: &mut BTreeSet<String>) {
    for item in items {
        match item {
            Value::List(nested) => collect_ids(nested, out),
            other => {
                if let Some(id) = other.into_text() {
                    out.insert(id);
                }
            }
        }
    }
}

fn unsupported(what: impl std::fmt::Display) -> RouteError {
    RouteError::config("script", format!("unsupported construct: {what}"))
}

fn convert(expr: sql_ast::Expr) -> Result<ScriptExpr> {
    use sql_ast::{BinaryOperator as B, Expr, UnaryOperator as U};
    Ok(match expr {
        Expr::Identifier(ident) => ScriptExpr::Binding(ident.value.to_ascii_uppercase()),
        Expr::Value(value) => ScriptExpr::Literal(convert_value(&value.value)?),
        Expr::Nested(inner) => convert(*inner)?,
        Expr::UnaryOp { op, expr } => match op {
            U::Not => ScriptExpr::Not(Box::new(convert(*expr)?)),
            U::Minus => ScriptExpr::Negate(Box::new(convert(*expr)?)),
            U::Plus => convert(*expr)?,
            other => return Err(unsupported(other)),
        },
        Expr::BinaryOp { left, op, right } => {
            let op = match op {
                B::Eq => BinOp::Eq,
                B::NotEq => BinOp::NotEq,
                B::Lt => BinOp::Lt,
                B::LtEq => BinOp::LtEq,
                B::Gt => BinOp::Gt,
                B::GtEq => BinOp::GtEq,
                B::And => BinOp::And,
                B::Or => BinOp::Or,
                B::Plus => BinOp::Plus,
                B::Minus => BinOp::Minus,
                B::StringConcat => BinOp::Concat,
                other => return Err(unsupported(other)),
            };
            ScriptExpr::Binary(Box::new(convert(*left)?), op, Box::new(convert(*right)?))
        }
        Expr::IsNull(inner) => ScriptExpr::IsNull(Box::new(convert(*inner)?), false),
        Expr::IsNotNull(inner) => ScriptExpr::IsNull(Box::new(convert(*inner)?), true),
        Expr::InList {
            expr,
            list,
            negated,
        } => ScriptExpr::InList {
            expr: Box::new(convert(*expr)?),
            list: list.into_iter().map(convert).collect::<Result<_>>()?,
            negated,
        },
        Expr::Tuple(items) => {
            ScriptExpr::List(items.into_iter().map(convert).collect::<Result<_>>()?)
        }
        Expr::Function(func) => {
            let name = func.name.to_string().to_ascii_uppercase();
            let function = match name.as_str() {
                "UPPER" => Function::Upper,
                "LOWER" => Function::Lower,
                "COALESCE" => Function::Coalesce,
                "ROUTE_TO" => Function::RouteTo,
                "EXTERNAL_NODES" => Function::ExternalNodes,
                _ => return Err(unsupported(format!("function {name}"))),
            };
            let args = match func.args {
                sql_ast::FunctionArguments::List(list) => list
                    .args
                    .into_iter()
                    .map(|arg| match arg {
                        sql_ast::FunctionArg::Unnamed(sql_ast::FunctionArgExpr::Expr(e)) => {
                            convert(e)
                        }
                        other => Err(unsupported(other)),
                    })
                    .collect::<Result<Vec<_>>>()?,
                sql_ast::FunctionArguments::None => Vec::new(),
                other => return Err(unsupported(other)),
            };
            let arity_ok = match function {
                Function::Upper | Function::Lower | Function::ExternalNodes => args.len() == 1,
                Function::Coalesce | Function::RouteTo => !args.is_empty(),
            };
            if !arity_ok {
                return Err(RouteError::config(
                    "script",
                    format!("wrong number of arguments to {name}"),
                ));
            }
            ScriptExpr::Call(function, args)
        }
        other => return Err(unsupported(other)),
    })
}

fn convert_value(value: &sql_ast::Value) -> Result<Value> {
    use sql_ast::Value as V;
    Ok(match value {
        V::Number(n, _) => Value::Num(
            n.parse()
                .map_err(|_| RouteError::config("script", format!("invalid number {n}")))?,
        ),
        V::SingleQuotedString(s) | V::DoubleQuotedString(s) => Value::Text(s.clone()),
        V::Boolean(b) => Value::Bool(*b),
        V::Null => Value::Null,
        other => return Err(unsupported(other)),
    })
}

fn text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |s| Value::Text(s.to_string()))
}

fn lookup(name: &str, scope: &ScriptScope<'_>) -> Result<Value> {
    match name {
        "NODES" => {
            return Ok(Value::List(
                scope
                    .candidates
                    .iter()
                    .map(|n| Value::Text(n.node_id.clone()))
                    .collect(),
            ))
        }
        "IDENTITY_NODE" => return Ok(Value::Text(scope.identity.node_id.clone())),
        "CHANNEL" => return Ok(Value::Text(scope.channel_id.to_string())),
        "SOURCE_NODE" => return Ok(text(scope.change.source_node_id.as_deref())),
        "EVENT_TYPE" => return Ok(Value::Text(scope.change.event_type.code().to_string())),
        _ => {}
    }
    if scope.change.has_column(name) {
        return Ok(text(scope.change.value(name)));
    }
    if let Some(column) = name.strip_prefix("OLD_") {
        if scope.change.has_column(column) {
            return Ok(text(scope.change.old_value(column)));
        }
    }
    Err(RouteError::Evaluation(format!(
        "unknown name {name} for table {}",
        scope.change.table.table_name()
    )))
}

fn truth(value: &Value) -> Result<Option<bool>> {
    match value {
        Value::Bool(b) => Ok(Some(*b)),
        Value::Null => Ok(None),
        other => Err(RouteError::Evaluation(format!(
            "expected a boolean, got {other:?}"
        ))),
    }
}

fn compare(left: &Value, right: &Value) -> Result<Option<Ordering>> {
    Ok(match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                return Err(RouteError::Evaluation(format!(
                    "cannot compare {a:?} with {b:?}"
                )))
            }
        },
    })
}

fn eval(expr: &ScriptExpr, scope: &ScriptScope<'_>) -> Result<Value> {
    Ok(match expr {
        ScriptExpr::Literal(v) => v.clone(),
        ScriptExpr::Binding(name) => lookup(name, scope)?,
        ScriptExpr::Not(inner) => match truth(&eval(inner, scope)?)? {
            Some(b) => Value::Bool(!b),
            None => Value::Null,
        },
        ScriptExpr::Negate(inner) => match eval(inner, scope)? {
            Value::Null => Value::Null,
            v => Value::Num(-v.as_number().ok_or_else(|| {
                RouteError::Evaluation(format!("cannot negate {v:?}"))
            })?),
        },
        ScriptExpr::Binary(left, op, right) => eval_binary(left, *op, right, scope)?,
        ScriptExpr::IsNull(inner, negated) => {
            let is_null = eval(inner, scope)? == Value::Null;
            Value::Bool(is_null != *negated)
        }
        ScriptExpr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval(expr, scope)?;
            if needle == Value::Null {
                return Ok(Value::Null);
            }
            let mut found = false;
            for item in list {
                if compare(&needle, &eval(item, scope)?)? == Some(Ordering::Equal) {
                    found = true;
                    break;
                }
            }
            Value::Bool(found != *negated)
        }
        ScriptExpr::List(items) => Value::List(
            items
                .iter()
                .map(|e| eval(e, scope))
                .collect::<Result<Vec<_>>>()?,
        ),
        ScriptExpr::Call(function, args) => call(*function, args, scope)?,
    })
}

fn eval_binary(
    left: &ScriptExpr,
    op: BinOp,
    right: &ScriptExpr,
    scope: &ScriptScope<'_>,
) -> Result<Value> {
    if matches!(op, BinOp::And | BinOp::Or) {
        let l = truth(&eval(left, scope)?)?;
        // short circuit
        match (op, l) {
            (BinOp::And, Some(false)) => return Ok(Value::Bool(false)),
            (BinOp::Or, Some(true)) => return Ok(Value::Bool(true)),
            _ => {}
        }
        let r = truth(&eval(right, scope)?)?;
        return Ok(match (op, l, r) {
            (BinOp::And, _, Some(false)) => Value::Bool(false),
            (BinOp::Or, _, Some(true)) => Value::Bool(true),
            (_, Some(a), Some(b)) => Value::Bool(if op == BinOp::And { a && b } else { a || b }),
            _ => Value::Null,
        });
    }

    let l = eval(left, scope)?;
    let r = eval(right, scope)?;
    Ok(match op {
        BinOp::Concat => match (l.into_text(), r.into_text()) {
            (Some(a), Some(b)) => Value::Text(a + &b),
            _ => Value::Null,
        },
        BinOp::Plus | BinOp::Minus => {
            if l == Value::Null || r == Value::Null {
                return Ok(Value::Null);
            }
            match (l.as_number(), r.as_number()) {
                (Some(a), Some(b)) => Value::Num(if op == BinOp::Plus { a + b } else { a - b }),
                _ => {
                    return Err(RouteError::Evaluation(format!(
                        "arithmetic on non-numbers {l:?} and {r:?}"
                    )))
                }
            }
        }
        _ => match compare(&l, &r)? {
            None => Value::Null,
            Some(ord) => Value::Bool(match op {
                BinOp::Eq => ord == Ordering::Equal,
                BinOp::NotEq => ord != Ordering::Equal,
                BinOp::Lt => ord == Ordering::Less,
                BinOp::LtEq => ord != Ordering::Greater,
                BinOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }),
        },
    })
}

fn call(function: Function, args: &[ScriptExpr], scope: &ScriptScope<'_>) -> Result<Value> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval(arg, scope)?);
    }
    Ok(match function {
        Function::Upper | Function::Lower => match values.pop() {
            Some(Value::Text(s)) if function == Function::Upper => Value::Text(s.to_uppercase()),
            Some(Value::Text(s)) => Value::Text(s.to_lowercase()),
            Some(Value::Null) | None => Value::Null,
            Some(other) => {
                return Err(RouteError::Evaluation(format!(
                    "expected text, got {other:?}"
                )))
            }
        },
        Function::Coalesce => values
            .into_iter()
            .find(|v| *v != Value::Null)
            .unwrap_or(Value::Null),
        Function::RouteTo => {
            let mut ids = BTreeSet::new();
            collect_ids(values, &mut ids);
            Value::List(ids.into_iter().map(Value::Text).collect())
        }
        Function::ExternalNodes => {
            let mut externals = BTreeSet::new();
            collect_ids(values, &mut externals);
            Value::List(
                scope
                    .candidates
                    .iter()
                    .filter(|n| externals.contains(&n.external_id))
                    .map(|n| Value::Text(n.node_id.clone()))
                    .collect(),
            )
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::test_support::{change_with, identity, nodes};

    fn run(source: &str, change: &Change) -> Result<Vec<String>> {
        let script = Script::parse(source)?;
        let candidates = nodes();
        let me = identity();
        let scope = ScriptScope {
            change,
            candidates: &candidates,
            identity: &me,
            channel_id: "sale",
        };
        Ok(script.evaluate(&scope)?.into_iter().collect())
    }

    #[test]
    fn test_boolean_selects_all_or_nothing() {
        let change = change_with(&[("status", Some("ACTIVE")), ("amount", Some("150"))]);
        assert_eq!(run("STATUS = 'ACTIVE' AND AMOUNT > 100", &change).unwrap().len(), 3);
        assert!(run("STATUS = 'CLOSED'", &change).unwrap().is_empty());
        assert!(run("NOT (AMOUNT >= 100)", &change).unwrap().is_empty());
    }

    #[test]
    fn test_route_to_and_external_nodes() {
        let change = change_with(&[("store", Some("002"))]);
        assert_eq!(
            run("ROUTE_TO('store-001', 'unknown')", &change).unwrap(),
            vec!["store-001".to_string()]
        );
        assert_eq!(
            run("EXTERNAL_NODES(STORE)", &change).unwrap(),
            vec!["store-002".to_string()]
        );
        assert_eq!(
            run("'store-003,' || 'store-001'", &change).unwrap(),
            vec!["store-001".to_string(), "store-003".to_string()]
        );
    }

    #[test]
    fn test_null_routes_nowhere() {
        let change = change_with(&[("region", None)]);
        assert!(run("REGION = 'east'", &change).unwrap().is_empty());
        assert!(run("NULL", &change).unwrap().is_empty());
        assert_eq!(run("REGION IS NULL", &change).unwrap().len(), 3);
        assert_eq!(
            run("COALESCE(REGION, 'store-002')", &change).unwrap(),
            vec!["store-002".to_string()]
        );
    }

    #[test]
    fn test_in_list_and_bindings() {
        let change = change_with(&[("status", Some("pending"))]);
        assert_eq!(run("UPPER(STATUS) IN ('ACTIVE', 'PENDING')", &change).unwrap().len(), 3);
        assert!(run("CHANNEL <> 'sale'", &change).unwrap().is_empty());
        assert_eq!(run("NODES", &change).unwrap().len(), 3);
    }

    #[test]
    fn test_parse_errors_are_configuration() {
        for bad in ["STATUS = ", "SLEEP(10)", "STATUS LIKE 'A%'", "1 +", "A = 1 B"] {
            let err = Script::parse(bad).unwrap_err();
            assert_eq!(err.category(), crate::error::ErrorCategory::Configuration, "{bad}");
        }
    }

    #[test]
    fn test_runtime_failures_are_evaluation_errors() {
        let change = change_with(&[("status", Some("A"))]);
        let err = run("MISSING = 1", &change).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Evaluation);
        let err = run("1 + 2", &change).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Evaluation);
    }
}
