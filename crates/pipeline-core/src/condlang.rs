//! Condition language (C1) — tokenizer, parser, and evaluator for transition `when`
//! expressions.
//!
//! ```text
//! expr   = or
//! or     = and ("||" and)*
//! and    = cmp ("&&" cmp)*
//! cmp    = primary ( ("=="|"!="|">"|">="|"<"|"<="|"in") primary )*
//! primary= literal | path | "(" expr ")"
//! path   = IDENT ("." IDENT)*
//! literal= NUMBER | STRING | "true" | "false" | "null"
//! ```
//!
//! Compilation (tokenize + parse) can fail; a compiled expression's evaluation never can.

use crate::error::{Error, Result};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Cmp { operands: Vec<Expr>, ops: Vec<CmpOp> },
    Path(Vec<String>),
    Lit(Value),
}

/// A `when` expression, compiled once at plan-load time.
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    expr: Expr,
    source: String,
}

impl CompiledExpr {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Total: always returns a bool, never performs I/O, never panics.
    pub fn evaluate(&self, scope: &Value) -> bool {
        eval_bool(&self.expr, scope)
    }
}

pub fn compile(source: &str) -> Result<CompiledExpr> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(Error::ConditionCompile(format!(
            "unexpected trailing tokens in `{source}`"
        )));
    }
    Ok(CompiledExpr {
        expr,
        source: source.to_string(),
    })
}

// ---- tokenizer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Or,
    And,
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    In,
    LParen,
    RParen,
    Dot,
    True,
    False,
    Null,
    Ident(String),
    Number(Value),
    Str(String),
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' && i + 1 < chars.len() {
                        let next = chars[i + 1];
                        s.push(match next {
                            'n' => '\n',
                            't' => '\t',
                            '\\' => '\\',
                            '\'' => '\'',
                            '"' => '"',
                            other => other,
                        });
                        i += 2;
                        continue;
                    }
                    if ch == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(ch);
                    i += 1;
                }
                if !closed {
                    return Err(Error::ConditionCompile(format!(
                        "unterminated string literal in `{src}`"
                    )));
                }
                tokens.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i < chars.len() && chars[i] == '.' && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let number = if text.contains('.') {
                    serde_json::Number::from_f64(text.parse::<f64>().map_err(|_| {
                        Error::ConditionCompile(format!("invalid number `{text}`"))
                    })?)
                    .ok_or_else(|| Error::ConditionCompile(format!("invalid number `{text}`")))?
                } else {
                    serde_json::Number::from(text.parse::<i64>().map_err(|_| {
                        Error::ConditionCompile(format!("invalid number `{text}`"))
                    })?)
                };
                tokens.push(Token::Number(Value::Number(number)));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(Error::ConditionCompile(format!(
                    "unexpected character `{other}` in `{src}`"
                )));
            }
        }
    }

    Ok(tokens)
}

// ---- parser ----

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.bump();
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::Or(operands)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_cmp()?];
        while self.peek() == Some(&Token::And) {
            self.bump();
            operands.push(self.parse_cmp()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::And(operands)
        })
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let mut operands = vec![self.parse_primary()?];
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::Ne) => CmpOp::Ne,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::Ge) => CmpOp::Ge,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::Le) => CmpOp::Le,
                Some(Token::In) => CmpOp::In,
                _ => break,
            };
            self.bump();
            ops.push(op);
            operands.push(self.parse_primary()?);
        }
        if ops.is_empty() {
            Ok(operands.remove(0))
        } else {
            Ok(Expr::Cmp { operands, ops })
        }
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.bump() {
            Some(Token::Number(v)) => Ok(Expr::Lit(v)),
            Some(Token::Str(s)) => Ok(Expr::Lit(Value::String(s))),
            Some(Token::True) => Ok(Expr::Lit(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Lit(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Lit(Value::Null)),
            Some(Token::Ident(first)) => {
                let mut segs = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.bump();
                    match self.bump() {
                        Some(Token::Ident(seg)) => segs.push(seg),
                        other => {
                            return Err(Error::ConditionCompile(format!(
                                "expected identifier after `.`, got {other:?}"
                            )))
                        }
                    }
                }
                Ok(Expr::Path(segs))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(Error::ConditionCompile(format!(
                        "expected `)`, got {other:?}"
                    ))),
                }
            }
            other => Err(Error::ConditionCompile(format!(
                "expected literal, path, or `(`, got {other:?}"
            ))),
        }
    }
}

// ---- evaluator ----

fn eval_value(expr: &Expr, scope: &Value) -> Value {
    match expr {
        Expr::Lit(v) => v.clone(),
        Expr::Path(segs) => lookup(scope, segs),
        Expr::Or(_) | Expr::And(_) | Expr::Cmp { .. } => Value::Bool(eval_bool(expr, scope)),
    }
}

fn eval_bool(expr: &Expr, scope: &Value) -> bool {
    match expr {
        Expr::Or(operands) => operands.iter().any(|e| eval_bool(e, scope)),
        Expr::And(operands) => operands.iter().all(|e| eval_bool(e, scope)),
        Expr::Cmp { operands, ops } => {
            if ops.is_empty() {
                truthy(&eval_value(&operands[0], scope))
            } else {
                ops.iter().enumerate().all(|(i, op)| {
                    let lhs = eval_value(&operands[i], scope);
                    let rhs = eval_value(&operands[i + 1], scope);
                    apply_op(*op, &lhs, &rhs)
                })
            }
        }
        Expr::Path(_) | Expr::Lit(_) => truthy(&eval_value(expr, scope)),
    }
}

fn lookup(scope: &Value, path: &[String]) -> Value {
    let mut cur = scope;
    for seg in path {
        match cur.as_object().and_then(|m| m.get(seg)) {
            Some(v) => cur = v,
            None => return Value::Null,
        }
    }
    cur.clone()
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn sort_key(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// JSON-canonical equality (§4.1): structural equality, except numbers compare by
/// value rather than by representation — `serde_json::Value`'s derived `PartialEq`
/// treats an integer-typed `Number` and a float-typed `Number` holding the same value
/// as unequal, which would make `decision.count == 3` fail against an agent that
/// serializes all numbers as floats.
fn canonical_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| canonical_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| canonical_eq(v, w)))
        }
        _ => a == b,
    }
}

fn apply_op(op: CmpOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        CmpOp::Eq => canonical_eq(lhs, rhs),
        CmpOp::Ne => !canonical_eq(lhs, rhs),
        CmpOp::Gt | CmpOp::Ge | CmpOp::Lt | CmpOp::Le => {
            let ordering = match (lhs.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => sort_key(lhs).partial_cmp(&sort_key(rhs)),
            };
            let Some(ordering) = ordering else { return false };
            match op {
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                _ => unreachable!(),
            }
        }
        CmpOp::In => match rhs {
            Value::Array(items) => items.iter().any(|item| canonical_eq(item, lhs)),
            Value::String(haystack) => match lhs {
                Value::String(needle) => haystack.contains(needle.as_str()),
                other => haystack.contains(&sort_key(other)),
            },
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> Value {
        json!({
            "decision": {"next": "success", "count": 3},
            "run": {"exit_code": 0, "status": "success"},
            "node": {"id": "main", "attempt": 1},
            "pipeline": {"iteration": 1, "total_node_runs": 1},
        })
    }

    #[test]
    fn equality_on_path() {
        let c = compile("decision.next == \"success\"").unwrap();
        assert!(c.evaluate(&scope()));
    }

    #[test]
    fn single_quoted_strings_normalize() {
        let c = compile("decision.next == 'success'").unwrap();
        assert!(c.evaluate(&scope()));
    }

    #[test]
    fn numeric_ordering() {
        let c = compile("decision.count >= 3 && decision.count < 10").unwrap();
        assert!(c.evaluate(&scope()));
    }

    #[test]
    fn or_short_circuits_to_true() {
        let c = compile("run.exit_code == 1 || run.status == \"success\"").unwrap();
        assert!(c.evaluate(&scope()));
    }

    #[test]
    fn missing_path_is_null_not_error() {
        let c = compile("decision.missing.deep == null").unwrap();
        assert!(c.evaluate(&scope()));
    }

    #[test]
    fn in_array_membership() {
        // the grammar has no array-literal syntax; array operands of `in` are
        // always paths that resolve to an array already present in the scope.
        let mut s = scope();
        s["decision"]["allowed"] = json!(["success", "fail"]);
        let c = compile("decision.next in decision.allowed").unwrap();
        assert!(c.evaluate(&s));

        let c2 = compile("decision.next in \"a-success-path\"").unwrap();
        assert!(c2.evaluate(&scope()));
    }

    #[test]
    fn truthiness_of_bare_path() {
        let c = compile("decision.next").unwrap();
        assert!(c.evaluate(&scope()));
        let c2 = compile("decision.missing").unwrap();
        assert!(!c2.evaluate(&scope()));
    }

    #[test]
    fn invalid_syntax_is_compile_error() {
        assert!(compile("decision.next ==").is_err());
        assert!(compile("(decision.next == 'x'").is_err());
    }

    #[test]
    fn integer_and_float_numbers_compare_equal_canonically() {
        let c = compile("decision.count == 3").unwrap();
        let mut s = scope();
        s["decision"]["count"] = json!(3.0);
        assert!(c.evaluate(&s));
    }

    #[test]
    fn exit_code_equality_boundary() {
        let c = compile("run.exit_code == 0").unwrap();
        assert!(c.evaluate(&scope()));
        let mut other = scope();
        other["run"]["exit_code"] = json!(1);
        assert!(!c.evaluate(&other));
    }
}
