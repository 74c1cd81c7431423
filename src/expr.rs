//! Expression Evaluator (§4.3): the closed grammar interpreted by `when`
//! and `while.condition` guards.
//!
//! Embedded `${…}` placeholders are resolved first (§4.2), against the same
//! [`Scope`](crate::reference::Scope) the Reference Resolver uses, with
//! resolved values spliced in as grammar literals rather than text — this is
//! what lets `${A.v} > 10` compare a real number rather than a string. The
//! resulting token stream is then parsed against a restricted grammar:
//! comparisons, boolean connectives, literals, unary minus, parenthesized
//! grouping, and member/index access. There are no function calls and no
//! arithmetic beyond unary negation — anything else is `UnsafeExpression`,
//! by construction of the parser rather than by a denylist.

use std::collections::BTreeMap;

use serde_json::Number;

use crate::errors::RunnerError;
use crate::plan::node::{CompareOp, Guard};
use crate::reference::{self, Scope};
use crate::value::Value;

/// Evaluate a guard to a boolean. `null` is falsy (§4.3); anything else
/// follows [`Value::is_truthy`].
pub fn eval_guard(guard: &Guard, scope: &Scope) -> Result<bool, RunnerError> {
    match guard {
        Guard::Expr { expr } => {
            let value = eval_expr_string(expr, scope)?;
            Ok(value.is_truthy())
        }
        Guard::Structured { left, op, right } => {
            let l = reference::resolve(left, scope)?;
            let r = reference::resolve(right, scope)?;
            compare(&l, *op, &r)
        }
    }
}

/// Evaluate a guard expression string: substitute placeholders, then parse
/// and interpret the restricted grammar.
pub fn eval_expr_string(expr: &str, scope: &Scope) -> Result<Value, RunnerError> {
    let substituted = substitute_literals(expr, scope)?;
    let tokens = tokenize(&substituted)?;
    let mut parser = Parser::new(&tokens);
    let ast = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(RunnerError::UnsafeExpression(format!(
            "trailing tokens after expression: `{expr}`"
        )));
    }
    ast.eval(scope)
}

/// Replace every `${...}` placeholder in `expr` with a literal rendering of
/// its resolved value (quoted strings, bare numbers/bools/null), so the
/// tokenizer below never has to special-case `${`.
fn substitute_literals(expr: &str, scope: &Scope) -> Result<String, RunnerError> {
    let placeholders = reference::scan_placeholders(expr);
    if placeholders.is_empty() {
        return Ok(expr.to_string());
    }
    let mut out = String::with_capacity(expr.len());
    let mut cursor = 0;
    for ph in &placeholders {
        out.push_str(&expr[cursor..ph.start]);
        let whole = Value::String(format!("${{{}}}", render_placeholder_body(ph)));
        let resolved = reference::resolve(&whole, scope)?;
        out.push_str(&literal_text(&resolved));
        cursor = ph.end;
    }
    out.push_str(&expr[cursor..]);
    Ok(out)
}

fn render_placeholder_body(ph: &reference::Placeholder) -> String {
    let mut s = ph.head.clone();
    for seg in &ph.path {
        s.push('.');
        s.push_str(seg);
    }
    s
}

fn literal_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{:?}", s),
        // Arrays/objects have no grammar literal; stringify so a malformed
        // comparison fails at eval time rather than at the tokenizer.
        other => format!("{:?}", other.to_string()),
    }
}

// ---- Tokenizer ----

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
}

fn tokenize(s: &str) -> Result<Vec<Token>, RunnerError> {
    let chars: Vec<char> = s.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut lit = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        lit.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    lit.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(RunnerError::UnsafeExpression(format!(
                        "unterminated string literal in `{s}`"
                    )));
                }
                tokens.push(Token::Str(lit));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| RunnerError::UnsafeExpression(format!("bad number `{text}`")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(RunnerError::UnsafeExpression(format!(
                    "unexpected character `{other}` in `{s}`"
                )));
            }
        }
    }
    Ok(tokens)
}

// ---- AST ----

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String, Vec<PathStep>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BoolOp, Box<Expr>),
}

#[derive(Debug, Clone)]
enum PathStep {
    Field(String),
    Index(i64),
}

#[derive(Debug, Clone, Copy)]
enum BoolOp {
    And,
    Or,
    Cmp(CompareOp),
}

impl Expr {
    fn eval(&self, scope: &Scope) -> Result<Value, RunnerError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name, path) => eval_ident(name, path, scope),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(scope)?.is_truthy())),
            Expr::Neg(inner) => {
                let v = inner.eval(scope)?;
                let n = v.as_f64().ok_or_else(|| {
                    RunnerError::UnsafeExpression("unary `-` applied to non-number".to_string())
                })?;
                Ok(Value::Number(
                    Number::from_f64(-n)
                        .ok_or_else(|| RunnerError::UnsafeExpression("invalid negation".to_string()))?,
                ))
            }
            Expr::Binary(lhs, BoolOp::And, rhs) => {
                Ok(Value::Bool(lhs.eval(scope)?.is_truthy() && rhs.eval(scope)?.is_truthy()))
            }
            Expr::Binary(lhs, BoolOp::Or, rhs) => {
                Ok(Value::Bool(lhs.eval(scope)?.is_truthy() || rhs.eval(scope)?.is_truthy()))
            }
            Expr::Binary(lhs, BoolOp::Cmp(op), rhs) => {
                let l = lhs.eval(scope)?;
                let r = rhs.eval(scope)?;
                Ok(Value::Bool(compare(&l, *op, &r)?))
            }
        }
    }
}

/// Resolve a bare identifier (`vars.x`, `A.v`, `env.K`, `config.p`) that
/// appears directly in guard syntax rather than wrapped in `${}` — the
/// grammar's identifiers are "resolved via the same scope rules" (§4.3).
fn eval_ident(name: &str, path: &[PathStep], scope: &Scope) -> Result<Value, RunnerError> {
    let mut full = name.to_string();
    for step in path {
        match step {
            PathStep::Field(f) => {
                full.push('.');
                full.push_str(f);
            }
            PathStep::Index(i) => {
                full.push('[');
                full.push_str(&i.to_string());
                full.push(']');
            }
        }
    }
    reference::resolve(&Value::String(format!("${{{full}}}")), scope)
}

fn compare(l: &Value, op: CompareOp, r: &Value) -> Result<bool, RunnerError> {
    use CompareOp::*;
    if matches!(op, Eq | Ne) {
        let eq = values_equal(l, r);
        return Ok(if op == Eq { eq } else { !eq });
    }
    let (lf, rf) = match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => match (l.as_str(), r.as_str()) {
            (Some(a), Some(b)) => {
                return Ok(match op {
                    Lt => a < b,
                    Lte => a <= b,
                    Gt => a > b,
                    Gte => a >= b,
                    Eq | Ne => unreachable!(),
                });
            }
            _ => {
                return Err(RunnerError::UnsafeExpression(format!(
                    "cannot order-compare {l:?} and {r:?}"
                )));
            }
        },
    };
    Ok(match op {
        Lt => lf < rf,
        Lte => lf <= rf,
        Gt => lf > rf,
        Gte => lf >= rf,
        Eq | Ne => unreachable!(),
    })
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => l == r,
    }
}

// ---- Recursive-descent parser ----
//
// Precedence, low to high: `or` < `and` < `not` < comparison < unary `-` <
// primary (literal / ident-with-path / parenthesized).

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn parse_expr(&mut self) -> Result<Expr, RunnerError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, RunnerError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(Box::new(lhs), BoolOp::Or, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, RunnerError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::Binary(Box::new(lhs), BoolOp::And, Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, RunnerError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, RunnerError> {
        let lhs = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CompareOp::Eq),
            Some(Token::Ne) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Le) => Some(CompareOp::Lte),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Ge) => Some(CompareOp::Gte),
            _ => None,
        };
        let Some(op) = op else { return Ok(lhs) };
        self.advance();
        let rhs = self.parse_unary()?;
        Ok(Expr::Binary(Box::new(lhs), BoolOp::Cmp(op), Box::new(rhs)))
    }

    fn parse_unary(&mut self) -> Result<Expr, RunnerError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, RunnerError> {
        match self.advance().cloned() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(
                Number::from_f64(n)
                    .ok_or_else(|| RunnerError::UnsafeExpression("invalid number literal".to_string()))?,
            ))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Bool(b)) => Ok(Expr::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => {
                let path = self.parse_path_steps()?;
                Ok(Expr::Ident(name, path))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(RunnerError::UnsafeExpression("missing closing `)`".to_string())),
                }
            }
            other => Err(RunnerError::UnsafeExpression(format!(
                "unexpected token in guard expression: {other:?}"
            ))),
        }
    }

    fn parse_path_steps(&mut self) -> Result<Vec<PathStep>, RunnerError> {
        let mut steps = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance().cloned() {
                        Some(Token::Ident(field)) => steps.push(PathStep::Field(field)),
                        other => {
                            return Err(RunnerError::UnsafeExpression(format!(
                                "expected field name after `.`, found {other:?}"
                            )));
                        }
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    match self.advance().cloned() {
                        Some(Token::Number(n)) => steps.push(PathStep::Index(n as i64)),
                        other => {
                            return Err(RunnerError::UnsafeExpression(format!(
                                "expected integer index, found {other:?}"
                            )));
                        }
                    }
                    match self.advance() {
                        Some(Token::RBracket) => {}
                        _ => {
                            return Err(RunnerError::UnsafeExpression(
                                "missing closing `]`".to_string(),
                            ));
                        }
                    }
                }
                _ => break,
            }
        }
        Ok(steps)
    }
}

/// Validate that an expression parses under the closed grammar (§4.5 check
/// 6), without needing a Scope — used by the Validator, which runs before
/// any node has produced output.
pub fn check_syntax(expr: &str) -> Result<(), RunnerError> {
    // Strip placeholders textually (their contents are opaque at validation
    // time) before tokenizing, so `${A.v} > 10` validates the shape of the
    // surrounding grammar without requiring A to have run.
    let mut stripped = String::with_capacity(expr.len());
    let mut cursor = 0;
    for ph in reference::scan_placeholders(expr) {
        stripped.push_str(&expr[cursor..ph.start]);
        stripped.push_str("null");
        cursor = ph.end;
    }
    stripped.push_str(&expr[cursor..]);

    let tokens = tokenize(&stripped)?;
    let mut parser = Parser::new(&tokens);
    parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(RunnerError::UnsafeExpression(format!(
            "trailing tokens after expression: `{expr}`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use std::collections::BTreeSet;

    fn scope<'a>(
        vars: &'a BTreeMap<String, Value>,
        config: &'a ConfigStore,
        outputs: &'a BTreeMap<String, BTreeMap<String, Value>>,
        known: &'a BTreeSet<String>,
        terminal_absent: &'a BTreeSet<String>,
    ) -> Scope<'a> {
        Scope {
            vars,
            config,
            outputs,
            known_node_ids: known,
            terminal_absent,
        }
    }

    #[test]
    fn numeric_comparison_with_placeholder() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let mut outputs = BTreeMap::new();
        outputs.insert("A".into(), BTreeMap::from([("v".to_string(), Value::from(7i64))]));
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::new();
        let s = scope(&vars, &config, &outputs, &known, &terminal_absent);

        let guard = Guard::Expr {
            expr: "${A.v} > 10".to_string(),
        };
        assert!(!eval_guard(&guard, &s).unwrap());

        let guard2 = Guard::Expr {
            expr: "${A.v} < 10 and not (${A.v} == 0)".to_string(),
        };
        assert!(eval_guard(&guard2, &s).unwrap());
    }

    #[test]
    fn null_guard_is_falsy() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let outputs = BTreeMap::new();
        let known = BTreeSet::new();
        let terminal_absent = BTreeSet::new();
        let s = scope(&vars, &config, &outputs, &known, &terminal_absent);
        let guard = Guard::Expr {
            expr: "null".to_string(),
        };
        assert!(!eval_guard(&guard, &s).unwrap());
    }

    #[test]
    fn structured_guard_compares_directly() {
        let vars = BTreeMap::new();
        let config = ConfigStore::empty();
        let mut outputs = BTreeMap::new();
        outputs.insert("A".into(), BTreeMap::from([("v".to_string(), Value::from(7i64))]));
        let known = BTreeSet::from(["A".to_string()]);
        let terminal_absent = BTreeSet::new();
        let s = scope(&vars, &config, &outputs, &known, &terminal_absent);

        let guard = Guard::Structured {
            left: Value::from("${A.v}"),
            op: CompareOp::Gte,
            right: Value::from(7i64),
        };
        assert!(eval_guard(&guard, &s).unwrap());
    }

    #[test]
    fn disallowed_syntax_is_rejected() {
        assert!(check_syntax("foo(1, 2)").is_err());
        assert!(check_syntax("1 + 2").is_err());
        assert!(check_syntax("${A.v} > 10").is_ok());
        assert!(check_syntax("${A.v} > 10 and ${B.ok}").is_ok());
    }
}
