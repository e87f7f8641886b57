//! Restricted guard expressions for step conditions.
//!
//! Boolean combinators over comparisons on `parameters.<name>` and
//! `wiring.<step>.<field>` references and literals. No function calls, no
//! side effects; anything outside the grammar is rejected at parse time,
//! which is what lets LLM-produced guards be accepted safely.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("invalid predicate: {0}")]
pub struct PredicateError(String);

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    /// Dot path under the composite's external parameters.
    Param(Vec<String>),
    /// Step index plus dot path under that step's recorded output.
    Wiring(usize, Vec<String>),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A parsed, validated guard expression.
#[derive(Debug, Clone)]
pub struct Predicate {
    source: String,
    expr: Expr,
}

impl Predicate {
    pub fn parse(source: &str) -> Result<Self, PredicateError> {
        let tokens = lex(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(PredicateError(format!(
                "trailing input after expression: {:?}",
                &parser.tokens[parser.pos..]
            )));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against the composite's external parameters and the
    /// recorded upstream outputs. Unresolvable references make their
    /// comparison false rather than erroring.
    pub fn eval(&self, parameters: &Value, outputs: &BTreeMap<usize, Value>) -> bool {
        eval_expr(&self.expr, parameters, outputs)
    }
}

fn eval_expr(expr: &Expr, parameters: &Value, outputs: &BTreeMap<usize, Value>) -> bool {
    match expr {
        Expr::Or(a, b) => {
            eval_expr(a, parameters, outputs) || eval_expr(b, parameters, outputs)
        }
        Expr::And(a, b) => {
            eval_expr(a, parameters, outputs) && eval_expr(b, parameters, outputs)
        }
        Expr::Not(inner) => !eval_expr(inner, parameters, outputs),
        Expr::Compare(lhs, op, rhs) => {
            let (Some(lhs), Some(rhs)) = (
                resolve(lhs, parameters, outputs),
                resolve(rhs, parameters, outputs),
            ) else {
                return false;
            };
            match op {
                // Numbers compare numerically so 5 == 5.0 holds.
                CmpOp::Eq => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => lhs == rhs,
                },
                CmpOp::Ne => match (lhs.as_f64(), rhs.as_f64()) {
                    (Some(a), Some(b)) => a != b,
                    _ => lhs != rhs,
                },
                _ => {
                    let (Some(a), Some(b)) = (lhs.as_f64(), rhs.as_f64()) else {
                        return false;
                    };
                    match op {
                        CmpOp::Lt => a < b,
                        CmpOp::Le => a <= b,
                        CmpOp::Gt => a > b,
                        CmpOp::Ge => a >= b,
                        CmpOp::Eq | CmpOp::Ne => unreachable!(),
                    }
                }
            }
        }
    }
}

fn resolve(
    operand: &Operand,
    parameters: &Value,
    outputs: &BTreeMap<usize, Value>,
) -> Option<Value> {
    match operand {
        Operand::Literal(v) => Some(v.clone()),
        Operand::Param(path) => walk(parameters, path),
        Operand::Wiring(step, path) => walk(outputs.get(step)?, path),
    }
}

fn walk(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn lex(source: &str) -> Result<Vec<Token>, PredicateError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            }
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            }
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err(PredicateError("unterminated string".into())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let num = raw
                    .parse::<f64>()
                    .map_err(|_| PredicateError(format!("bad number {raw:?}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            other => return Err(PredicateError(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::OrOr) {
            self.next();
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, PredicateError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.next();
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, PredicateError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.next();
                Ok(Expr::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.next();
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(PredicateError("expected ')'".into())),
                }
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Expr, PredicateError> {
        let lhs = self.operand()?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            other => {
                return Err(PredicateError(format!(
                    "expected comparison operator, got {other:?}"
                )))
            }
        };
        let rhs = self.operand()?;
        Ok(Expr::Compare(lhs, op, rhs))
    }

    fn operand(&mut self) -> Result<Operand, PredicateError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Word(word)) => operand_from_word(&word),
            other => Err(PredicateError(format!("expected operand, got {other:?}"))),
        }
    }
}

fn operand_from_word(word: &str) -> Result<Operand, PredicateError> {
    match word {
        "true" => return Ok(Operand::Literal(Value::Bool(true))),
        "false" => return Ok(Operand::Literal(Value::Bool(false))),
        "null" => return Ok(Operand::Literal(Value::Null)),
        _ => {}
    }
    if let Some(rest) = word.strip_prefix("parameters.") {
        let path: Vec<String> = rest.split('.').map(|s| s.to_string()).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(PredicateError(format!("bad parameter path {word:?}")));
        }
        return Ok(Operand::Param(path));
    }
    if let Some(rest) = word.strip_prefix("wiring.") {
        let mut parts = rest.splitn(2, '.');
        let step = parts
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| PredicateError(format!("bad wiring step in {word:?}")))?;
        let field = parts
            .next()
            .ok_or_else(|| PredicateError(format!("missing wiring field in {word:?}")))?;
        let path: Vec<String> = field.split('.').map(|s| s.to_string()).collect();
        if path.iter().any(|s| s.is_empty()) {
            return Err(PredicateError(format!("bad wiring path {word:?}")));
        }
        return Ok(Operand::Wiring(step, path));
    }
    Err(PredicateError(format!(
        "unknown reference {word:?}; only parameters.* and wiring.* are allowed"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs(pairs: &[(usize, Value)]) -> BTreeMap<usize, Value> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn parses_and_evaluates_comparisons() {
        let p = Predicate::parse(r#"parameters.mode == "fast""#).unwrap();
        assert!(p.eval(&json!({"mode": "fast"}), &outputs(&[])));
        assert!(!p.eval(&json!({"mode": "slow"}), &outputs(&[])));
    }

    #[test]
    fn wiring_references_resolve_into_step_outputs() {
        let p = Predicate::parse("wiring.0.count > 3 && parameters.enabled == true").unwrap();
        let outs = outputs(&[(0, json!({"count": 5}))]);
        assert!(p.eval(&json!({"enabled": true}), &outs));
        assert!(!p.eval(&json!({"enabled": false}), &outs));
    }

    #[test]
    fn missing_references_are_false_not_errors() {
        let p = Predicate::parse("wiring.3.missing == 1").unwrap();
        assert!(!p.eval(&json!({}), &outputs(&[])));
    }

    #[test]
    fn combinators_and_negation() {
        let p = Predicate::parse("!(parameters.a == 1) || parameters.b == 2").unwrap();
        assert!(p.eval(&json!({"a": 2, "b": 0}), &outputs(&[])));
        assert!(p.eval(&json!({"a": 1, "b": 2}), &outputs(&[])));
        assert!(!p.eval(&json!({"a": 1, "b": 0}), &outputs(&[])));
    }

    #[test]
    fn function_calls_are_rejected() {
        assert!(Predicate::parse("len(parameters.a) == 1").is_err());
        assert!(Predicate::parse("parameters.a == exec('rm')").is_err());
        assert!(Predicate::parse("system == 1").is_err());
    }
}
