//! Small expression language used for skip conditions, gate conditions,
//! loop conditions, mapping sources, and transforms.
//!
//! Grammar:
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := unary ("&&" unary)*
//! unary      := "!" unary | comparison
//! comparison := primary (("==" | "!=" | ">=" | "<=" | ">" | "<") primary)?
//! primary    := literal | call | path | "(" expr ")"
//! call       := ident "(" (expr ("," expr)*)? ")"
//! path       := ident ("." ident | "." int | "[" (int | string) "]")*
//! ```
//!
//! A path whose root is not a top-level scope key is looked up under
//! `variables`. Paths that do not resolve evaluate to *undefined* (`None`)
//! instead of failing. Equality is loose: `null == undefined`, and numbers compare equal
//! to numeric strings.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use weft_core::error::{Result, WeftError};

/// Functions callable from expressions. All take exactly one argument.
pub const BUILTINS: &[&str] = &[
    "upper", "lower", "trim", "string", "number", "json", "len", "not", "bool", "first", "last",
    "keys",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Undefined,
    Path(Vec<Segment>),
    Not(Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
    And,
    Or,
    Not,
}

fn parse_error(src: &str, msg: impl std::fmt::Display) -> WeftError {
    WeftError::Expression(format!("{} in `{}`", msg, src))
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
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
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch == '\\' {
                        let escaped = chars
                            .get(i + 1)
                            .copied()
                            .ok_or_else(|| parse_error(src, "dangling escape"))?;
                        s.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
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
                    return Err(parse_error(src, "unterminated string"));
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                if next != Some('=') {
                    return Err(parse_error(src, "assignment is not supported, use `==`"));
                }
                i += 2;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                tokens.push(Token::Cmp(CmpOp::Eq));
            }
            '!' => {
                if next == Some('=') {
                    i += 2;
                    if chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                    tokens.push(Token::Cmp(CmpOp::Ne));
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '>' | '<' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    _ => CmpOp::Lt,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '&' | '|' => {
                if next != Some(c) {
                    return Err(parse_error(src, format!("expected `{}{}`", c, c)));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| parse_error(src, format!("bad number `{}`", text)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '$' | '-'))
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(parse_error(src, format!("unexpected character `{}`", other)));
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.advance() {
            Some(tok) if tok == want => Ok(()),
            Some(tok) => Err(parse_error(self.src, format!("expected {:?}, found {:?}", want, tok))),
            None => Err(parse_error(self.src, format!("expected {:?} at end", want))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let left = self.parse_primary()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.parse_primary()?;
            return Ok(Expr::Compare(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expr::Literal(number_value(n))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "undefined" => Ok(Expr::Undefined),
                _ if self.peek() == Some(&Token::LParen) => self.parse_call(name),
                _ => self.parse_path(name),
            },
            Some(tok) => Err(parse_error(self.src, format!("unexpected token {:?}", tok))),
            None => Err(parse_error(self.src, "unexpected end of expression")),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        if !BUILTINS.contains(&name.as_str()) {
            return Err(parse_error(self.src, format!("unknown function `{}`", name)));
        }
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_or()?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen)?;
        if args.len() != 1 {
            return Err(parse_error(
                self.src,
                format!("`{}` takes one argument, got {}", name, args.len()),
            ));
        }
        Ok(Expr::Call(name, args))
    }

    fn parse_path(&mut self, root: String) -> Result<Expr> {
        let mut segments = vec![Segment::Key(root)];
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        _ => return Err(parse_error(self.src, "expected property name after `.`")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => {
                            segments.push(Segment::Index(n as usize))
                        }
                        Some(Token::Str(key)) => segments.push(Segment::Key(key)),
                        _ => {
                            return Err(parse_error(
                                self.src,
                                "expected index or quoted key inside `[]`",
                            ))
                        }
                    }
                    self.expect(Token::RBracket)?;
                }
                _ => break,
            }
        }
        Ok(Expr::Path(segments))
    }
}

/// Parse an expression.
pub fn parse(src: &str) -> Result<Expr> {
    let tokens = tokenize(src)?;
    if tokens.is_empty() {
        return Err(parse_error(src, "empty expression"));
    }
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
    };
    let expr = parser.parse_or()?;
    if let Some(tok) = parser.peek() {
        return Err(parse_error(src, format!("unexpected trailing {:?}", tok)));
    }
    Ok(expr)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl Expr {
    /// Evaluate against a JSON scope. `None` is *undefined*.
    pub fn eval(&self, scope: &Value) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Undefined => None,
            Expr::Path(segments) => resolve(scope, segments).or_else(|| match segments.first() {
                // Bare names fall back to the variable namespace.
                Some(Segment::Key(root)) if root != "variables" => {
                    resolve(scope.get("variables")?, segments)
                }
                _ => None,
            }),
            Expr::Not(inner) => Some(Value::Bool(!truthy(inner.eval(scope).as_ref()))),
            Expr::Compare(left, op, right) => {
                let l = left.eval(scope);
                let r = right.eval(scope);
                Some(Value::Bool(compare(*op, l.as_ref(), r.as_ref())))
            }
            Expr::And(left, right) => {
                let result = truthy(left.eval(scope).as_ref()) && truthy(right.eval(scope).as_ref());
                Some(Value::Bool(result))
            }
            Expr::Or(left, right) => {
                let result = truthy(left.eval(scope).as_ref()) || truthy(right.eval(scope).as_ref());
                Some(Value::Bool(result))
            }
            Expr::Call(name, args) => {
                let arg = args.first().and_then(|a| a.eval(scope));
                call_builtin(name, arg)
            }
        }
    }

    /// Segments of a bare path expression.
    pub fn as_path(&self) -> Option<&[Segment]> {
        match self {
            Expr::Path(segments) => Some(segments),
            _ => None,
        }
    }
}

/// Walk `segments` into `scope`.
pub fn resolve(scope: &Value, segments: &[Segment]) -> Option<Value> {
    let mut current = scope;
    for (i, segment) in segments.iter().enumerate() {
        let next = match (segment, current) {
            (Segment::Key(key), Value::Object(map)) => map.get(key),
            (Segment::Key(key), Value::Array(items)) if key == "length" => {
                return resolve_rest(Value::from(items.len()), &segments[i + 1..]);
            }
            (Segment::Key(key), Value::String(s)) if key == "length" => {
                return resolve_rest(Value::from(s.chars().count()), &segments[i + 1..]);
            }
            (Segment::Key(key), Value::Array(items)) => {
                key.parse::<usize>().ok().and_then(|idx| items.get(idx))
            }
            (Segment::Index(idx), Value::Array(items)) => items.get(*idx),
            (Segment::Index(idx), Value::Object(map)) => map.get(&idx.to_string()),
            _ => None,
        };
        current = next?;
    }
    Some(current.clone())
}

fn resolve_rest(value: Value, rest: &[Segment]) -> Option<Value> {
    if rest.is_empty() {
        Some(value)
    } else {
        resolve(&value, rest)
    }
}

/// JavaScript-style truthiness.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Render a value for template output: strings verbatim, everything else as
/// JSON text.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn is_nullish(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn loose_eq(a: Option<&Value>, b: Option<&Value>) -> bool {
    if is_nullish(a) || is_nullish(b) {
        return is_nullish(a) && is_nullish(b);
    }
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(_), _) | (_, Value::Number(_)) | (Value::Bool(_), _) | (_, Value::Bool(_)) => {
            match (as_number(a), as_number(b)) {
                (Some(x), Some(y)) => x == y,
                _ => a == b,
            }
        }
        _ => a == b,
    }
}

fn order(a: Option<&Value>, b: Option<&Value>) -> Option<Ordering> {
    let (a, b) = (a?, b?);
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ if a.is_number() || b.is_number() => as_number(a)?.partial_cmp(&as_number(b)?),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn compare(op: CmpOp, a: Option<&Value>, b: Option<&Value>) -> bool {
    match op {
        CmpOp::Eq => loose_eq(a, b),
        CmpOp::Ne => !loose_eq(a, b),
        CmpOp::Gt => order(a, b) == Some(Ordering::Greater),
        CmpOp::Ge => matches!(order(a, b), Some(Ordering::Greater | Ordering::Equal)),
        CmpOp::Lt => order(a, b) == Some(Ordering::Less),
        CmpOp::Le => matches!(order(a, b), Some(Ordering::Less | Ordering::Equal)),
    }
}

fn call_builtin(name: &str, arg: Option<Value>) -> Option<Value> {
    match name {
        "not" => Some(Value::Bool(!truthy(arg.as_ref()))),
        "bool" => Some(Value::Bool(truthy(arg.as_ref()))),
        _ => {
            let arg = arg?;
            match name {
                "upper" => Some(Value::String(stringify(&arg).to_uppercase())),
                "lower" => Some(Value::String(stringify(&arg).to_lowercase())),
                "trim" => Some(Value::String(stringify(&arg).trim().to_string())),
                "string" => Some(Value::String(stringify(&arg))),
                "number" => as_number(&arg).map(number_value),
                "json" => match &arg {
                    Value::String(s) => serde_json::from_str(s).ok(),
                    other => Some(other.clone()),
                },
                "len" => match &arg {
                    Value::Array(items) => Some(Value::from(items.len())),
                    Value::Object(map) => Some(Value::from(map.len())),
                    Value::String(s) => Some(Value::from(s.chars().count())),
                    _ => None,
                },
                "first" => arg.as_array().and_then(|a| a.first().cloned()),
                "last" => arg.as_array().and_then(|a| a.last().cloned()),
                "keys" => arg.as_object().map(|m| {
                    Value::Array(m.keys().map(|k| Value::String(k.clone())).collect())
                }),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(src: &str, scope: &Value) -> Option<Value> {
        parse(src).unwrap().eval(scope)
    }

    fn scope() -> Value {
        json!({
            "variables": {
                "user": { "name": "Ada", "age": 36 },
                "flag": true,
                "count": "7",
                "tags": ["a", "b", "c"]
            },
            "nodeOutputs": {
                "fetch-data": { "output": { "items": [{ "id": 1 }, { "id": 2 }] } }
            }
        })
    }

    #[test]
    fn resolves_nested_paths() {
        let s = scope();
        assert_eq!(eval("variables.user.name", &s), Some(json!("Ada")));
        assert_eq!(eval("nodeOutputs.fetch-data.output.items[1].id", &s), Some(json!(2)));
        assert_eq!(eval("variables.tags.0", &s), Some(json!("a")));
        assert_eq!(eval("variables['user']['age']", &s), Some(json!(36)));
    }

    #[test]
    fn missing_paths_are_undefined() {
        let s = scope();
        assert_eq!(eval("variables.nope.deeper", &s), None);
        assert_eq!(eval("variables.tags[10]", &s), None);
        assert_eq!(eval("variables.nope == undefined", &s), Some(json!(true)));
        assert_eq!(eval("variables.nope == null", &s), Some(json!(true)));
    }

    #[test]
    fn length_property() {
        let s = scope();
        assert_eq!(eval("variables.tags.length", &s), Some(json!(3)));
        assert_eq!(eval("variables.user.name.length >= 3", &s), Some(json!(true)));
    }

    #[test]
    fn comparisons_and_coercion() {
        let s = scope();
        assert_eq!(eval("variables.user.age >= 18", &s), Some(json!(true)));
        assert_eq!(eval("variables.count == 7", &s), Some(json!(true)));
        assert_eq!(eval("variables.count > 10", &s), Some(json!(false)));
        assert_eq!(eval("variables.user.name != 'Bob'", &s), Some(json!(true)));
        assert_eq!(eval("variables.flag == true", &s), Some(json!(true)));
        assert_eq!(eval("variables.user < 3", &s), Some(json!(false)));
    }

    #[test]
    fn logical_operators_and_grouping() {
        let s = scope();
        assert_eq!(
            eval("variables.flag && (variables.user.age < 30 || variables.user.name == \"Ada\")", &s),
            Some(json!(true))
        );
        assert_eq!(eval("!variables.flag || false", &s), Some(json!(false)));
        assert_eq!(eval("!variables.missing", &s), Some(json!(true)));
    }

    #[test]
    fn builtin_functions() {
        let s = json!({ "value": "  Mixed Case  ", "raw": "{\"a\": [1, 2]}" });
        assert_eq!(eval("trim(value)", &s), Some(json!("Mixed Case")));
        assert_eq!(eval("upper(trim(value))", &s), Some(json!("MIXED CASE")));
        assert_eq!(eval("len(json(raw))", &s), Some(json!(1)));
        assert_eq!(eval("number('42')", &s), Some(json!(42)));
    }

    #[test]
    fn parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("a = 1").is_err());
        assert!(parse("a == ").is_err());
        assert!(parse("'unterminated").is_err());
        assert!(parse("exec(a)").is_err());
        assert!(parse("upper(a, b)").is_err());
        assert!(parse("a == 1 extra").is_err());
        assert!(parse("a & b").is_err());
    }

    #[test]
    fn truthiness() {
        assert!(!truthy(None));
        assert!(!truthy(Some(&json!(0))));
        assert!(!truthy(Some(&json!(""))));
        assert!(truthy(Some(&json!([]))));
        assert!(truthy(Some(&json!("x"))));
    }
}
