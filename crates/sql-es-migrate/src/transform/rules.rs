//! Transformation rule expressions.
//!
//! ```text
//! expr    := call | literal | ref
//! call    := name '(' [expr (',' expr)*] ')' | name        (bare name applies to `$`)
//! literal := "str" | 'str' | number | true | false | null
//! ref     := '$' | '$' path                                   (document values)
//!          | identifier                                       (source column)
//! ```
//!
//! Function names are case-insensitive. `FORMAT_DATE`, `CAST_FLOAT` and
//! `TRIM_SPACES` are accepted as aliases of the legacy rule set.

use std::collections::BTreeMap;
use std::str::FromStr;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use super::cast::{cast_json, normalize_date};
use super::LargeText;
use crate::core::{get_path, Row};
use crate::typemap::FieldType;

/// Built-in rule functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Copy,
    Cast,
    DateNormalize,
    Concat,
    Lookup,
    Trim,
    Upper,
    Lower,
    Scale,
    Truncate,
    Default,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        let f = match name.to_lowercase().as_str() {
            "copy" => Func::Copy,
            "cast" | "cast_float" => Func::Cast,
            "date_normalize" | "format_date" | "normalize_date" => Func::DateNormalize,
            "concat" => Func::Concat,
            "lookup" => Func::Lookup,
            "trim" | "trim_spaces" => Func::Trim,
            "upper" | "uppercase" => Func::Upper,
            "lower" | "lowercase" => Func::Lower,
            "scale" | "numeric_scaling" => Func::Scale,
            "truncate" => Func::Truncate,
            "default" | "coalesce" => Func::Default,
            _ => return None,
        };
        Some(f)
    }

    /// (min, max) argument count including the value argument.
    fn arity(&self) -> (usize, usize) {
        match self {
            Func::Copy => (1, 1),
            Func::Cast | Func::Scale | Func::Default => (2, 2),
            Func::DateNormalize => (1, 2),
            Func::Concat => (1, usize::MAX),
            Func::Lookup => (2, 3),
            Func::Trim | Func::Upper | Func::Lower | Func::Truncate => (1, 1),
        }
    }
}

/// A parsed rule expression.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleExpr {
    Literal(Value),
    /// `$`: the current value at the rule's target path.
    Current,
    /// `$a.b`: any document path.
    DocPath(String),
    /// Bare identifier: a source column.
    Column(String),
    Call { func: Func, args: Vec<RuleExpr> },
}

impl RuleExpr {
    /// Parse a rule expression.
    pub fn parse(input: &str) -> Result<Self, String> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err("empty rule".to_string());
        }

        // A lone function name applies to the target's current value.
        if let [Token::Ident(name)] = tokens.as_slice() {
            if let Some(func) = Func::from_name(name) {
                return finish_call(func, name, Vec::new());
            }
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos < parser.tokens.len() {
            return Err(format!(
                "unexpected {} after expression",
                parser.tokens[parser.pos].describe()
            ));
        }
        Ok(expr)
    }

    /// Lookup table names referenced anywhere in the expression.
    pub fn lookup_tables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_lookups(&mut out);
        out
    }

    fn collect_lookups<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let RuleExpr::Call { func, args } = self {
            if *func == Func::Lookup {
                if let Some(RuleExpr::Literal(Value::String(table))) = args.get(1) {
                    out.push(table.as_str());
                }
            }
            for arg in args {
                arg.collect_lookups(out);
            }
        }
    }

    /// Evaluate against one record.
    pub fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, String> {
        match self {
            RuleExpr::Literal(v) => Ok(v.clone()),
            RuleExpr::Current => Ok(get_path(ctx.document, ctx.target)
                .cloned()
                .unwrap_or(Value::Null)),
            RuleExpr::DocPath(path) => Ok(get_path(ctx.document, path)
                .cloned()
                .unwrap_or(Value::Null)),
            RuleExpr::Column(name) => ctx
                .row
                .get(name)
                .map(|v| v.to_json())
                .ok_or_else(|| format!("unknown source column '{}'", name)),
            RuleExpr::Call { func, args } => {
                let values = args
                    .iter()
                    .map(|a| a.eval(ctx))
                    .collect::<Result<Vec<_>, _>>()?;
                apply(*func, values, ctx)
            }
        }
    }
}

/// Inputs visible to a rule.
pub struct EvalContext<'a> {
    /// First (parent) row of the record.
    pub row: &'a Row,
    /// Document built so far.
    pub document: &'a Map<String, Value>,
    /// Target path of the rule being evaluated.
    pub target: &'a str,
    pub lookups: &'a BTreeMap<String, BTreeMap<String, Value>>,
    pub large_text: &'a LargeText,
}

fn apply(func: Func, mut args: Vec<Value>, ctx: &EvalContext<'_>) -> Result<Value, String> {
    let value = args.first().cloned().unwrap_or(Value::Null);
    match func {
        Func::Copy => Ok(value),
        Func::Cast => {
            let type_name = args
                .get(1)
                .and_then(Value::as_str)
                .ok_or("cast expects a type name")?;
            let target: FieldType = type_name.parse()?;
            cast_json(&value, target)
        }
        Func::DateNormalize => match &value {
            Value::Null => Ok(Value::Null),
            Value::Number(n) => cast_json(&Value::Number(n.clone()), FieldType::Date),
            Value::String(s) => {
                let format = args.get(1).and_then(Value::as_str);
                normalize_date(s, format).map(Value::String)
            }
            other => Err(format!("cannot normalize {} as a date", other)),
        },
        Func::Concat => {
            let joined = args
                .iter()
                .filter(|v| !v.is_null())
                .map(plain_string)
                .collect::<String>();
            Ok(Value::String(joined))
        }
        Func::Lookup => {
            let table_name = args
                .get(1)
                .and_then(Value::as_str)
                .ok_or("lookup expects a table name")?;
            let table = ctx
                .lookups
                .get(table_name)
                .ok_or_else(|| format!("unknown lookup table '{}'", table_name))?;
            let default = args.get(2).cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Ok(default);
            }
            Ok(table
                .get(&plain_string(&value))
                .cloned()
                .unwrap_or(default))
        }
        Func::Trim => Ok(map_string(value, |s| s.trim().to_string())),
        Func::Upper => Ok(map_string(value, |s| s.to_uppercase())),
        Func::Lower => Ok(map_string(value, |s| s.to_lowercase())),
        Func::Scale => {
            if value.is_null() {
                return Ok(Value::Null);
            }
            let factor = args
                .get(1)
                .and_then(Value::as_f64)
                .ok_or("scale expects a numeric factor")?;
            let base = cast_json(&value, FieldType::Double)?;
            // Decimal arithmetic keeps 12.34 * 100 == 1234 exactly.
            let scaled = Decimal::from_str(&base.to_string())
                .ok()
                .zip(Decimal::from_f64(factor))
                .and_then(|(b, f)| b.checked_mul(f))
                .and_then(|d| d.normalize().to_f64())
                .or_else(|| base.as_f64().map(|b| b * factor));
            scaled
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("cannot scale {}", value))
        }
        Func::Truncate => Ok(match value {
            Value::String(s) => ctx.large_text.apply(s),
            other => other,
        }),
        Func::Default => {
            let fallback = args.pop().unwrap_or(Value::Null);
            Ok(if value.is_null() { fallback } else { value })
        }
    }
}

fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn map_string(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn finish_call(func: Func, name: &str, mut args: Vec<RuleExpr>) -> Result<RuleExpr, String> {
    let (min, max) = func.arity();
    if name.eq_ignore_ascii_case("cast_float") {
        if args.len() > 1 {
            return Err("cast_float takes at most one argument".to_string());
        }
        if args.is_empty() {
            args.push(RuleExpr::Current);
        }
        args.push(RuleExpr::Literal(Value::String("double".into())));
        return Ok(RuleExpr::Call { func, args });
    }
    // The value argument defaults to the target's current value.
    if args.len() + 1 == min || (args.is_empty() && min == 1) {
        args.insert(0, RuleExpr::Current);
    }
    if args.len() < min || args.len() > max {
        return Err(format!(
            "{} expects {} argument(s), got {}",
            name.to_lowercase(),
            if min == max {
                min.to_string()
            } else if max == usize::MAX {
                format!("at least {}", min)
            } else {
                format!("{} to {}", min, max)
            },
            args.len()
        ));
    }
    Ok(RuleExpr::Call { func, args })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Dollar(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("identifier '{}'", s),
            Token::Dollar(p) => format!("'${}'", p),
            Token::Str(s) => format!("string \"{}\"", s),
            Token::Num(n) => format!("number {}", n),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
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
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(other) => s.push(*other),
                                None => return Err("unterminated string literal".to_string()),
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                tokens.push(Token::Dollar(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{}'", text))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<RuleExpr, String> {
        match self.next() {
            None => Err("unexpected end of rule".to_string()),
            Some(Token::Str(s)) => Ok(RuleExpr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(RuleExpr::Literal(number_literal(n))),
            Some(Token::Dollar(path)) if path.is_empty() => Ok(RuleExpr::Current),
            Some(Token::Dollar(path)) => Ok(RuleExpr::DocPath(path)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let func = Func::from_name(&name)
                        .ok_or_else(|| format!("unknown function '{}'", name))?;
                    let args = self.args()?;
                    return finish_call(func, &name, args);
                }
                Ok(match name.to_lowercase().as_str() {
                    "true" => RuleExpr::Literal(Value::Bool(true)),
                    "false" => RuleExpr::Literal(Value::Bool(false)),
                    "null" => RuleExpr::Literal(Value::Null),
                    _ => RuleExpr::Column(name),
                })
            }
            Some(other) => Err(format!("unexpected {}", other.describe())),
        }
    }

    fn args(&mut self) -> Result<Vec<RuleExpr>, String> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(other) => return Err(format!("expected ',' or ')', found {}", other.describe())),
                None => return Err("missing ')'".to_string()),
            }
        }
    }
}

fn number_literal(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
