//! Formula text handling: `{expression}` extraction, field-path tokenizing,
//! numeric substitution and safe arithmetic evaluation.
//!
//! ## Pipeline
//!
//! ```text
//! "{plan.price * qty}" → "plan.price * qty" → tokens [plan.price, qty]
//!        → "12.5 * 3"  → whitelist [0-9+-*/().% ws] → parse → 37.5
//! ```
//!
//! Substituted text that fails the whitelist never reaches the parser. The
//! parser is a small recursive-descent grammar over numbers, `+ - * / %`,
//! unary sign and parentheses; there is no generic eval anywhere.

use std::collections::{BTreeSet, HashMap};

use nom::{
    branch::alt,
    character::complete::{char, digit0, digit1, multispace0, one_of},
    combinator::{all_consuming, map, map_res, opt, recognize},
    error::{convert_error, VerboseError},
    multi::fold_many0,
    sequence::{delimited, pair, preceded},
    IResult,
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::FormulaError;

static FORMULA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^\s*\{(.*)\}\s*$").expect("static formula pattern"));

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[A-Za-z_$][A-Za-z0-9_$]*(?:\.[A-Za-z0-9_$]+)*").expect("static path pattern")
});

static SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9+\-*/().%\s]*$").expect("static whitelist pattern"));

// ============================================================================
// Extraction
// ============================================================================

/// Inner expression of a `{expression}` formula, or `None` if the text does
/// not have that shape.
pub fn extract_expression(formula: &str) -> Option<&str> {
    FORMULA_RE
        .captures(formula)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Distinct field paths referenced by an expression, in first-use order.
pub fn extract_paths(expression: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PATH_RE
        .find_iter(expression)
        .map(|m| m.as_str())
        .filter(|p| seen.insert(*p))
        .map(str::to_string)
        .collect()
}

/// Top-level root names of a set of paths (`plan.price` → `plan`).
pub fn root_names(paths: &[String]) -> BTreeSet<String> {
    paths
        .iter()
        .map(|p| p.split('.').next().unwrap_or(p).to_string())
        .collect()
}

// ============================================================================
// Substitution and evaluation
// ============================================================================

/// Replace every path token with its numeric value. Unknown tokens become `0`;
/// negative numbers are parenthesized so `a-b` with `b = -2` stays well formed.
pub fn substitute(expression: &str, values: &HashMap<String, f64>) -> String {
    PATH_RE
        .replace_all(expression, |caps: &regex::Captures<'_>| {
            let n = values.get(&caps[0]).copied().unwrap_or(0.0);
            let n = if n.is_finite() { n } else { 0.0 };
            if n < 0.0 {
                format!("({n})")
            } else {
                format!("{n}")
            }
        })
        .into_owned()
}

/// Does the substituted text contain only arithmetic characters?
pub fn is_safe(text: &str) -> bool {
    SAFE_RE.is_match(text)
}

/// Split an expression at its top-level binary `+` / `-`. Each term comes
/// with the sign it contributes; unary signs stay inside their term.
pub fn split_terms(expression: &str) -> Vec<(f64, String)> {
    let mut terms = Vec::new();
    let mut sign = 1.0;
    let mut start = 0;
    let mut depth = 0i32;
    let mut after_operand = false;
    for (i, c) in expression.char_indices() {
        match c {
            '(' => {
                depth += 1;
                after_operand = false;
            }
            ')' => {
                depth -= 1;
                after_operand = true;
            }
            '+' | '-' if depth == 0 && after_operand => {
                terms.push((sign, expression[start..i].trim().to_string()));
                sign = if c == '+' { 1.0 } else { -1.0 };
                start = i + 1;
                after_operand = false;
            }
            c if c.is_whitespace() => {}
            c => after_operand = !matches!(c, '+' | '-' | '*' | '/' | '%'),
        }
    }
    terms.push((sign, expression[start..].trim().to_string()));
    terms
}

/// Substitute, whitelist and evaluate.
pub fn evaluate(expression: &str, values: &HashMap<String, f64>) -> Result<f64, FormulaError> {
    let text = substitute(expression, values);
    if !is_safe(&text) {
        return Err(FormulaError::UnsafeExpression(text));
    }
    evaluate_arithmetic(&text)
}

/// Evaluate whitelisted arithmetic text. Non-finite results are errors.
pub fn evaluate_arithmetic(text: &str) -> Result<f64, FormulaError> {
    if !is_safe(text) {
        return Err(FormulaError::UnsafeExpression(text.to_string()));
    }
    let value = match all_consuming(delimited(multispace0, expr, multispace0))(text) {
        Ok((_, value)) => value,
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            return Err(FormulaError::Parse {
                expr: text.to_string(),
                reason: convert_error(text, e),
            })
        }
        Err(nom::Err::Incomplete(_)) => {
            return Err(FormulaError::Parse {
                expr: text.to_string(),
                reason: "incomplete input".to_string(),
            })
        }
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(FormulaError::NonFinite)
    }
}

// ============================================================================
// Internal Parsers
// ============================================================================

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

fn ws<'a, O>(inner: impl FnMut(&'a str) -> Res<'a, O>) -> impl FnMut(&'a str) -> Res<'a, O> {
    delimited(multispace0, inner, multispace0)
}

/// expr := term (('+' | '-') term)*
fn expr(input: &str) -> Res<'_, f64> {
    let (input, init) = term(input)?;
    fold_many0(
        pair(ws(one_of("+-")), term),
        move || init,
        |acc, (op, rhs)| if op == '+' { acc + rhs } else { acc - rhs },
    )(input)
}

/// term := factor (('*' | '/' | '%') factor)*
fn term(input: &str) -> Res<'_, f64> {
    let (input, init) = factor(input)?;
    fold_many0(
        pair(ws(one_of("*/%")), factor),
        move || init,
        |acc, (op, rhs)| match op {
            '*' => acc * rhs,
            '/' => acc / rhs,
            _ => acc % rhs,
        },
    )(input)
}

/// factor := ('+' | '-') factor | '(' expr ')' | number
fn factor(input: &str) -> Res<'_, f64> {
    ws(alt((
        map(preceded(char('-'), factor), |v| -v),
        preceded(char('+'), factor),
        delimited(char('('), expr, ws(char(')'))),
        number,
    )))(input)
}

fn number(input: &str) -> Res<'_, f64> {
    map_res(
        recognize(alt((
            recognize(pair(digit1, opt(pair(char('.'), digit0)))),
            recognize(pair(char('.'), digit1)),
        ))),
        str::parse::<f64>,
    )(input)
}
