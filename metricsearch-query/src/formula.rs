//! Calculated-metric formula parsing and evaluation
//!
//! Formulas are plain arithmetic over positional query references, e.g.
//! `(query1 - query2) / query1 * 100`. `queryN` refers to the N-th
//! contributing response in batch order (1-based). The expression is parsed
//! into an AST and evaluated per bucket key; nothing outside this grammar is
//! accepted.

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::character::complete::{char, digit1, multispace0};
use nom::combinator::{map, map_res};
use nom::number::complete::double;
use nom::sequence::{delimited, preceded};
use nom::IResult;

use metricsearch_core::error::{SearchError, SearchResult};

/// Binary operators, by precedence level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parsed formula expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// 1-based reference to a contributing query response
    QueryRef(usize),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    /// Evaluate against the per-key metric values of the contributing
    /// responses, where `values[0]` is `query1`.
    pub fn evaluate(&self, values: &[f64]) -> SearchResult<f64> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::QueryRef(n) => values.get(n - 1).copied().ok_or_else(|| {
                SearchError::formula(format!(
                    "Formula references query{n} but only {} queries contribute",
                    values.len()
                ))
            }),
            Expr::Neg(inner) => Ok(-inner.evaluate(values)?),
            Expr::Binary { op, lhs, rhs } => {
                let lhs = lhs.evaluate(values)?;
                let rhs = rhs.evaluate(values)?;
                Ok(match op {
                    BinOp::Add => lhs + rhs,
                    BinOp::Sub => lhs - rhs,
                    BinOp::Mul => lhs * rhs,
                    BinOp::Div => lhs / rhs,
                })
            }
        }
    }

    /// Largest query index referenced by the expression, 0 when none.
    pub fn max_query_ref(&self) -> usize {
        match self {
            Expr::Number(_) => 0,
            Expr::QueryRef(n) => *n,
            Expr::Neg(inner) => inner.max_query_ref(),
            Expr::Binary { lhs, rhs, .. } => lhs.max_query_ref().max(rhs.max_query_ref()),
        }
    }
}

/// Parse a formula string into an [`Expr`].
pub fn parse_formula(input: &str) -> SearchResult<Expr> {
    match expr(input) {
        Ok((rest, parsed)) if rest.trim().is_empty() => Ok(parsed),
        Ok((rest, _)) => Err(SearchError::formula(format!(
            "Unexpected trailing input in formula: '{rest}'"
        ))),
        Err(e) => Err(SearchError::formula(format!(
            "Invalid formula '{input}': {e}"
        ))),
    }
}

fn expr(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = term(input)?;
    loop {
        let (rest, _) = multispace0(input)?;
        let op = match rest.chars().next() {
            Some('+') => BinOp::Add,
            Some('-') => BinOp::Sub,
            _ => return Ok((input, lhs)),
        };
        let (rest, rhs) = term(&rest[1..])?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
        input = rest;
    }
}

fn term(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = factor(input)?;
    loop {
        let (rest, _) = multispace0(input)?;
        let op = match rest.chars().next() {
            Some('*') => BinOp::Mul,
            Some('/') => BinOp::Div,
            _ => return Ok((input, lhs)),
        };
        let (rest, rhs) = factor(&rest[1..])?;
        lhs = Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        };
        input = rest;
    }
}

fn factor(input: &str) -> IResult<&str, Expr> {
    preceded(
        multispace0,
        alt((
            map(
                preceded(char('-'), factor),
                |inner| Expr::Neg(Box::new(inner)),
            ),
            delimited(
                char('('),
                expr,
                preceded(multispace0, char(')')),
            ),
            query_ref,
            map(double, Expr::Number),
        )),
    )(input)
}

fn query_ref(input: &str) -> IResult<&str, Expr> {
    map(
        preceded(
            tag("query"),
            map_res(digit1, |digits: &str| digits.parse::<usize>()),
        ),
        Expr::QueryRef,
    )(input)
}
