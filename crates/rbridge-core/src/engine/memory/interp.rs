//! Tree-walking evaluation over a workspace.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashMap;

use super::builtins;
use super::parser::{Arg, BinaryOp, Expr, UnaryOp};
use crate::error::{Error, Result};
use crate::value::{EngineValue, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE, is_na_real, real_na};

/// A function supplied by the host, called with the evaluated arguments.
pub type HostFunction = Arc<dyn Fn(&[EngineValue]) -> Result<EngineValue> + Send + Sync>;

/// Packages attached at startup, as `getOption("defaultPackages")` lists them.
pub(crate) const DEFAULT_PACKAGES: [&str; 6] =
    ["datasets", "utils", "grDevices", "graphics", "stats", "methods"];

pub(crate) const INTERRUPTED: &str = "evaluation interrupted";

/// Global workspace and session state.
#[derive(Debug)]
pub(crate) struct Workspace {
    pub vars: BTreeMap<String, EngineValue>,
    /// Search order, most recently attached first.
    pub attached: Vec<String>,
    pub installed: BTreeSet<String>,
    pub memory_limit: Option<f64>,
    pub output: String,
}

impl Default for Workspace {
    fn default() -> Self {
        let mut attached: Vec<String> = DEFAULT_PACKAGES.iter().rev().map(|s| s.to_string()).collect();
        attached.push("base".to_string());
        let installed = attached.iter().cloned().collect();
        Self {
            vars: BTreeMap::new(),
            attached,
            installed,
            memory_limit: None,
            output: String::new(),
        }
    }
}

pub(crate) struct Interp<'a> {
    pub ws: &'a mut Workspace,
    pub functions: &'a FxHashMap<String, HostFunction>,
    pub interrupt: &'a AtomicBool,
}

impl Interp<'_> {
    /// Evaluate statements in order, returning the last value.
    pub fn run(&mut self, stmts: &[Expr]) -> Result<EngineValue> {
        let mut last = EngineValue::Null;
        for stmt in stmts {
            self.checkpoint()?;
            last = self.eval(stmt)?;
        }
        Ok(last)
    }

    /// Fail if an interrupt is pending, consuming it.
    pub fn checkpoint(&self) -> Result<()> {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            Err(Error::Engine(INTERRUPTED.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<EngineValue> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Assign { name, value } => {
                let value = self.eval(value)?;
                self.ws.vars.insert(name.clone(), value.clone());
                Ok(value)
            }
            Expr::Block(stmts) => self.run(stmts),
            Expr::For { var, seq, body } => {
                let seq = self.eval(seq)?;
                for i in 0..seq.len() {
                    self.checkpoint()?;
                    self.ws.vars.insert(var.clone(), element(&seq, i));
                    self.eval(body)?;
                }
                Ok(EngineValue::Null)
            }
            Expr::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval(cond)?;
                if truthy(&cond)? {
                    self.eval(then)
                } else if let Some(otherwise) = otherwise {
                    self.eval(otherwise)
                } else {
                    Ok(EngineValue::Null)
                }
            }
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                unary(*op, &value)
            }
            Expr::Binary { op, lhs, rhs } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Call { name, args } => self.call(name, args),
        }
    }

    fn lookup(&self, name: &str) -> Result<EngineValue> {
        self.ws
            .vars
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("object '{}' not found", name)))
    }

    fn call(&mut self, name: &str, args: &[Arg]) -> Result<EngineValue> {
        if let Some(result) = builtins::call(self, name, args) {
            return result;
        }
        if let Some(function) = self.functions.get(name).cloned() {
            let values = args
                .iter()
                .map(|arg| self.eval(&arg.value))
                .collect::<Result<Vec<_>>>()?;
            return function(&values);
        }
        Err(Error::Engine(format!("could not find function \"{}\"", name)))
    }
}

/// Element `i` of a vector as a length-one value; list elements are unwrapped.
pub(crate) fn element(value: &EngineValue, i: usize) -> EngineValue {
    match value {
        EngineValue::Null => EngineValue::Null,
        EngineValue::Logical(v) => EngineValue::Logical(vec![v[i]]),
        EngineValue::Integer(v) => EngineValue::Integer(vec![v[i]]),
        EngineValue::Double(v) => EngineValue::Double(vec![v[i]]),
        EngineValue::String(v) => EngineValue::String(vec![v[i].clone()]),
        EngineValue::Factor { .. } => {
            EngineValue::String(vec![value.factor_level(i).map(str::to_string)])
        }
        EngineValue::List(entries) | EngineValue::DataFrame { columns: entries, .. } => {
            entries[i].value.clone()
        }
    }
}

/// Interpret the first element of `value` as a condition.
pub(crate) fn truthy(value: &EngineValue) -> Result<bool> {
    if value.is_empty() {
        return Err(Error::Engine("argument is of length zero".to_string()));
    }
    let missing = || Error::Engine("missing value where TRUE/FALSE needed".to_string());
    match value {
        EngineValue::Logical(v) if v[0] == LOGICAL_NA => Err(missing()),
        EngineValue::Logical(v) => Ok(v[0] != LOGICAL_FALSE),
        EngineValue::Integer(v) if v[0] == INTEGER_NA => Err(missing()),
        EngineValue::Integer(v) => Ok(v[0] != 0),
        EngineValue::Double(v) if v[0].is_nan() => Err(missing()),
        EngineValue::Double(v) => Ok(v[0] != 0.0),
        EngineValue::String(v) => match v[0].as_deref() {
            Some("TRUE" | "true" | "T" | "True") => Ok(true),
            Some("FALSE" | "false" | "F" | "False") => Ok(false),
            None => Err(missing()),
            Some(_) => Err(Error::Engine("argument is not interpretable as logical".to_string())),
        },
        other => Err(Error::Engine(format!(
            "argument of class {} is not interpretable as logical",
            other.class_name()
        ))),
    }
}

enum Numeric {
    Int(Vec<i32>),
    Real(Vec<f64>),
}

impl Numeric {
    fn len(&self) -> usize {
        match self {
            Numeric::Int(v) => v.len(),
            Numeric::Real(v) => v.len(),
        }
    }

    fn into_reals(self) -> Vec<f64> {
        match self {
            Numeric::Int(v) => v
                .into_iter()
                .map(|i| if i == INTEGER_NA { real_na() } else { i as f64 })
                .collect(),
            Numeric::Real(v) => v,
        }
    }
}

fn numeric(value: &EngineValue, context: &str) -> Result<Numeric> {
    match value {
        EngineValue::Null => Ok(Numeric::Int(Vec::new())),
        EngineValue::Logical(v) => Ok(Numeric::Int(
            v.iter()
                .map(|&b| if b == LOGICAL_NA { INTEGER_NA } else { b as i32 })
                .collect(),
        )),
        EngineValue::Integer(v) => Ok(Numeric::Int(v.clone())),
        EngineValue::Double(v) => Ok(Numeric::Real(v.clone())),
        other => Err(Error::Engine(format!(
            "non-numeric argument to {} ({})",
            context,
            other.class_name()
        ))),
    }
}

fn recycled_len(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 { 0 } else { a.max(b) }
}

pub(crate) fn unary(op: UnaryOp, value: &EngineValue) -> Result<EngineValue> {
    match op {
        UnaryOp::Neg => Ok(match numeric(value, "unary operator")? {
            Numeric::Int(v) => EngineValue::Integer(
                v.into_iter()
                    .map(|i| if i == INTEGER_NA { i } else { -i })
                    .collect(),
            ),
            Numeric::Real(v) => EngineValue::Double(v.into_iter().map(|d| -d).collect()),
        }),
        UnaryOp::Not => {
            let reals = numeric(value, "operator !")?.into_reals();
            Ok(EngineValue::Logical(
                reals
                    .into_iter()
                    .map(|d| match d {
                        d if d.is_nan() => LOGICAL_NA,
                        d if d == 0.0 => LOGICAL_TRUE,
                        _ => LOGICAL_FALSE,
                    })
                    .collect(),
            ))
        }
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &EngineValue, rhs: &EngineValue) -> Result<EngineValue> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => arithmetic(op, lhs, rhs),
        BinaryOp::Range => range(lhs, rhs),
        _ => compare(op, lhs, rhs),
    }
}

fn arithmetic(op: BinaryOp, lhs: &EngineValue, rhs: &EngineValue) -> Result<EngineValue> {
    let a = numeric(lhs, "binary operator")?;
    let b = numeric(rhs, "binary operator")?;
    let n = recycled_len(a.len(), b.len());

    if let (Numeric::Int(x), Numeric::Int(y)) = (&a, &b)
        && op != BinaryOp::Div
    {
        let values = (0..n)
            .map(|i| {
                let (p, q) = (x[i % x.len()], y[i % y.len()]);
                if p == INTEGER_NA || q == INTEGER_NA {
                    return INTEGER_NA;
                }
                let result = match op {
                    BinaryOp::Add => p.checked_add(q),
                    BinaryOp::Sub => p.checked_sub(q),
                    _ => p.checked_mul(q),
                };
                result.filter(|&v| v != INTEGER_NA).unwrap_or(INTEGER_NA)
            })
            .collect();
        return Ok(EngineValue::Integer(values));
    }

    let (x, y) = (a.into_reals(), b.into_reals());
    let values = (0..n)
        .map(|i| {
            let (p, q) = (x[i % x.len()], y[i % y.len()]);
            if is_na_real(p) || is_na_real(q) {
                return real_na();
            }
            match op {
                BinaryOp::Add => p + q,
                BinaryOp::Sub => p - q,
                BinaryOp::Mul => p * q,
                _ => p / q,
            }
        })
        .collect();
    Ok(EngineValue::Double(values))
}

/// Longest sequence `from:to` builds.
const MAX_RANGE_LEN: usize = 1 << 28;

fn range(lhs: &EngineValue, rhs: &EngineValue) -> Result<EngineValue> {
    let from = numeric(lhs, "operator :")?.into_reals();
    let to = numeric(rhs, "operator :")?.into_reals();
    let (Some(&from), Some(&to)) = (from.first(), to.first()) else {
        return Err(Error::Engine("argument of length 0".to_string()));
    };
    if from.is_nan() || to.is_nan() {
        return Err(Error::Engine("NA/NaN argument".to_string()));
    }

    let span = (to - from).abs().floor();
    if !span.is_finite() || span >= MAX_RANGE_LEN as f64 {
        return Err(Error::Engine("result would be too long a vector".to_string()));
    }
    let count = span as usize + 1;
    let step = if to >= from { 1.0 } else { -1.0 };
    let values = (0..count).map(|k| from + step * k as f64);

    let integral = from.fract() == 0.0 && from.abs() <= i32::MAX as f64 && to.abs() <= i32::MAX as f64;
    if integral {
        Ok(EngineValue::Integer(values.map(|v| v as i32).collect()))
    } else {
        Ok(EngineValue::Double(values.collect()))
    }
}

fn compare(op: BinaryOp, lhs: &EngineValue, rhs: &EngineValue) -> Result<EngineValue> {
    let textual = |v: &EngineValue| matches!(v, EngineValue::String(_) | EngineValue::Factor { .. });

    if textual(lhs) || textual(rhs) {
        let (x, y) = (lhs.as_strings(), rhs.as_strings());
        let n = recycled_len(x.len(), y.len());
        let values = (0..n)
            .map(|i| match (&x[i % x.len()], &y[i % y.len()]) {
                (Some(p), Some(q)) => logical(ordering_holds(op, p.cmp(q))),
                _ => LOGICAL_NA,
            })
            .collect();
        return Ok(EngineValue::Logical(values));
    }

    let x = numeric(lhs, "comparison")?.into_reals();
    let y = numeric(rhs, "comparison")?.into_reals();
    let n = recycled_len(x.len(), y.len());
    let values = (0..n)
        .map(|i| {
            let (p, q) = (x[i % x.len()], y[i % y.len()]);
            match p.partial_cmp(&q) {
                Some(ordering) => logical(ordering_holds(op, ordering)),
                None => LOGICAL_NA,
            }
        })
        .collect();
    Ok(EngineValue::Logical(values))
}

fn ordering_holds(op: BinaryOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        BinaryOp::Eq => ordering == Equal,
        BinaryOp::Ne => ordering != Equal,
        BinaryOp::Lt => ordering == Less,
        BinaryOp::Gt => ordering == Greater,
        BinaryOp::Le => ordering != Greater,
        _ => ordering != Less,
    }
}

fn logical(b: bool) -> i8 {
    if b { LOGICAL_TRUE } else { LOGICAL_FALSE }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::parser::parse;

    fn run(src: &str) -> Result<EngineValue> {
        let mut ws = Workspace::default();
        let functions = FxHashMap::default();
        let interrupt = AtomicBool::new(false);
        let mut interp = Interp {
            ws: &mut ws,
            functions: &functions,
            interrupt: &interrupt,
        };
        interp.run(&parse(src)?)
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run("1L + 2L").unwrap(), EngineValue::Integer(vec![3]));
        assert_eq!(run("1 + 2 * 3").unwrap(), EngineValue::Double(vec![7.0]));
        assert_eq!(run("c(1, 2, 3) * 2").unwrap(), EngineValue::Double(vec![2.0, 4.0, 6.0]));
        assert_eq!(run("NA_integer_ + 1L").unwrap(), EngineValue::Integer(vec![INTEGER_NA]));
        assert!(run("\"a\" + 1").is_err());
    }

    #[test]
    fn test_range() {
        assert_eq!(run("1:3").unwrap(), EngineValue::Integer(vec![1, 2, 3]));
        assert_eq!(run("3:1").unwrap(), EngineValue::Integer(vec![3, 2, 1]));
        assert_eq!(run("1.5:3").unwrap(), EngineValue::Double(vec![1.5, 2.5]));
    }

    #[test]
    fn test_unbounded_range_is_an_error() {
        for src in ["1:Inf", "-Inf:1", "1:1e12"] {
            let err = run(src).unwrap_err();
            assert!(
                err.to_string().contains("result would be too long a vector"),
                "{}: {}",
                src,
                err
            );
        }
    }

    #[test]
    fn test_for_loop_and_if() {
        let value = run("total <- 0; for (i in 1:4) if (i > 2) total <- total + i; total").unwrap();
        assert_eq!(value, EngineValue::Double(vec![7.0]));
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(run("\"a\" == \"a\"").unwrap(), EngineValue::logical(true));
        assert_eq!(run("!(2 < 1)").unwrap(), EngineValue::logical(true));
        assert_eq!(run("NA > 1").unwrap(), EngineValue::Logical(vec![LOGICAL_NA]));
    }

    #[test]
    fn test_unknown_object_and_function() {
        let err = run("missing_thing").unwrap_err();
        assert!(err.to_string().contains("object 'missing_thing' not found"));
        let err = run("nope(1)").unwrap_err();
        assert!(err.to_string().contains("could not find function"));
    }

    #[test]
    fn test_pending_interrupt_stops_run() {
        let mut ws = Workspace::default();
        let functions = FxHashMap::default();
        let interrupt = AtomicBool::new(true);
        let mut interp = Interp {
            ws: &mut ws,
            functions: &functions,
            interrupt: &interrupt,
        };
        let err = interp.run(&parse("x <- 1").unwrap()).unwrap_err();
        assert!(err.to_string().contains(INTERRUPTED));
        assert!(!ws.vars.contains_key("x"));
    }
}
