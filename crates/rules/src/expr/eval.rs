//! Tree-walking evaluator for compiled expressions.

use std::collections::HashMap;

use indexmap::IndexMap;

use super::parser::{BinaryOp, Expr, FnDef, Program, Stmt, UnaryOp};
use super::ExprError;

/// Upper bound on evaluated AST nodes per call; aborts runaway expressions.
const STEP_BUDGET: u64 = 200_000;

// ── Values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Value {
    /// Numeric view; strings are parsed, booleans never coerce.
    fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            Value::Str(s) => s.trim().parse().ok(),
            Value::Bool(_) => None,
        }
    }

    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    /// Render for the outcome vector. Whole numbers print without a fraction.
    pub fn render(&self) -> String {
        match self {
            Value::Num(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            Value::Num(n) => format!("{}", n),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

// ── Interpreter ─────────────────────────────────────────────────────

pub struct Interp<'a> {
    program: &'a Program,
    globals: &'a IndexMap<String, String>,
    steps: u64,
}

impl<'a> Interp<'a> {
    pub fn new(program: &'a Program, globals: &'a IndexMap<String, String>) -> Self {
        Self {
            program,
            globals,
            steps: 0,
        }
    }

    /// Call a function by name with already-lifted string arguments.
    pub fn call(&mut self, name: &str, args: &[String]) -> Result<Vec<Value>, ExprError> {
        let func = self
            .program
            .function(name)
            .ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;
        let values: Vec<Value> = args.iter().map(|a| Value::Str(a.clone())).collect();
        self.call_def(func, values)
    }

    fn call_def(&mut self, func: &FnDef, args: Vec<Value>) -> Result<Vec<Value>, ExprError> {
        if args.len() != func.params.len() {
            return Err(ExprError::Arity {
                function: func.name.clone(),
                expected: func.params.len(),
                got: args.len(),
            });
        }
        let mut locals: HashMap<String, Value> =
            func.params.iter().cloned().zip(args).collect();
        match self.exec_block(&func.body, &mut locals)? {
            Some(values) => Ok(values),
            None => Err(ExprError::NoReturn(func.name.clone())),
        }
    }

    fn tick(&mut self) -> Result<(), ExprError> {
        self.steps += 1;
        if self.steps > STEP_BUDGET {
            Err(ExprError::Budget)
        } else {
            Ok(())
        }
    }

    /// Execute a block; `Some` carries an early return.
    fn exec_block(
        &mut self,
        block: &[Stmt],
        locals: &mut HashMap<String, Value>,
    ) -> Result<Option<Vec<Value>>, ExprError> {
        for stmt in block {
            self.tick()?;
            match stmt {
                Stmt::Let { name, value } => {
                    let value = self.eval(value, locals)?;
                    locals.insert(name.clone(), value);
                }
                Stmt::Return(exprs) => {
                    let mut values = Vec::with_capacity(exprs.len());
                    for expr in exprs {
                        values.push(self.eval(expr, locals)?);
                    }
                    return Ok(Some(values));
                }
                Stmt::If { arms, otherwise } => {
                    let mut taken = false;
                    for (cond, body) in arms {
                        if self.eval(cond, locals)?.truthy() {
                            taken = true;
                            if let Some(ret) = self.exec_block(body, locals)? {
                                return Ok(Some(ret));
                            }
                            break;
                        }
                    }
                    if !taken {
                        if let Some(body) = otherwise {
                            if let Some(ret) = self.exec_block(body, locals)? {
                                return Ok(Some(ret));
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn eval(&mut self, expr: &Expr, locals: &HashMap<String, Value>) -> Result<Value, ExprError> {
        self.tick()?;
        match expr {
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Ident(name) => {
                if let Some(value) = locals.get(name) {
                    Ok(value.clone())
                } else if let Some(value) = self.globals.get(name) {
                    Ok(Value::Str(value.clone()))
                } else {
                    Err(ExprError::UnknownIdent(name.clone()))
                }
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, locals)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => value
                        .as_num()
                        .map(|n| Value::Num(-n))
                        .ok_or_else(|| ExprError::Type("negation of non-numeric value".into())),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.eval_binary(*op, lhs, rhs, locals),
            Expr::Call { name, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, locals)?);
                }
                self.call_any(name, values)
            }
        }
    }

    fn eval_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        locals: &HashMap<String, Value>,
    ) -> Result<Value, ExprError> {
        // Short-circuit logic first.
        match op {
            BinaryOp::And => {
                let left = self.eval(lhs, locals)?;
                if !left.truthy() {
                    return Ok(Value::Bool(false));
                }
                return Ok(Value::Bool(self.eval(rhs, locals)?.truthy()));
            }
            BinaryOp::Or => {
                let left = self.eval(lhs, locals)?;
                if left.truthy() {
                    return Ok(Value::Bool(true));
                }
                return Ok(Value::Bool(self.eval(rhs, locals)?.truthy()));
            }
            _ => {}
        }

        let left = self.eval(lhs, locals)?;
        let right = self.eval(rhs, locals)?;

        match op {
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div => {
                let (a, b) = match (left.as_num(), right.as_num()) {
                    (Some(a), Some(b)) => (a, b),
                    _ => return Err(ExprError::Type("arithmetic on non-numeric value".into())),
                };
                let result = match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    _ => unreachable!(),
                };
                Ok(Value::Num(result))
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                // Numeric when both sides lift, string equality otherwise.
                let equal = match (left.as_num(), right.as_num()) {
                    (Some(a), Some(b)) => a == b,
                    _ => left.render() == right.render(),
                };
                Ok(Value::Bool(if op == BinaryOp::Eq { equal } else { !equal }))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let ordering = match (left.as_num(), right.as_num()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => Some(left.render().cmp(&right.render())),
                };
                let ordering = ordering
                    .ok_or_else(|| ExprError::Type("comparison of incomparable values".into()))?;
                let result = match op {
                    BinaryOp::Lt => ordering.is_lt(),
                    BinaryOp::Le => ordering.is_le(),
                    BinaryOp::Gt => ordering.is_gt(),
                    BinaryOp::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                };
                Ok(Value::Bool(result))
            }
            BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
        }
    }

    /// Builtins first, then user-defined helper functions.
    fn call_any(&mut self, name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
        match name {
            "num" => {
                let value = single_arg(name, &args)?;
                value
                    .as_num()
                    .map(Value::Num)
                    .ok_or_else(|| ExprError::Type(format!("num(): '{}' is not numeric", value.render())))
            }
            "abs" => {
                let value = single_arg(name, &args)?;
                value
                    .as_num()
                    .map(|n| Value::Num(n.abs()))
                    .ok_or_else(|| ExprError::Type("abs() of non-numeric value".into()))
            }
            "min" | "max" => {
                if args.is_empty() {
                    return Err(ExprError::Type(format!("{}() needs at least one argument", name)));
                }
                let mut nums = Vec::with_capacity(args.len());
                for arg in &args {
                    nums.push(arg.as_num().ok_or_else(|| {
                        ExprError::Type(format!("{}() of non-numeric value", name))
                    })?);
                }
                let folded = if name == "min" {
                    nums.into_iter().fold(f64::INFINITY, f64::min)
                } else {
                    nums.into_iter().fold(f64::NEG_INFINITY, f64::max)
                };
                Ok(Value::Num(folded))
            }
            _ => {
                let func = self
                    .program
                    .function(name)
                    .ok_or_else(|| ExprError::UnknownFunction(name.to_string()))?;
                let mut values = self.call_def(func, args)?;
                if values.len() != 1 {
                    return Err(ExprError::Type(format!(
                        "helper '{}' must return exactly one value",
                        name
                    )));
                }
                Ok(values.remove(0))
            }
        }
    }
}

fn single_arg<'v>(name: &str, args: &'v [Value]) -> Result<&'v Value, ExprError> {
    if args.len() == 1 {
        Ok(&args[0])
    } else {
        Err(ExprError::Type(format!("{}() takes exactly one argument", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse;
    use super::*;

    fn run(source: &str, globals: &[(&str, &str)], args: &[&str]) -> Result<Vec<String>, ExprError> {
        let program = parse(source).unwrap();
        let globals: IndexMap<String, String> = globals
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut interp = Interp::new(&program, &globals);
        let values = interp.call("main", &args.iter().map(|s| s.to_string()).collect::<Vec<_>>())?;
        Ok(values.iter().map(Value::render).collect())
    }

    #[test]
    fn globals_resolve_as_strings() {
        let out = run(
            "fn main(v) if num(v) < num(var1) then return \"ok\" end return \"fail\" end",
            &[("var1", "50")],
            &["40"],
        )
        .unwrap();
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn numeric_comparison_on_string_arguments() {
        // "9" < "10" numerically, even though lexically it is not.
        let out = run(
            "fn main(a, b) if a < b then return \"lt\" end return \"ge\" end",
            &[],
            &["9", "10"],
        )
        .unwrap();
        assert_eq!(out, vec!["lt"]);
    }

    #[test]
    fn string_equality_when_not_numeric() {
        let out = run(
            "fn main(v) if v == \"good\" then return \"ok\" end return \"fail\" end",
            &[],
            &["good"],
        )
        .unwrap();
        assert_eq!(out, vec!["ok"]);
    }

    #[test]
    fn arithmetic_and_let() {
        let out = run(
            "fn main(a, b) let v = num(a) * 2 + num(b) * -3 return v end",
            &[],
            &["2", "1"],
        )
        .unwrap();
        assert_eq!(out, vec!["1"]);
    }

    #[test]
    fn multiple_returns() {
        let out = run(
            "fn main(metric, v) if num(v) < 50 then return \"ok\", metric end return \"fail\", metric end",
            &[],
            &["pattern1.metric1@asset5", "40"],
        )
        .unwrap();
        assert_eq!(out, vec!["ok", "pattern1.metric1@asset5"]);
    }

    #[test]
    fn helper_function_call() {
        let out = run(
            "fn double(v) return num(v) * 2 end fn main(v) return double(v) end",
            &[],
            &["21"],
        )
        .unwrap();
        assert_eq!(out, vec!["42"]);
    }

    #[test]
    fn unknown_identifier_errors() {
        let err = run("fn main(v) return missing end", &[], &["1"]).unwrap_err();
        assert!(matches!(err, ExprError::UnknownIdent(name) if name == "missing"));
    }

    #[test]
    fn arity_mismatch_errors() {
        let err = run("fn main(a, b) return a end", &[], &["1"]).unwrap_err();
        assert!(matches!(err, ExprError::Arity { expected: 2, got: 1, .. }));
    }

    #[test]
    fn recursion_hits_step_budget() {
        let err = run("fn main(v) return main(v) end", &[], &["1"]).unwrap_err();
        assert!(matches!(err, ExprError::Budget));
    }

    #[test]
    fn fall_through_without_return_errors() {
        let err = run("fn main(v) if false then return \"x\" end end", &[], &["1"]).unwrap_err();
        assert!(matches!(err, ExprError::NoReturn(_)));
    }

    #[test]
    fn builtins() {
        assert_eq!(run("fn main(v) return abs(0 - num(v)) end", &[], &["3"]).unwrap(), vec!["3"]);
        assert_eq!(run("fn main(v) return min(num(v), 2, 7) end", &[], &["5"]).unwrap(), vec!["2"]);
        assert_eq!(run("fn main(v) return max(num(v), 2, 7) end", &[], &["5"]).unwrap(), vec!["7"]);
    }
}
