//! Embedded expression sandbox.
//!
//! Each rule carries a small program in a purpose-built expression language.
//! The source must define `fn main(...)` whose arity matches the argument
//! vector the evaluator passes; every call returns the rule's
//! `outcome_item_count` strings, the first being the outcome label.
//!
//! ```text
//! fn main(value)
//!     if num(value) < num(low_critical) then return "low_critical" end
//!     if num(value) < num(low_warning)  then return "low_warning"  end
//!     if num(value) > num(high_critical) then return "high_critical" end
//!     if num(value) > num(high_warning)  then return "high_warning"  end
//!     return "ok"
//! end
//! ```
//!
//! Every rule owns its own [`Sandbox`]: globals are the rule's variables
//! (installed as string bindings at compile time), no state survives between
//! calls, and a step budget aborts runaway programs.

mod eval;
mod lexer;
mod parser;

use indexmap::IndexMap;
use thiserror::Error;

use self::eval::{Interp, Value};
use self::parser::Program;

/// Errors from compiling or running an expression.
#[derive(Error, Debug)]
pub enum ExprError {
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("expression does not define 'main'")]
    MissingMain,

    #[error("'{function}' expects {expected} argument(s), got {got}")]
    Arity {
        function: String,
        expected: usize,
        got: usize,
    },

    #[error("unknown variable '{0}'")]
    UnknownIdent(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("step budget exceeded")]
    Budget,

    #[error("'{0}' finished without returning")]
    NoReturn(String),

    #[error("expected {expected} outcome item(s), got {got}")]
    ReturnCount { expected: usize, got: usize },
}

/// A compiled expression bound to one rule's variables.
#[derive(Debug, Clone)]
pub struct Sandbox {
    program: Program,
    globals: IndexMap<String, String>,
    outcome_items: usize,
}

impl Sandbox {
    /// Compile source with the rule's variables as globals.
    ///
    /// Fails when the source does not parse or defines no `main`.
    pub fn compile(
        source: &str,
        globals: &IndexMap<String, String>,
        outcome_items: usize,
    ) -> Result<Self, ExprError> {
        let program = parser::parse(source)?;
        if program.function("main").is_none() {
            return Err(ExprError::MissingMain);
        }
        Ok(Self {
            program,
            globals: globals.clone(),
            outcome_items,
        })
    }

    /// Run `main` over string arguments, yielding `outcome_items` strings.
    pub fn evaluate(&self, args: &[String]) -> Result<Vec<String>, ExprError> {
        let mut interp = Interp::new(&self.program, &self.globals);
        let values = interp.call("main", args)?;
        if values.len() != self.outcome_items {
            return Err(ExprError::ReturnCount {
                expected: self.outcome_items,
                got: values.len(),
            });
        }
        Ok(values.iter().map(Value::render).collect())
    }

    pub fn outcome_items(&self) -> usize {
        self.outcome_items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globals(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const THRESHOLD: &str = r#"
        fn main(value)
            if num(value) < num(low_critical) then return "low_critical" end
            if num(value) < num(low_warning)  then return "low_warning"  end
            if num(value) > num(high_critical) then return "high_critical" end
            if num(value) > num(high_warning)  then return "high_warning"  end
            return "ok"
        end"#;

    #[test]
    fn threshold_bands() {
        let sandbox = Sandbox::compile(
            THRESHOLD,
            &globals(&[
                ("low_critical", "30"),
                ("low_warning", "40"),
                ("high_warning", "50"),
                ("high_critical", "60"),
            ]),
            1,
        )
        .unwrap();

        assert_eq!(sandbox.evaluate(&["25".into()]).unwrap(), vec!["low_critical"]);
        assert_eq!(sandbox.evaluate(&["35".into()]).unwrap(), vec!["low_warning"]);
        assert_eq!(sandbox.evaluate(&["45".into()]).unwrap(), vec!["ok"]);
        assert_eq!(sandbox.evaluate(&["55".into()]).unwrap(), vec!["high_warning"]);
        assert_eq!(sandbox.evaluate(&["65".into()]).unwrap(), vec!["high_critical"]);
    }

    #[test]
    fn missing_main_rejected_at_compile() {
        let err = Sandbox::compile("fn other(v) return v end", &globals(&[]), 1).unwrap_err();
        assert!(matches!(err, ExprError::MissingMain));
    }

    #[test]
    fn syntax_error_rejected_at_compile() {
        let err = Sandbox::compile("fn main(v return v end", &globals(&[]), 1).unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
    }

    #[test]
    fn outcome_item_count_enforced() {
        let sandbox = Sandbox::compile("fn main(v) return \"ok\" end", &globals(&[]), 2).unwrap();
        let err = sandbox.evaluate(&["1".into()]).unwrap_err();
        assert!(matches!(err, ExprError::ReturnCount { expected: 2, got: 1 }));
    }

    #[test]
    fn sandboxes_are_isolated() {
        let a = Sandbox::compile(
            "fn main(v) return threshold end",
            &globals(&[("threshold", "10")]),
            1,
        )
        .unwrap();
        let b = Sandbox::compile(
            "fn main(v) return threshold end",
            &globals(&[("threshold", "99")]),
            1,
        )
        .unwrap();
        assert_eq!(a.evaluate(&["_".into()]).unwrap(), vec!["10"]);
        assert_eq!(b.evaluate(&["_".into()]).unwrap(), vec!["99"]);
    }
}
