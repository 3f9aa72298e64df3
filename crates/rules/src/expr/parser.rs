//! Recursive-descent parser producing the expression AST.

use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;

// ── AST ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub functions: Vec<FnDef>,
}

impl Program {
    pub fn function(&self, name: &str) -> Option<&FnDef> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    If { arms: Vec<(Expr, Vec<Stmt>)>, otherwise: Option<Vec<Stmt>> },
    Return(Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Unary { op: UnaryOp, operand: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

// ── Parser ──────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

/// Parse expression source into a [`Program`].
pub fn parse(source: &str) -> Result<Program, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut functions = Vec::new();
    while !parser.at_end() {
        functions.push(parser.fn_def()?);
    }
    if functions.is_empty() {
        return Err(ExprError::Parse {
            line: 1,
            message: "expression defines no function".into(),
        });
    }
    Ok(Program { functions })
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|t| t.token.clone());
        self.pos += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ExprError> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(name),
            _ => Err(self.error(format!("expected {}", what))),
        }
    }

    fn fn_def(&mut self) -> Result<FnDef, ExprError> {
        self.expect(Token::Fn, "'fn'")?;
        let name = self.ident("function name")?;
        self.expect(Token::LParen, "'(' after function name")?;
        let mut params = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                params.push(self.ident("parameter name")?);
                if self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')' after parameters")?;
        let body = self.block(&[Token::End])?;
        self.expect(Token::End, "'end' closing function body")?;
        Ok(FnDef { name, params, body })
    }

    /// Parse statements until one of `until` is at the cursor (not consumed).
    fn block(&mut self, until: &[Token]) -> Result<Vec<Stmt>, ExprError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Some(token) if until.contains(token) => return Ok(stmts),
                Some(_) => stmts.push(self.stmt()?),
                None => return Err(self.error("unexpected end of expression")),
            }
        }
    }

    fn stmt(&mut self) -> Result<Stmt, ExprError> {
        match self.peek() {
            Some(Token::Let) => {
                self.pos += 1;
                let name = self.ident("variable name after 'let'")?;
                self.expect(Token::Assign, "'=' in let binding")?;
                let value = self.expr()?;
                Ok(Stmt::Let { name, value })
            }
            Some(Token::Return) => {
                self.pos += 1;
                let mut values = vec![self.expr()?];
                while self.peek() == Some(&Token::Comma) {
                    self.pos += 1;
                    values.push(self.expr()?);
                }
                Ok(Stmt::Return(values))
            }
            Some(Token::If) => self.if_stmt(),
            _ => Err(self.error("expected 'let', 'if' or 'return'")),
        }
    }

    fn if_stmt(&mut self) -> Result<Stmt, ExprError> {
        self.expect(Token::If, "'if'")?;
        let mut arms = Vec::new();
        let cond = self.expr()?;
        self.expect(Token::Then, "'then' after condition")?;
        let body = self.block(&[Token::Elif, Token::Else, Token::End])?;
        arms.push((cond, body));

        let mut otherwise = None;
        loop {
            match self.peek() {
                Some(Token::Elif) => {
                    self.pos += 1;
                    let cond = self.expr()?;
                    self.expect(Token::Then, "'then' after condition")?;
                    let body = self.block(&[Token::Elif, Token::Else, Token::End])?;
                    arms.push((cond, body));
                }
                Some(Token::Else) => {
                    self.pos += 1;
                    otherwise = Some(self.block(&[Token::End])?);
                    break;
                }
                _ => break,
            }
        }
        self.expect(Token::End, "'end' closing if")?;
        Ok(Stmt::If { arms, otherwise })
    }

    // expr := or_expr
    fn expr(&mut self) -> Result<Expr, ExprError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Binary {
                op: BinaryOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.cmp_expr()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let rhs = self.cmp_expr()?;
            lhs = Expr::Binary {
                op: BinaryOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    // Single, non-associative comparison.
    fn cmp_expr(&mut self) -> Result<Expr, ExprError> {
        let lhs = self.add_expr()?;
        let op = match self.peek() {
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.add_expr()?;
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn add_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.mul_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn mul_expr(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary_expr()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary_expr(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(self.unary_expr()?),
                })
            }
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(self.unary_expr()?),
                })
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Num(value)) => Ok(Expr::Num(value)),
            Some(Token::Str(text)) => Ok(Expr::Str(text)),
            Some(Token::True) => Ok(Expr::Bool(true)),
            Some(Token::False) => Ok(Expr::Bool(false)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen, "')' closing call")?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            _ => Err(self.error("expected an expression")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_main() {
        let program = parse("fn main(v) return v end").unwrap();
        let main = program.function("main").unwrap();
        assert_eq!(main.params, vec!["v"]);
        assert_eq!(main.body, vec![Stmt::Return(vec![Expr::Ident("v".into())])]);
    }

    #[test]
    fn parse_if_elif_else() {
        let source = r#"
            fn main(v)
                if num(v) < 10 then return "low"
                elif num(v) > 90 then return "high"
                else return "ok"
                end
            end"#;
        let program = parse(source).unwrap();
        let main = program.function("main").unwrap();
        match &main.body[0] {
            Stmt::If { arms, otherwise } => {
                assert_eq!(arms.len(), 2);
                assert!(otherwise.is_some());
            }
            other => panic!("expected if statement, got {:?}", other),
        }
    }

    #[test]
    fn precedence_and_over_or() {
        let program = parse("fn main(a, b, c) return a or b and c end").unwrap();
        let main = program.function("main").unwrap();
        match &main.body[0] {
            Stmt::Return(values) => match &values[0] {
                Expr::Binary { op: BinaryOp::Or, rhs, .. } => {
                    assert!(matches!(**rhs, Expr::Binary { op: BinaryOp::And, .. }));
                }
                other => panic!("expected or at the top, got {:?}", other),
            },
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn multiple_return_values() {
        let program = parse("fn main(metric, v) return \"ok\", metric end").unwrap();
        let main = program.function("main").unwrap();
        match &main.body[0] {
            Stmt::Return(values) => assert_eq!(values.len(), 2),
            other => panic!("expected return, got {:?}", other),
        }
    }

    #[test]
    fn helper_functions_allowed() {
        let source = r#"
            fn band(v) return num(v) / 10 end
            fn main(v) return band(v) end"#;
        let program = parse(source).unwrap();
        assert!(program.function("band").is_some());
        assert!(program.function("main").is_some());
    }

    #[test]
    fn missing_end_is_a_parse_error() {
        assert!(matches!(
            parse("fn main(v) return v"),
            Err(ExprError::Parse { .. })
        ));
    }

    #[test]
    fn empty_source_is_a_parse_error() {
        assert!(matches!(parse("   "), Err(ExprError::Parse { .. })));
    }
}
