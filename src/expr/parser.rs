//! Recursive-descent parser producing the whitelisted expression tree
//!
//! Precedence, loosest first: `or`, `and`, `not`, comparisons and membership
//! (chainable), `+ -`, `* / %`, unary `- +`, atoms. Anything outside this
//! grammar that is recognizably a construct (call, attribute, subscript,
//! assignment, forbidden keyword) fails with [`ExprError::Unsafe`].

use super::lexer::{tokenize, Spanned, Token};
use super::value::Value;
use super::ExprError;

/// Maximum accepted source length in bytes
const MAX_SOURCE_BYTES: usize = 64 * 1024;
/// Maximum nesting depth of sub-expressions
const MAX_NESTING: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtE => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtE => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
        }
    }
}

/// Parsed condition
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `first op1 e1 op2 e2 ...`; every link must hold
    Compare {
        first: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

/// Parse a source string into an expression tree
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(ExprError::TooComplex(format!(
            "{} bytes (max {MAX_SOURCE_BYTES})",
            source.len()
        )));
    }
    if source.trim().is_empty() {
        return Err(ExprError::Syntax {
            message: "empty expression".to_string(),
            position: 0,
        });
    }

    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        end: source.len(),
    };
    let expr = parser.expression()?;

    if let Some(next) = parser.peek_spanned() {
        return Err(parser.unexpected(next.clone(), "end of expression"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_spanned(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn position(&self) -> usize {
        self.peek_spanned().map(|s| s.pos).unwrap_or(self.end)
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(s) if &s.token == token => Ok(()),
            Some(s) => Err(self.unexpected(s, what)),
            None => Err(ExprError::Syntax {
                message: format!("expected {what}, found end of expression"),
                position: self.end,
            }),
        }
    }

    /// Classify a token found where it does not belong
    fn unexpected(&self, found: Spanned, expected: &str) -> ExprError {
        match found.token {
            Token::Forbidden(op) => ExprError::Unsafe(describe_forbidden(&op)),
            Token::ForbiddenKeyword(kw) => ExprError::Unsafe(format!("'{kw}'")),
            Token::LParen => ExprError::Unsafe("function call".to_string()),
            Token::LBracket => ExprError::Unsafe("subscript".to_string()),
            other => ExprError::Syntax {
                message: format!("expected {expected}, found {other:?}"),
                position: found.pos,
            },
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ExprError::TooComplex(format!(
                "nesting deeper than {MAX_NESTING} at {}",
                self.position()
            )));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let result = self.or_expr();
        self.leave();
        result
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.and_expr()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.and_expr()?);
        }
        Ok(Expr::Or(operands))
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.not_expr()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.not_expr()?);
        }
        Ok(Expr::And(operands))
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Not(Box::new(operand?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let first = self.arith()?;
        let mut rest = Vec::new();

        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtE) => CmpOp::LtE,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtE) => CmpOp::GtE,
                Some(Token::In) => CmpOp::In,
                Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }

        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    /// Each fold deepens the tree by one level, so it counts against the nesting limit
    fn arith(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.enter()?;
            let right = self.term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let base = self.depth;
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => {
                    self.depth = base;
                    return Ok(left);
                }
            };
            self.pos += 1;
            self.enter()?;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let wrap: fn(Box<Expr>) -> Expr = match self.peek() {
            Some(Token::Minus) => Expr::Neg,
            Some(Token::Plus) => Expr::Pos,
            _ => return self.postfix(),
        };
        self.pos += 1;
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(wrap(Box::new(operand?)))
    }

    /// An atom followed by anything that would turn it into a call,
    /// subscript or attribute access is rejected
    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let atom = self.atom()?;
        match self.peek() {
            Some(Token::LParen) => Err(ExprError::Unsafe("function call".to_string())),
            Some(Token::LBracket) => Err(ExprError::Unsafe("subscript".to_string())),
            Some(Token::Forbidden(op)) if op == "." => {
                Err(ExprError::Unsafe("attribute access".to_string()))
            }
            _ => Ok(atom),
        }
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let position = self.position();
        let Some(spanned) = self.advance() else {
            return Err(ExprError::Syntax {
                message: "unexpected end of expression".to_string(),
                position,
            });
        };

        match spanned.token {
            Token::Int(i) => Ok(Expr::Literal(Value::Int(i))),
            Token::Float(f) => Ok(Expr::Literal(Value::Float(f))),
            Token::Str(s) => Ok(Expr::Literal(Value::Str(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::None => Ok(Expr::Literal(Value::None)),
            Token::Name(name) if name.starts_with("__") => {
                Err(ExprError::Unsafe(format!("dunder name '{name}'")))
            }
            Token::Name(name) => Ok(Expr::Name(name)),
            Token::LParen => self.paren(),
            Token::LBracket => {
                let items = self.sequence(&Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                if self.peek() == Some(&Token::RBrace) {
                    return Err(ExprError::Unsafe("dict literal".to_string()));
                }
                let items = self.sequence(&Token::RBrace, "'}'")?;
                Ok(Expr::Set(items))
            }
            other => Err(self.unexpected(
                Spanned {
                    token: other,
                    pos: spanned.pos,
                },
                "a value",
            )),
        }
    }

    /// `()` is an empty tuple, `(x)` grouping, `(x,)` / `(x, y)` a tuple
    fn paren(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::RParen) {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.expression()?;
        if self.eat(&Token::RParen) {
            return Ok(first);
        }
        self.expect(&Token::Comma, "')' or ','")?;
        let mut items = vec![first];
        items.extend(self.sequence(&Token::RParen, "')'")?);
        Ok(Expr::Tuple(items))
    }

    /// Comma-separated items up to `close`; a trailing comma is allowed
    fn sequence(&mut self, close: &Token, what: &str) -> Result<Vec<Expr>, ExprError> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.expression()?);
            if self.eat(close) {
                return Ok(items);
            }
            let what = format!("',' or {what}");
            self.expect(&Token::Comma, &what)?;
        }
    }
}

fn describe_forbidden(op: &str) -> String {
    match op {
        "=" => "assignment".to_string(),
        ":=" => "assignment expression".to_string(),
        "." => "attribute access".to_string(),
        ":" => "dict or slice syntax".to_string(),
        op if op.ends_with('=') => format!("augmented assignment '{op}'"),
        op => format!("operator '{op}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("a or b and not c").unwrap();
        match expr {
            Expr::Or(operands) => {
                assert_eq!(operands.len(), 2);
                assert!(matches!(
                    &operands[1],
                    Expr::And(inner) if matches!(inner[1], Expr::Not(_))
                ));
            }
            other => panic!("Expected Or, got {:?}", other),
        }

        let expr = parse("1 + 2 * 3").unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinOp::Add, .. }));
    }

    #[test]
    fn test_chained_comparison() {
        match parse("0 <= x < 10").unwrap() {
            Expr::Compare { rest, .. } => {
                assert_eq!(rest.len(), 2);
                assert_eq!(rest[0].0, CmpOp::LtE);
                assert_eq!(rest[1].0, CmpOp::Lt);
            }
            other => panic!("Expected Compare, got {:?}", other),
        }
    }

    #[test]
    fn test_not_in() {
        match parse("x not in [1, 2]").unwrap() {
            Expr::Compare { rest, .. } => assert_eq!(rest[0].0, CmpOp::NotIn),
            other => panic!("Expected Compare, got {:?}", other),
        }
    }

    #[test]
    fn test_collections() {
        assert!(matches!(parse("(1, 2)").unwrap(), Expr::Tuple(items) if items.len() == 2));
        assert!(matches!(parse("(1,)").unwrap(), Expr::Tuple(items) if items.len() == 1));
        assert!(matches!(parse("(1)").unwrap(), Expr::Literal(Value::Int(1))));
        assert!(matches!(parse("{1, 2}").unwrap(), Expr::Set(items) if items.len() == 2));
        assert!(matches!(parse("[]").unwrap(), Expr::List(items) if items.is_empty()));
    }

    #[test]
    fn test_unsafe_constructs() {
        for src in [
            "__class__",
            "open('x')",
            "value.real",
            "x[0]",
            "x = 1",
            "(y := 2)",
            "lambda: 1",
            "{}",
            "{'a': 1}",
            "2 ** 8",
            "1 if x else 2",
            "import os",
        ] {
            assert!(
                matches!(parse(src), Err(ExprError::Unsafe(_))),
                "expected unsafe for {src:?}, got {:?}",
                parse(src)
            );
        }
    }

    #[test]
    fn test_syntax_errors() {
        for src in ["", "x >", "(1, 2", "1 2", "and"] {
            assert!(
                matches!(parse(src), Err(ExprError::Syntax { .. })),
                "expected syntax error for {src:?}, got {:?}",
                parse(src)
            );
        }
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(parse(&deep), Err(ExprError::TooComplex(_))));
    }

    #[test]
    fn test_operator_chain_limit() {
        let long_sum = format!("value == 1{}", "+1".repeat(1000));
        assert!(matches!(parse(&long_sum), Err(ExprError::TooComplex(_))));

        let long_product = format!("2{}", "*2".repeat(1000));
        assert!(matches!(parse(&long_product), Err(ExprError::TooComplex(_))));

        let short_sum = format!("1{}", "+1".repeat(20));
        assert!(parse(&short_sum).is_ok());
        let grouped = format!("({})", ["1+1"; 20].join(") + ("));
        assert!(parse(&grouped).is_ok());
    }
}
