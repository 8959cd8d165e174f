//! 参考引擎使用的小型表达式语言
//!
//! 支持数字、列名（可含 `.`，如 `truth.x_NOSYS`）、四则运算、比较、
//! `&& || !`、括号与少量数学函数。布尔值以 1.0 / 0.0 表示。
//!
//! 优先级（低 → 高）：`||`，`&&`，比较，`+ -`，`* /`，一元 `- !`，原子。

use logos::Logos;
use crate::common::{Result, SystError};

/// 括号、函数调用与一元运算符的最大嵌套层数
pub const MAX_NESTING: usize = 128;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[token("(")]  LParen,
    #[token(")")]  RParen,
    #[token(",")]  Comma,
    #[token("+")]  Plus,
    #[token("-")]  Minus,
    #[token("*")]  Star,
    #[token("/")]  Slash,
    #[token("&&")] And,
    #[token("||")] Or,
    #[token("!")]  Not,
    #[token("==")] Eq,
    #[token("!=")] Ne,
    #[token("<")]  Lt,
    #[token("<=")] Le,
    #[token(">")]  Gt,
    #[token(">=")] Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp { Add, Sub, Mul, Div, Lt, Le, Gt, Ge, Eq, Ne, And, Or }

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func { Abs, Sqrt, Exp, Log, Sin, Cos, Cosh, Sinh, Min, Max, Pow }

impl Func {
    fn lookup(name: &str) -> Option<(Self, usize)> {
        let f = match name {
            "abs"  => (Self::Abs, 1),
            "sqrt" => (Self::Sqrt, 1),
            "exp"  => (Self::Exp, 1),
            "log"  => (Self::Log, 1),
            "sin"  => (Self::Sin, 1),
            "cos"  => (Self::Cos, 1),
            "cosh" => (Self::Cosh, 1),
            "sinh" => (Self::Sinh, 1),
            "min"  => (Self::Min, 2),
            "max"  => (Self::Max, 2),
            "pow"  => (Self::Pow, 2),
            _      => return None,
        };
        Some(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(f64),
    Var(usize),
    Neg(Box<Node>),
    Not(Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Call(Func, Vec<Node>),
}

fn truth(x: f64) -> bool { x != 0.0 }
fn flag(b: bool) -> f64 { if b { 1.0 } else { 0.0 } }

impl Node {
    fn eval(&self, vars: &[f64]) -> f64 {
        match self {
            Self::Number(x) => *x,
            Self::Var(i)    => vars[*i],
            Self::Neg(e)    => -e.eval(vars),
            Self::Not(e)    => flag(!truth(e.eval(vars))),
            Self::Binary(op, l, r) => {
                let a = l.eval(vars);
                match op {
                    BinOp::And => return flag(truth(a) && truth(r.eval(vars))),
                    BinOp::Or  => return flag(truth(a) || truth(r.eval(vars))),
                    _ => {}
                }
                let b = r.eval(vars);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => a / b,
                    BinOp::Lt  => flag(a < b),
                    BinOp::Le  => flag(a <= b),
                    BinOp::Gt  => flag(a > b),
                    BinOp::Ge  => flag(a >= b),
                    BinOp::Eq  => flag(a == b),
                    BinOp::Ne  => flag(a != b),
                    BinOp::And | BinOp::Or => unreachable!(),
                }
            }
            Self::Call(func, args) => {
                let x = args[0].eval(vars);
                match func {
                    Func::Abs  => x.abs(),
                    Func::Sqrt => x.sqrt(),
                    Func::Exp  => x.exp(),
                    Func::Log  => x.ln(),
                    Func::Sin  => x.sin(),
                    Func::Cos  => x.cos(),
                    Func::Cosh => x.cosh(),
                    Func::Sinh => x.sinh(),
                    Func::Min  => x.min(args[1].eval(vars)),
                    Func::Max  => x.max(args[1].eval(vars)),
                    Func::Pow  => x.powf(args[1].eval(vars)),
                }
            }
        }
    }
}

// ── 编译结果 ──────────────────────────────────────────────────────────────────

/// 已解析的表达式；`variables` 为引用到的列名（按首次出现顺序，去重）
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    root:          Node,
    pub variables: Vec<String>,
}

impl Expression {
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for (tok, span) in Token::lexer(text).spanned() {
            let tok = tok.map_err(|_| SystError::Expression(
                format!("unexpected character at {} in {text:?}", span.start)))?;
            tokens.push(tok);
        }
        let mut parser = Parser { tokens, pos: 0, depth: 0, variables: vec![], text };
        let root = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("trailing input"));
        }
        Ok(Self { root, variables: parser.variables })
    }

    /// `values` 与 `variables` 一一对应
    pub fn eval(&self, values: &[f64]) -> f64 {
        self.root.eval(values)
    }
}

// ── 递归下降 ──────────────────────────────────────────────────────────────────

struct Parser<'a> {
    tokens:    Vec<Token>,
    pos:       usize,
    depth:     usize,
    variables: Vec<String>,
    text:      &'a str,
}

impl<'a> Parser<'a> {
    fn error(&self, what: &str) -> SystError {
        SystError::Expression(format!("{what} at token {} in {:?}", self.pos, self.text))
    }

    fn peek(&self) -> Option<&Token> { self.tokens.get(self.pos) }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or_expr(&mut self) -> Result<Node> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expr()?;
            lhs = Node::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Node> {
        let mut lhs = self.comparison()?;
        while self.eat(&Token::And) {
            let rhs = self.comparison()?;
            lhs = Node::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Node> {
        let mut lhs = self.additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::Eq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.additive()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn additive(&mut self) -> Result<Node> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus)  => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Node> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star)  => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Node::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    /// 所有递归都经过这里，深度在此计数
    fn unary(&mut self) -> Result<Node> {
        if self.depth >= MAX_NESTING {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let node = self.prefixed();
        self.depth -= 1;
        node
    }

    fn prefixed(&mut self) -> Result<Node> {
        if self.eat(&Token::Minus) {
            return Ok(Node::Neg(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Plus) {
            return self.unary();
        }
        if self.eat(&Token::Not) {
            return Ok(Node::Not(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Node> {
        let tok = self.peek().cloned().ok_or_else(|| self.error("unexpected end"))?;
        self.pos += 1;
        match tok {
            Token::Number(x) => Ok(Node::Number(x)),
            Token::LParen => {
                let inner = self.or_expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("expected ')'"));
                }
                Ok(inner)
            }
            Token::Ident(name) if self.peek() == Some(&Token::LParen) => self.call(&name),
            Token::Ident(name) => Ok(match name.as_str() {
                "true"  => Node::Number(1.0),
                "false" => Node::Number(0.0),
                _       => Node::Var(self.variable(name)),
            }),
            _ => Err(self.error("unexpected token")),
        }
    }

    fn call(&mut self, name: &str) -> Result<Node> {
        let (func, arity) = Func::lookup(name)
            .ok_or_else(|| self.error(&format!("unknown function {name}")))?;
        self.pos += 1; // '('
        let mut args = vec![self.or_expr()?];
        while self.eat(&Token::Comma) {
            args.push(self.or_expr()?);
        }
        if !self.eat(&Token::RParen) {
            return Err(self.error("expected ')'"));
        }
        if args.len() != arity {
            return Err(self.error(&format!("{name} takes {arity} argument(s)")));
        }
        Ok(Node::Call(func, args))
    }

    fn variable(&mut self, name: String) -> usize {
        match self.variables.iter().position(|v| *v == name) {
            Some(i) => i,
            None => {
                self.variables.push(name);
                self.variables.len() - 1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, values: &[f64]) -> f64 {
        Expression::parse(text).unwrap().eval(values)
    }

    #[test]
    fn precedence_and_variables() {
        let e = Expression::parse("a + b * 2 - a").unwrap();
        assert_eq!(e.variables, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(e.eval(&[1.0, 3.0]), 6.0);
        assert_eq!(eval("-(1 + 2) * 3", &[]), -9.0);
        assert_eq!(eval("2 * 3e2", &[]), 600.0);
    }

    #[test]
    fn logic_and_comparisons() {
        assert_eq!(eval("x > 1 && x < 3", &[2.0]), 1.0);
        assert_eq!(eval("x > 1 && x < 3", &[5.0]), 0.0);
        assert_eq!(eval("!(x == 0) || false", &[0.0]), 0.0);
        assert_eq!(eval("x >= 2 || x != 2", &[2.0]), 1.0);
    }

    #[test]
    fn dotted_identifiers_and_functions() {
        let e = Expression::parse("max(truth.pt_NOSYS, 10) + abs(-1)").unwrap();
        assert_eq!(e.variables, vec!["truth.pt_NOSYS".to_string()]);
        assert_eq!(e.eval(&[4.0]), 11.0);
        assert_eq!(eval("sqrt(pow(3, 2) + 16)", &[]), 5.0);
    }

    #[test]
    fn nesting_is_capped() {
        let deep = format!("{}x{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(Expression::parse(&deep), Err(SystError::Expression(_))));
        let negations = format!("{}1", "-".repeat(10_000));
        assert!(matches!(Expression::parse(&negations), Err(SystError::Expression(_))));
        let calls = format!("{}1{}", "abs(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(Expression::parse(&calls).is_err());

        let fine = format!("{}1{}", "(".repeat(MAX_NESTING - 2), ")".repeat(MAX_NESTING - 2));
        assert_eq!(eval(&fine, &[]), 1.0);
    }

    #[test]
    fn malformed_input_is_an_error() {
        for bad in ["(1 + 2", "1 +", "foo(1)", "min(1)", "a $ b", "1 2"] {
            assert!(matches!(Expression::parse(bad), Err(SystError::Expression(_))), "{bad}");
        }
    }
}
