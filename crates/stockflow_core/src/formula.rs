//! Formula representation: a restricted expression grammar over stocks,
//! parameters, intermediates and the time variable `t`.
//!
//! Formulas are parsed into an [`Expr`] tree and later lowered to bytecode by
//! the compiler. The grammar deliberately excludes anything that is not plain
//! arithmetic: the only functions are `min` and `max`, the only control
//! construct is the ternary conditional `cond ? a : b`, and comparisons
//! evaluate to `1.0` or `0.0`.

use std::collections::BTreeSet;

/// Binary operators of the formula grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
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
}

/// Two-argument builtin functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Min,
    Max,
}

/// Abstract syntax tree for a formula.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Neg(Box<Expr>),
    /// `cond ? then : else`
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Func, Box<Expr>, Box<Expr>),
}

/// Collects every identifier referenced by the expression.
pub fn free_identifiers(expr: &Expr) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_identifiers(expr, &mut out);
    out
}

fn collect_identifiers(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Number(_) => {}
        Expr::Ident(name) => {
            out.insert(name.clone());
        }
        Expr::Binary(left, _, right) => {
            collect_identifiers(left, out);
            collect_identifiers(right, out);
        }
        Expr::Neg(inner) => collect_identifiers(inner, out),
        Expr::Ternary(cond, then, els) => {
            collect_identifiers(cond, out);
            collect_identifiers(then, out);
            collect_identifiers(els, out);
        }
        Expr::Call(_, a, b) => {
            collect_identifiers(a, out);
            collect_identifiers(b, out);
        }
    }
}

/// Parses a formula string into an AST.
pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected trailing input in formula `{input}`"));
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Question,
    Colon,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("invalid numeric literal `{num_str}`"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            chars.next();
            match c {
                '+' => tokens.push(Token::Plus),
                '-' => tokens.push(Token::Minus),
                '*' => tokens.push(Token::Star),
                '/' => tokens.push(Token::Slash),
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                ',' => tokens.push(Token::Comma),
                '?' => tokens.push(Token::Question),
                ':' => tokens.push(Token::Colon),
                '<' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::Le);
                    } else {
                        tokens.push(Token::Lt);
                    }
                }
                '>' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::Ge);
                    } else {
                        tokens.push(Token::Gt);
                    }
                }
                '=' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::EqEq);
                    } else {
                        return Err("single `=` is not a valid operator; use `==`".to_string());
                    }
                }
                '!' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        tokens.push(Token::NotEq);
                    } else {
                        return Err("single `!` is not a valid operator; use `!=`".to_string());
                    }
                }
                _ => return Err(format!("unexpected character `{c}` in formula")),
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        if self.pos < self.tokens.len() {
            let t = self.tokens[self.pos].clone();
            self.pos += 1;
            Some(t)
        } else {
            None
        }
    }

    fn expect(&mut self, token: Token, context: &str) -> Result<(), String> {
        match self.consume() {
            Some(t) if t == token => Ok(()),
            other => Err(format!("expected {context}, found {other:?}")),
        }
    }

    /// Lowest precedence: the ternary conditional, right-associative.
    fn parse_expression(&mut self) -> Result<Expr, String> {
        let cond = self.parse_comparison()?;
        if let Some(Token::Question) = self.peek() {
            self.consume();
            let then = self.parse_expression()?;
            self.expect(Token::Colon, "`:` in ternary conditional")?;
            let els = self.parse_expression()?;
            return Ok(Expr::Ternary(Box::new(cond), Box::new(then), Box::new(els)));
        }
        Ok(cond)
    }

    /// Comparisons are non-associative: `a < b < c` is rejected.
    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_term()?;
        let op = match self.peek() {
            Some(Token::Lt) => Some(BinOp::Lt),
            Some(Token::Le) => Some(BinOp::Le),
            Some(Token::Gt) => Some(BinOp::Gt),
            Some(Token::Ge) => Some(BinOp::Ge),
            Some(Token::EqEq) => Some(BinOp::Eq),
            Some(Token::NotEq) => Some(BinOp::Ne),
            _ => None,
        };
        if let Some(op) = op {
            self.consume();
            let right = self.parse_term()?;
            return Ok(Expr::Binary(Box::new(left), op, Box::new(right)));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Plus => {
                    self.consume();
                    let right = self.parse_factor()?;
                    left = Expr::Binary(Box::new(left), BinOp::Add, Box::new(right));
                }
                Token::Minus => {
                    self.consume();
                    let right = self.parse_factor()?;
                    left = Expr::Binary(Box::new(left), BinOp::Sub, Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            match token {
                Token::Star => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = Expr::Binary(Box::new(left), BinOp::Mul, Box::new(right));
                }
                Token::Slash => {
                    self.consume();
                    let right = self.parse_unary()?;
                    left = Expr::Binary(Box::new(left), BinOp::Div, Box::new(right));
                }
                _ => break,
            }
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let func = match name.as_str() {
                        "min" => Func::Min,
                        "max" => Func::Max,
                        other => return Err(format!("unknown function `{other}`")),
                    };
                    let a = self.parse_expression()?;
                    self.expect(Token::Comma, "`,` between function arguments")?;
                    let b = self.parse_expression()?;
                    self.expect(Token::RParen, "`)` after function arguments")?;
                    Ok(Expr::Call(func, Box::new(a), Box::new(b)))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect(Token::RParen, "closing `)`")?;
                Ok(expr)
            }
            other => Err(format!("unexpected token {other:?} in formula")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_arithmetic_with_precedence() {
        let expr = parse("1 + 2 * 3").expect("parse");
        assert_eq!(
            expr,
            Expr::Binary(
                Box::new(Expr::Number(1.0)),
                BinOp::Add,
                Box::new(Expr::Binary(
                    Box::new(Expr::Number(2.0)),
                    BinOp::Mul,
                    Box::new(Expr::Number(3.0)),
                )),
            )
        );
    }

    #[test]
    fn parses_ternary_and_comparison() {
        let expr = parse("I <= capacity ? gamma : gamma * (capacity / I)").expect("parse");
        match expr {
            Expr::Ternary(cond, _, _) => match *cond {
                Expr::Binary(_, BinOp::Le, _) => {}
                other => panic!("expected comparison condition, got {other:?}"),
            },
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn parses_min_max_calls() {
        let expr = parse("max(-Lobbying, inflow_lobbying - outflow_lobbying)").expect("parse");
        match expr {
            Expr::Call(Func::Max, a, _) => match *a {
                Expr::Neg(_) => {}
                other => panic!("expected negated first argument, got {other:?}"),
            },
            other => panic!("expected max call, got {other:?}"),
        }
    }

    #[test]
    fn ternary_is_right_associative() {
        let expr = parse("a > 1 ? 1 : b > 1 ? 2 : 3").expect("parse");
        match expr {
            Expr::Ternary(_, _, els) => assert!(matches!(*els, Expr::Ternary(_, _, _))),
            other => panic!("expected ternary, got {other:?}"),
        }
    }

    #[test]
    fn collects_free_identifiers() {
        let expr = parse("beta_eff * S * I / N").expect("parse");
        let idents = free_identifiers(&expr);
        let expected: Vec<&str> = vec!["I", "N", "S", "beta_eff"];
        assert_eq!(idents.into_iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("1 +").is_err());
        assert!(parse("sin(x)").is_err());
        assert!(parse("a = b").is_err());
        assert!(parse("min(a)").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("a ? b").is_err());
    }

    #[test]
    fn rejects_chained_comparison() {
        assert!(parse("a < b < c").is_err());
    }
}
