//! Lexer and parser for the in-memory engine's language subset.

use crate::error::{Error, Result};
use crate::value::{EngineValue, INTEGER_NA, LOGICAL_NA, real_na};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(EngineValue),
    Ident(String),
    Call { name: String, args: Vec<Arg> },
    Assign { name: String, value: Box<Expr> },
    For { var: String, seq: Box<Expr>, body: Box<Expr> },
    If { cond: Box<Expr>, then: Box<Expr>, otherwise: Option<Box<Expr>> },
    Block(Vec<Expr>),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Arg {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Range,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Integer(i32),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semi,
    Newline,
    Arrow,
    Equals,
    Plus,
    Minus,
    Star,
    Slash,
    Colon,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    Bang,
    Eof,
}

fn parse_error(msg: impl Into<String>) -> Error {
    Error::Engine(format!("parse error: {}", msg.into()))
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '.' || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_'
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' => i += 1,
            '\n' => {
                tokens.push(Token::Newline);
                i += 1;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ';' => {
                tokens.push(Token::Semi);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('-') => {
                    tokens.push(Token::Arrow);
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Le);
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    tokens.push(Token::Equals);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '"' | '\'' => {
                let (s, next) = lex_string(&chars, i)?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '`' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == '`')
                    .map(|p| start + p)
                    .ok_or_else(|| parse_error("unterminated backtick name"))?;
                tokens.push(Token::Ident(chars[start..end].iter().collect()));
                i = end + 1;
            }
            c if c.is_ascii_digit()
                || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) =>
            {
                let (token, next) = lex_number(&chars, i)?;
                tokens.push(token);
                i = next;
            }
            c if is_ident_start(c) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(parse_error(format!("unexpected input {:?}", other))),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

fn lex_string(chars: &[char], start: usize) -> Result<(String, usize)> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((out, i + 1)),
            '\\' => {
                let escaped = chars
                    .get(i + 1)
                    .ok_or_else(|| parse_error("unterminated string"))?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '0' => '\0',
                    other => *other,
                });
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(parse_error("unterminated string"))
}

fn lex_number(chars: &[char], start: usize) -> Result<(Token, usize)> {
    let mut i = start;
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
        let mut j = i + 1;
        if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
            j += 1;
        }
        if j < chars.len() && chars[j].is_ascii_digit() {
            i = j;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
        }
    }
    let text: String = chars[start..i].iter().collect();
    let number: f64 = text
        .parse()
        .map_err(|_| parse_error(format!("malformed number {:?}", text)))?;

    if chars.get(i) == Some(&'L') {
        if number.fract() != 0.0 || number.abs() > i32::MAX as f64 {
            return Err(parse_error(format!("{}L is not an integer", text)));
        }
        return Ok((Token::Integer(number as i32), i + 1));
    }
    Ok((Token::Number(number), i))
}

/// Parse a program into its top-level statements.
pub(crate) fn parse(src: &str) -> Result<Vec<Expr>> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
        skip_newlines: vec![false],
    };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Newlines are insignificant inside parentheses, significant in blocks.
    skip_newlines: Vec<bool>,
}

impl Parser {
    fn skipping(&self) -> bool {
        self.skip_newlines.last().copied().unwrap_or(false)
    }

    fn peek(&mut self) -> &Token {
        if self.skipping() {
            self.eat_newlines();
        }
        &self.tokens[self.pos]
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let mut idx = self.pos;
        let mut remaining = offset;
        loop {
            let token = &self.tokens[idx.min(self.tokens.len() - 1)];
            if self.skipping() && *token == Token::Newline {
                idx += 1;
                continue;
            }
            if remaining == 0 || *token == Token::Eof {
                return token;
            }
            remaining -= 1;
            idx += 1;
        }
    }

    fn next(&mut self) -> Token {
        self.peek();
        let token = self.tokens[self.pos].clone();
        if token != Token::Eof {
            self.pos += 1;
        }
        token
    }

    fn eat_newlines(&mut self) {
        while self.tokens[self.pos] == Token::Newline {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        let got = self.next();
        if got == want {
            Ok(())
        } else {
            Err(parse_error(format!("expected {:?}, found {:?}", want, got)))
        }
    }

    fn program(&mut self) -> Result<Vec<Expr>> {
        let stmts = self.statements()?;
        match self.peek() {
            Token::Eof => Ok(stmts),
            other => Err(parse_error(format!("unexpected {:?}", other))),
        }
    }

    /// Statements up to a closing brace or end of input.
    fn statements(&mut self) -> Result<Vec<Expr>> {
        let mut stmts = Vec::new();
        loop {
            while matches!(self.peek(), Token::Newline | Token::Semi) {
                self.next();
            }
            if matches!(self.peek(), Token::Eof | Token::RBrace) {
                return Ok(stmts);
            }
            stmts.push(self.statement()?);
            match self.peek() {
                Token::Newline | Token::Semi | Token::Eof | Token::RBrace => {}
                other => return Err(parse_error(format!("unexpected {:?}", other))),
            }
        }
    }

    fn statement(&mut self) -> Result<Expr> {
        self.assignment(true)
    }

    fn assignment(&mut self, allow_equals: bool) -> Result<Expr> {
        let lhs = self.not()?;
        let is_assign = match self.peek() {
            Token::Arrow => true,
            Token::Equals => allow_equals,
            _ => false,
        };
        if !is_assign {
            return Ok(lhs);
        }
        self.next();
        self.eat_newlines();
        let name = match lhs {
            Expr::Ident(name) => name,
            Expr::Literal(EngineValue::String(ref v)) if v.len() == 1 => {
                v[0].clone().unwrap_or_default()
            }
            other => return Err(parse_error(format!("invalid assignment target {:?}", other))),
        };
        let value = self.assignment(allow_equals)?;
        Ok(Expr::Assign {
            name,
            value: Box::new(value),
        })
    }

    fn not(&mut self) -> Result<Expr> {
        if *self.peek() == Token::Bang {
            self.next();
            let expr = self.not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(expr),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Token::EqEq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Gt => BinaryOp::Gt,
            Token::Le => BinaryOp::Le,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.next();
        self.eat_newlines();
        let rhs = self.additive()?;
        Ok(binary(op, lhs, rhs))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.next();
            self.eat_newlines();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut lhs = self.range()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.next();
            self.eat_newlines();
            let rhs = self.range()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn range(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while *self.peek() == Token::Colon {
            self.next();
            self.eat_newlines();
            let rhs = self.unary()?;
            lhs = binary(BinaryOp::Range, lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Minus => {
                self.next();
                let expr = self.unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    expr: Box::new(expr),
                })
            }
            Token::Plus => {
                self.next();
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Token::Number(n) => Ok(Expr::Literal(EngineValue::Double(vec![n]))),
            Token::Integer(n) => Ok(Expr::Literal(EngineValue::Integer(vec![n]))),
            Token::Str(s) => Ok(Expr::Literal(EngineValue::string(s))),
            Token::LParen => self.nested(true, |p| {
                let expr = p.assignment(false)?;
                p.expect(Token::RParen)?;
                Ok(expr)
            }),
            Token::LBrace => self.nested(false, |p| {
                let stmts = p.statements()?;
                p.expect(Token::RBrace)?;
                Ok(Expr::Block(stmts))
            }),
            Token::Ident(name) => match name.as_str() {
                "for" => self.for_loop(),
                "if" => self.if_else(),
                _ => {
                    if *self.peek_at(0) == Token::LParen {
                        self.next();
                        let args = self.call_args()?;
                        Ok(Expr::Call { name, args })
                    } else {
                        Ok(keyword_literal(&name).unwrap_or(Expr::Ident(name)))
                    }
                }
            },
            other => Err(parse_error(format!("unexpected {:?}", other))),
        }
    }

    /// Run `f` with newlines made significant or insignificant.
    fn nested<T>(&mut self, skip: bool, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.skip_newlines.push(skip);
        let result = f(self);
        self.skip_newlines.pop();
        result
    }

    fn call_args(&mut self) -> Result<Vec<Arg>> {
        self.nested(true, |p| {
            let args = p.call_args_inner()?;
            p.expect(Token::RParen)?;
            Ok(args)
        })
    }

    fn call_args_inner(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if *self.peek() == Token::RParen {
            return Ok(args);
        }
        loop {
            let named = match (self.peek_at(0).clone(), self.peek_at(1)) {
                (Token::Ident(name), Token::Equals) | (Token::Str(name), Token::Equals) => {
                    Some(name)
                }
                _ => None,
            };
            if named.is_some() {
                self.next();
                self.next();
            }
            let value = self.assignment(false)?;
            args.push(Arg { name: named, value });

            match self.peek() {
                Token::Comma => {
                    self.next();
                }
                Token::RParen => return Ok(args),
                other => return Err(parse_error(format!("unexpected {:?} in call", other))),
            }
        }
    }

    fn for_loop(&mut self) -> Result<Expr> {
        self.expect(Token::LParen)?;
        let (var, seq) = self.nested(true, |p| {
            let header = p.for_header()?;
            p.expect(Token::RParen)?;
            Ok(header)
        })?;
        self.eat_newlines();
        let body = self.statement()?;
        Ok(Expr::For {
            var,
            seq: Box::new(seq),
            body: Box::new(body),
        })
    }

    fn for_header(&mut self) -> Result<(String, Expr)> {
        let var = match self.next() {
            Token::Ident(name) => name,
            other => return Err(parse_error(format!("expected loop variable, found {:?}", other))),
        };
        match self.next() {
            Token::Ident(kw) if kw == "in" => {}
            other => return Err(parse_error(format!("expected 'in', found {:?}", other))),
        }
        let seq = self.assignment(false)?;
        Ok((var, seq))
    }

    fn if_else(&mut self) -> Result<Expr> {
        self.expect(Token::LParen)?;
        let cond = self.nested(true, |p| {
            let cond = p.assignment(false)?;
            p.expect(Token::RParen)?;
            Ok(cond)
        })?;
        self.eat_newlines();
        let then = self.statement()?;

        let save = self.pos;
        self.eat_newlines();
        let has_else = matches!(self.peek(), Token::Ident(kw) if kw == "else");
        let otherwise = if has_else {
            self.next();
            self.eat_newlines();
            Some(Box::new(self.statement()?))
        } else {
            self.pos = save;
            None
        };

        Ok(Expr::If {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise,
        })
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

fn keyword_literal(name: &str) -> Option<Expr> {
    let value = match name {
        "TRUE" | "T" => EngineValue::logical(true),
        "FALSE" | "F" => EngineValue::logical(false),
        "NULL" => EngineValue::Null,
        "NA" => EngineValue::Logical(vec![LOGICAL_NA]),
        "NA_integer_" => EngineValue::Integer(vec![INTEGER_NA]),
        "NA_real_" => EngineValue::Double(vec![real_na()]),
        "NA_character_" => EngineValue::String(vec![None]),
        "Inf" => EngineValue::Double(vec![f64::INFINITY]),
        "NaN" => EngineValue::Double(vec![f64::NAN]),
        _ => return None,
    };
    Some(Expr::Literal(value))
}
