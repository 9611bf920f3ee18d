use crate::ast::{Expr, Field, Op, Value};
use crate::error::EvalError;
use crate::lexer::{lex, Token};

/// Recursive-descent parser over the membership query grammar.
///
/// Precedence, loosest to tightest: `OR` < `AND` < `NOT` < comparison atom
/// (parenthesized sub-expressions bind tightest of all).
pub fn parse(input: &str) -> Result<Expr, EvalError> {
    let tokens = lex(input)?;
    let mut p = Parser { tokens, pos: 0, input_len: input.len() };
    let expr = p.parse_or()?;
    if p.pos != p.tokens.len() {
        let (_, at) = p.tokens[p.pos].clone();
        return Err(EvalError::Malformed { pos: at, message: "trailing input after expression".into() });
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn cur_pos(&self) -> usize {
        self.tokens.get(self.pos).map(|(_, p)| *p).unwrap_or(self.input_len)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Token, what: &str) -> Result<(), EvalError> {
        match self.bump() {
            Some(ref t) if t == tok => Ok(()),
            _ => Err(EvalError::Malformed { pos: self.cur_pos(), message: format!("expected {what}") }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_not()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.bump();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.bump();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, EvalError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.bump();
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token::Ident(_)) => self.parse_compare(),
            _ => Err(EvalError::Malformed { pos: self.cur_pos(), message: "expected field, '(' or NOT".into() }),
        }
    }

    fn parse_compare(&mut self) -> Result<Expr, EvalError> {
        let field_pos = self.cur_pos();
        let name = match self.bump() {
            Some(Token::Ident(s)) => s,
            _ => return Err(EvalError::Malformed { pos: field_pos, message: "expected field name".into() }),
        };
        let field = parse_field(&name, field_pos)?;

        let op = match self.bump() {
            Some(Token::Eq) => Op::Eq,
            Some(Token::Neq) => Op::Neq,
            Some(Token::Lt) => Op::Lt,
            Some(Token::Lte) => Op::Lte,
            Some(Token::Gt) => Op::Gt,
            Some(Token::Gte) => Op::Gte,
            Some(Token::Contains) => Op::Contains,
            _ => return Err(EvalError::Malformed { pos: self.cur_pos(), message: "expected comparison operator".into() }),
        };

        let value_pos = self.cur_pos();
        let value = match self.bump() {
            Some(Token::Str(s)) => Value::Str(s),
            Some(Token::Num(n)) => Value::Num(n),
            _ => return Err(EvalError::Malformed { pos: value_pos, message: "expected string or numeric literal".into() }),
        };

        Ok(Expr::Compare { field, op, value })
    }
}

fn parse_field(name: &str, pos: usize) -> Result<Field, EvalError> {
    if let Some(path) = name.strip_prefix("metadata.") {
        if path.is_empty() {
            return Err(EvalError::Malformed { pos, message: "metadata field requires a path, e.g. metadata.rows".into() });
        }
        return Ok(Field::Metadata(path.to_string()));
    }
    match name {
        "type" => Ok(Field::Type),
        "provider" => Ok(Field::Provider),
        "tag" => Ok(Field::Tag),
        "name" => Ok(Field::Name),
        other => Err(EvalError::Malformed { pos, message: format!("unknown field '{other}'") }),
    }
}
