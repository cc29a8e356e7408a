//! Recursive-descent parser: `NOT > AND > OR` precedence (§4.3 step 2).

use super::ast::{invalid_argument, CmpOp, Expr, RawAtom};
use super::lexer::{tokenize, PosToken, Token};
use crate::error::FlowError;

struct Parser {
    tokens: Vec<PosToken>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_pos(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.pos).unwrap_or(usize::MAX)
    }

    fn advance(&mut self) -> Option<PosToken> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<Expr, FlowError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, FlowError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::and(left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, FlowError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, FlowError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(PosToken { token: Token::RParen, .. }) => Ok(inner),
                    Some(other) => Err(invalid_argument(
                        format!("expected closing bracket, found {:?}", other.token),
                        other.pos,
                    )),
                    None => Err(invalid_argument("unterminated group: missing closing bracket", self.peek_pos())),
                }
            }
            Some(Token::Word(_)) => self.parse_atom(),
            Some(other) => {
                let pos = self.peek_pos();
                Err(invalid_argument(format!("unexpected token {other:?}"), pos))
            }
            None => Err(invalid_argument("unexpected end of condition", self.peek_pos())),
        }
    }

    fn parse_atom(&mut self) -> Result<Expr, FlowError> {
        let attr_tok = self.advance().expect("checked by caller");
        let attr = match attr_tok.token {
            Token::Word(w) => w,
            _ => unreachable!(),
        };

        let cmp_tok = self
            .advance()
            .ok_or_else(|| invalid_argument("expected comparator after attribute", attr_tok.pos))?;
        let cmp_word = match &cmp_tok.token {
            Token::CmpSym(s) => s.clone(),
            Token::Word(w) => w.clone(),
            other => {
                return Err(invalid_argument(format!("expected comparator, found {other:?}"), cmp_tok.pos));
            }
        };
        let cmp = CmpOp::parse(&cmp_word)
            .ok_or_else(|| invalid_argument(format!("unknown comparator '{cmp_word}'"), cmp_tok.pos))?;

        let value_tok = self
            .advance()
            .ok_or_else(|| invalid_argument("expected value after comparator", cmp_tok.pos))?;
        let value = match value_tok.token {
            Token::Word(w) => w,
            other => return Err(invalid_argument(format!("expected value, found {other:?}"), value_tok.pos)),
        };

        Ok(Expr::Atom(RawAtom {
            attr,
            cmp,
            value,
            pos: attr_tok.pos,
        }))
    }
}

pub fn parse(input: &str) -> Result<Expr, FlowError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(invalid_argument("empty condition", 1));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        let pos = parser.peek_pos();
        return Err(invalid_argument("trailing tokens after condition", pos));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_precedence_over_or() {
        // a | b & c  ==  a | (b & c)
        let expr = parse("proto=tcp | dport=80 & sip=1.1.1.1").unwrap();
        match expr {
            Expr::Or(_, r) => assert!(matches!(*r, Expr::And(_, _))),
            other => panic!("expected Or at top level, got {other:?}"),
        }
    }

    #[test]
    fn parses_not_binds_tighter_than_and() {
        let expr = parse("!proto=tcp & dport=80").unwrap();
        match expr {
            Expr::And(l, _) => assert!(matches!(*l, Expr::Not(_))),
            other => panic!("expected And at top level, got {other:?}"),
        }
    }

    #[test]
    fn parses_grouping_with_mixed_brackets() {
        let expr = parse("[dport=80 | dport=443]").unwrap();
        assert!(matches!(expr, Expr::Or(_, _)));
    }

    #[test]
    fn rejects_unterminated_group() {
        assert!(parse("(dport=80").is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("dport=80 dport=81").is_err());
    }
}
