//! Tokenizer for the condition grammar (§4.3 step 1).

use crate::error::FlowError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Word(String),
    CmpSym(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

/// Tracks the byte offset a token started at, for 1-based error positions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PosToken {
    pub token: Token,
    pub pos: usize,
}

const CMP_CHARS: &str = "=<>!";
const WORD_CHARS_EXTRA: &str = "._:/-";

pub fn tokenize(input: &str) -> Result<Vec<PosToken>, FlowError> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        match c {
            '(' | '[' | '{' => {
                out.push(PosToken { token: Token::LParen, pos: start + 1 });
                i += 1;
            }
            ')' | ']' | '}' => {
                out.push(PosToken { token: Token::RParen, pos: start + 1 });
                i += 1;
            }
            '&' => {
                out.push(PosToken { token: Token::And, pos: start + 1 });
                i += 1;
            }
            '|' => {
                out.push(PosToken { token: Token::Or, pos: start + 1 });
                i += 1;
            }
            '!' if chars.get(i + 1) != Some(&'=') => {
                out.push(PosToken { token: Token::Not, pos: start + 1 });
                i += 1;
            }
            c if CMP_CHARS.contains(c) => {
                let mut j = i;
                while j < chars.len() && CMP_CHARS.contains(chars[j]) {
                    j += 1;
                }
                let sym: String = chars[i..j].iter().collect();
                out.push(PosToken { token: Token::CmpSym(sym), pos: start + 1 });
                i = j;
            }
            c if c.is_alphanumeric() || WORD_CHARS_EXTRA.contains(c) => {
                let mut j = i;
                while j < chars.len()
                    && (chars[j].is_alphanumeric() || WORD_CHARS_EXTRA.contains(chars[j]))
                {
                    j += 1;
                }
                let word: String = chars[i..j].iter().collect();
                out.push(PosToken { token: Token::Word(word), pos: start + 1 });
                i = j;
            }
            other => {
                return Err(FlowError::at(
                    crate::error::ErrorKind::InvalidArgument,
                    format!("unexpected character '{other}'"),
                    start + 1,
                ));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_simple_atom() {
        let toks = tokenize("sip = 10.0.0.1").unwrap();
        assert_eq!(
            toks.iter().map(|t| t.token.clone()).collect::<Vec<_>>(),
            vec![
                Token::Word("sip".into()),
                Token::CmpSym("=".into()),
                Token::Word("10.0.0.1".into()),
            ]
        );
    }

    #[test]
    fn tokenizes_and_or_not_and_brackets() {
        let toks = tokenize("!(dport = 80 & proto eq tcp) | host = a.com")
            .unwrap()
            .into_iter()
            .map(|t| t.token)
            .collect::<Vec<_>>();
        assert_eq!(toks[0], Token::Not);
        assert_eq!(toks[1], Token::LParen);
        assert!(toks.contains(&Token::And));
        assert!(toks.contains(&Token::Or));
        assert!(toks.contains(&Token::RParen));
    }

    #[test]
    fn distinguishes_not_from_ne() {
        let toks = tokenize("proto != 6").unwrap();
        assert_eq!(toks[1].token, Token::CmpSym("!=".into()));
    }
}
