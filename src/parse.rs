//! Parsing `.qck` assembly source into statements.
//!
//! A source file is a data section followed by a code section:
//!
//! ```text
//! // data section: directives and EXTERN declarations
//! five:  .word 5
//! msg:   .text "hello\n"
//! EXTERN helper
//! BEGIN
//! // code section: labels and instructions
//! loop:
//!     LDA five
//!     HALT
//! END
//! ```
//!
//! [`parse_source`] tokenizes the file with a [`logos`] lexer and parses it
//! line by line into [`Stmt`]s, which the [assembler](crate::asm) consumes.
//! Lexical problems surface as [`LexErr`], structural ones as [`ParseErr`];
//! both carry the offending line.

use std::borrow::Cow;
use std::num::IntErrorKind;
use std::str::FromStr;

use logos::{Lexer, Logos};

use crate::isa::Opcode;

/// A token of `.qck` source.
#[derive(Debug, Clone, PartialEq, Eq, Logos)]
#[logos(skip r"[ \t\r]+", error = LexErr)]
pub enum Token {
    /// An integer literal (decimal, `0x` hex, or `0b` binary, optionally negated).
    #[regex(r"-?[0-9][0-9a-zA-Z_]*", lex_number)]
    Number(i64),

    /// A label, mnemonic, or keyword.
    #[regex(r"[A-Za-z_]\w*", |lx| lx.slice().to_string())]
    Ident(String),

    /// A directive (e.g. `.word`, `.text`), without the leading dot.
    #[regex(r"\.[A-Za-z]+", |lx| lx.slice()[1..].to_string())]
    Directive(String),

    /// A string literal, with escapes resolved.
    #[token("\"", lex_str_literal)]
    String(String),

    /// A colon.
    #[token(":")]
    Colon,

    /// A comma.
    #[token(",")]
    Comma,

    /// A `//` comment, skipped by the lexer.
    #[regex(r"//[^\n]*", logos::skip)]
    Comment,

    /// A line break.
    #[token("\n")]
    NewLine,
}

/// Errors from tokenizing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexErr {
    /// Numeric literal does not fit in a 32-bit word.
    DoesNotFitWord,
    /// Hex literal has invalid digits.
    InvalidHex,
    /// Binary literal has invalid digits.
    InvalidBin,
    /// Decimal literal has invalid digits.
    InvalidDec,
    /// Numeric literal has a radix prefix but no digits.
    EmptyDigits,
    /// Int parsing failed but the reason why is unknown.
    UnknownIntErr,
    /// String literal is missing an end quotation mark.
    UnclosedStrLit,
    /// A symbol was used which does not occur in any token.
    #[default]
    InvalidSymbol,
}

impl std::fmt::Display for LexErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LexErr::DoesNotFitWord => f.write_str("numeric token does not fit 32-bit word"),
            LexErr::InvalidHex     => f.write_str("invalid hex literal"),
            LexErr::InvalidBin     => f.write_str("invalid binary literal"),
            LexErr::InvalidDec     => f.write_str("invalid decimal literal"),
            LexErr::EmptyDigits    => f.write_str("literal is missing digits"),
            LexErr::UnknownIntErr  => f.write_str("could not parse integer"),
            LexErr::UnclosedStrLit => f.write_str("unclosed string literal"),
            LexErr::InvalidSymbol  => f.write_str("unrecognized symbol"),
        }
    }
}
impl std::error::Error for LexErr {}
impl crate::err::Error for LexErr {
    fn help(&self) -> Option<Cow<str>> {
        match self {
            LexErr::DoesNotFitWord => Some(format!("words span [{}, {}]; negative literals go down to {}", u32::MIN, u32::MAX, i32::MIN).into()),
            LexErr::InvalidHex     => Some("a hex literal starts with '0x' and consists of 0-9, A-F".into()),
            LexErr::InvalidBin     => Some("a binary literal starts with '0b' and consists of 0s and 1s".into()),
            LexErr::InvalidDec     => Some("a decimal literal only consists of digits 0-9".into()),
            LexErr::EmptyDigits    => Some("there should be digits here".into()),
            LexErr::UnknownIntErr  => None,
            LexErr::UnclosedStrLit => Some("add a quote to the end of the string literal".into()),
            LexErr::InvalidSymbol  => Some("this char does not occur in any token of the source language".into()),
        }
    }
}

/// Helper that converts an int error kind to its corresponding LexErr, based on the provided inputs.
fn convert_int_error(e: &IntErrorKind, invalid_digits_err: LexErr) -> LexErr {
    match e {
        IntErrorKind::Empty        => LexErr::EmptyDigits,
        IntErrorKind::InvalidDigit => invalid_digits_err,
        IntErrorKind::PosOverflow  => LexErr::DoesNotFitWord,
        IntErrorKind::NegOverflow  => LexErr::DoesNotFitWord,
        _ => LexErr::UnknownIntErr,
    }
}

fn lex_number(lx: &Lexer<'_, Token>) -> Result<i64, LexErr> {
    let slice = lx.slice();
    let (neg, body) = match slice.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, slice),
    };
    let (radix, digits, digit_err) = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        (16, hex, LexErr::InvalidHex)
    } else if let Some(bin) = body.strip_prefix("0b").or_else(|| body.strip_prefix("0B")) {
        (2, bin, LexErr::InvalidBin)
    } else {
        (10, body, LexErr::InvalidDec)
    };

    let magnitude = i64::from_str_radix(digits, radix)
        .map_err(|e| convert_int_error(e.kind(), digit_err))?;
    let value = if neg { -magnitude } else { magnitude };

    // Words are 32 bits; negative literals are stored as two's complement.
    let in_range = if neg {
        value >= i64::from(i32::MIN)
    } else {
        value <= i64::from(u32::MAX)
    };
    match in_range {
        true  => Ok(value),
        false => Err(LexErr::DoesNotFitWord),
    }
}

fn lex_str_literal(lx: &mut Lexer<'_, Token>) -> Result<String, LexErr> {
    let rem = lx.remainder()
        .lines()
        .next()
        .unwrap_or("");

    // consume tokens up to and including the first unescaped quote
    let mlen = rem.match_indices('"')
        .map(|(n, _)| n)
        .find(|&n| n == 0 || !matches!(rem.get((n - 1)..(n + 1)), Some("\\\"")));

    match mlen {
        Some(len) => lx.bump(len + 1),
        None => {
            lx.bump(rem.len());
            return Err(LexErr::UnclosedStrLit);
        }
    }

    // get the string inside quotes:
    let mut remaining = &lx.slice()[1..(lx.slice().len() - 1)];
    let mut buf = String::with_capacity(remaining.len());

    // Look for escapes. Only a simple group of escapes are implemented.
    while let Some((left, right)) = remaining.split_once('\\') {
        buf.push_str(left);

        // this character is part of the escape:
        let Some(&esc) = right.as_bytes().first() else {
            // trailing backslash before the closing quote
            buf.push('\\');
            remaining = "";
            break;
        };
        match esc {
            b'n'  => buf.push('\n'),
            b'r'  => buf.push('\r'),
            b't'  => buf.push('\t'),
            b'0'  => buf.push('\0'),
            b'\\' => buf.push('\\'),
            b'"'  => buf.push('\"'),
            c => {
                buf.push('\\');
                buf.push(char::from(c));
            }
        }

        remaining = &right[1..];
    }
    buf.push_str(remaining);

    Ok(buf)
}

/// An instruction operand as written in source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A literal value, used as the operand field verbatim.
    Lit(u32),
    /// A symbol reference, resolved by the assembler or linker.
    Sym(String),
}

/// A parsed source statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StmtKind {
    /// `label: .word v1, v2, ...`
    Word {
        /// The data label.
        label: String,
        /// The word values (negatives stored as two's complement).
        values: Vec<i64>,
    },
    /// `label: .text "string"`
    Text {
        /// The data label.
        label: String,
        /// The string contents.
        string: String,
    },
    /// `EXTERN name`
    Extern(String),
    /// `BEGIN`
    Begin,
    /// `END`
    End,
    /// A code label on its own line (`name:`).
    Label(String),
    /// An instruction.
    Instr {
        /// The opcode.
        op: Opcode,
        /// The operand, if one was written.
        operand: Option<Operand>,
    },
}

/// A statement with its 1-indexed source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stmt {
    /// What the statement is.
    pub kind: StmtKind,
    /// The 1-indexed line the statement appeared on.
    pub line: usize,
}

/// Errors from parsing tokenized source into statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErr {
    /// The kind of error.
    pub kind: ParseErrKind,
    /// The 1-indexed line the error occurred on.
    pub line: usize,
}

/// The kinds of [`ParseErr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrKind {
    /// The lexer rejected a token.
    Lex(LexErr),
    /// An identifier in mnemonic position is not in the opcode table.
    UnknownMnemonic(String),
    /// A directive other than `.word` or `.text`.
    UnknownDirective(String),
    /// An operand literal is negative.
    NegativeOperand,
    /// The line does not match any statement form.
    MalformedLine,
}

impl std::fmt::Display for ParseErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ParseErrKind::Lex(e) => e.fmt(f),
            ParseErrKind::UnknownMnemonic(m) => write!(f, "unknown mnemonic '{m}'"),
            ParseErrKind::UnknownDirective(d) => write!(f, "unknown directive '.{d}'"),
            ParseErrKind::NegativeOperand => f.write_str("operand cannot be negative"),
            ParseErrKind::MalformedLine => f.write_str("malformed line"),
        }
    }
}
impl std::error::Error for ParseErr {}
impl crate::err::Error for ParseErr {
    fn line(&self) -> Option<usize> {
        Some(self.line)
    }
    fn help(&self) -> Option<Cow<str>> {
        match &self.kind {
            ParseErrKind::Lex(e) => e.help(),
            ParseErrKind::UnknownMnemonic(_) => Some("mnemonics are case-insensitive; check the opcode table".into()),
            ParseErrKind::UnknownDirective(_) => Some("data directives are '.word' and '.text'".into()),
            ParseErrKind::NegativeOperand => Some("operand fields are unsigned 24-bit values".into()),
            ParseErrKind::MalformedLine => Some("a line holds one directive, label, instruction, or keyword".into()),
        }
    }
}

/// Tokenizes and parses a source file into statements.
///
/// # Example
///
/// ```
/// use sisprog::parse::{parse_source, Operand, StmtKind};
/// use sisprog::isa::Opcode;
///
/// let stmts = parse_source("BEGIN\nLDA 0x404\nHALT\nEND").unwrap();
/// assert_eq!(stmts[1].kind, StmtKind::Instr {
///     op: Opcode::Lda,
///     operand: Some(Operand::Lit(0x404)),
/// });
/// assert_eq!(stmts[1].line, 2);
/// ```
pub fn parse_source(src: &str) -> Result<Vec<Stmt>, ParseErr> {
    let mut stmts = vec![];
    let mut line = 1;
    let mut toks: Vec<Token> = vec![];

    let mut lexer = Token::lexer(src);
    loop {
        let tok = lexer.next();
        match tok {
            Some(Ok(Token::NewLine)) | None => {
                if !toks.is_empty() {
                    let kind = match parse_line(&toks) {
                        Some(Ok(kind)) => kind,
                        Some(Err(kind)) => return Err(ParseErr { kind, line }),
                        None => return Err(ParseErr { kind: ParseErrKind::MalformedLine, line }),
                    };
                    stmts.push(Stmt { kind, line });
                    toks.clear();
                }
                if tok.is_none() {
                    break;
                }
                line += 1;
            }
            Some(Ok(t)) => toks.push(t),
            Some(Err(e)) => return Err(ParseErr { kind: ParseErrKind::Lex(e), line }),
        }
    }

    Ok(stmts)
}

/// Parses one line of tokens. Line numbers are attached by the caller.
///
/// `None` means the line matched no statement form; `Some(Err(_))` means it
/// matched a form but had a more specific problem.
fn parse_line(toks: &[Token]) -> Option<Result<StmtKind, ParseErrKind>> {
    use Token::*;

    let err = |kind| Some(Err(kind));

    let kind = match toks {
        [Ident(kw)] if kw.eq_ignore_ascii_case("BEGIN") => StmtKind::Begin,
        [Ident(kw)] if kw.eq_ignore_ascii_case("END") => StmtKind::End,
        [Ident(kw), Ident(name)] if kw.eq_ignore_ascii_case("EXTERN") => {
            StmtKind::Extern(name.clone())
        }
        [Ident(label), Colon] => StmtKind::Label(label.clone()),
        [Ident(label), Colon, Directive(d), rest @ ..] => match &**d {
            "word" => match parse_word_values(rest) {
                Some(values) => StmtKind::Word { label: label.clone(), values },
                None => return err(ParseErrKind::MalformedLine),
            },
            "text" => match rest {
                [String(s)] => StmtKind::Text { label: label.clone(), string: s.clone() },
                _ => return err(ParseErrKind::MalformedLine),
            },
            _ => return err(ParseErrKind::UnknownDirective(d.clone())),
        },
        [Ident(mnemonic), rest @ ..] => {
            let Ok(op) = Opcode::from_str(mnemonic) else {
                return err(ParseErrKind::UnknownMnemonic(mnemonic.clone()));
            };
            let operand = match rest {
                [] => None,
                [Number(n)] => match u32::try_from(*n) {
                    Ok(v) => Some(Operand::Lit(v)),
                    Err(_) => return err(ParseErrKind::NegativeOperand),
                },
                [Ident(sym)] => Some(Operand::Sym(sym.clone())),
                _ => return None,
            };
            StmtKind::Instr { op, operand }
        }
        _ => return None,
    };

    Some(Ok(kind))
}

/// Parses `v1, v2, ..., vn` (at least one value).
fn parse_word_values(toks: &[Token]) -> Option<Vec<i64>> {
    let mut values = vec![];
    let mut rest = toks;

    loop {
        match rest {
            [Token::Number(n), Token::Comma, tail @ ..] => {
                values.push(*n);
                rest = tail;
            }
            [Token::Number(n)] => {
                values.push(*n);
                return Some(values);
            }
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use logos::Logos;

    use crate::isa::Opcode;
    use super::{parse_source, LexErr, Operand, ParseErrKind, StmtKind, Token};

    fn ident(s: &str) -> Token {
        Token::Ident(s.to_string())
    }

    #[test]
    fn test_numeric_literals() {
        let mut tokens = Token::lexer("0 123 0x404 0b101 -17");
        assert_eq!(tokens.next(), Some(Ok(Token::Number(0))));
        assert_eq!(tokens.next(), Some(Ok(Token::Number(123))));
        assert_eq!(tokens.next(), Some(Ok(Token::Number(0x404))));
        assert_eq!(tokens.next(), Some(Ok(Token::Number(0b101))));
        assert_eq!(tokens.next(), Some(Ok(Token::Number(-17))));
        assert_eq!(tokens.next(), None);
    }

    #[test]
    fn test_numeric_bounds() {
        let mut tokens = Token::lexer("4294967295 4294967296");
        assert_eq!(tokens.next(), Some(Ok(Token::Number(4294967295))));
        assert_eq!(tokens.next(), Some(Err(LexErr::DoesNotFitWord)));

        let mut tokens = Token::lexer("-2147483648 -2147483649");
        assert_eq!(tokens.next(), Some(Ok(Token::Number(-2147483648))));
        assert_eq!(tokens.next(), Some(Err(LexErr::DoesNotFitWord)));
    }

    #[test]
    fn test_numeric_invalid() {
        let mut tokens = Token::lexer("0xG1");
        assert_eq!(tokens.next(), Some(Err(LexErr::InvalidHex)));
        let mut tokens = Token::lexer("0x");
        assert_eq!(tokens.next(), Some(Err(LexErr::EmptyDigits)));
        let mut tokens = Token::lexer("12ab");
        assert_eq!(tokens.next(), Some(Err(LexErr::InvalidDec)));
    }

    #[test]
    fn test_comments_skipped() {
        let mut tokens = Token::lexer("LDA five // load the first addend");
        assert_eq!(tokens.next(), Some(Ok(ident("LDA"))));
        assert_eq!(tokens.next(), Some(Ok(ident("five"))));
        assert_eq!(tokens.next(), None);
    }

    #[test]
    fn test_string_escapes() {
        let mut tokens = Token::lexer(r#""hi\n\"there\"\0""#);
        assert_eq!(tokens.next(), Some(Ok(Token::String("hi\n\"there\"\0".to_string()))));
        assert_eq!(tokens.next(), None);

        let mut tokens = Token::lexer("\"oops");
        assert_eq!(tokens.next(), Some(Err(LexErr::UnclosedStrLit)));
    }

    #[test]
    fn test_parse_sections() {
        let src = "
            five: .word 5, -1, 0x20
            msg:  .text \"ok\"
            EXTERN helper
            BEGIN
            loop:
                LDA five
                JAL helper
                HALT
            END
        ";
        let stmts = parse_source(src).unwrap();
        let kinds: Vec<_> = stmts.iter().map(|s| &s.kind).collect();

        assert_eq!(kinds[0], &StmtKind::Word { label: "five".to_string(), values: vec![5, -1, 0x20] });
        assert_eq!(kinds[1], &StmtKind::Text { label: "msg".to_string(), string: "ok".to_string() });
        assert_eq!(kinds[2], &StmtKind::Extern("helper".to_string()));
        assert_eq!(kinds[3], &StmtKind::Begin);
        assert_eq!(kinds[4], &StmtKind::Label("loop".to_string()));
        assert_eq!(kinds[5], &StmtKind::Instr { op: Opcode::Lda, operand: Some(Operand::Sym("five".to_string())) });
        assert_eq!(kinds[6], &StmtKind::Instr { op: Opcode::Jal, operand: Some(Operand::Sym("helper".to_string())) });
        assert_eq!(kinds[7], &StmtKind::Instr { op: Opcode::Halt, operand: None });
        assert_eq!(kinds[8], &StmtKind::End);
    }

    #[test]
    fn test_unknown_mnemonic() {
        let err = parse_source("BEGIN\nLDX 3\nEND").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::UnknownMnemonic("LDX".to_string()));
        assert_eq!(err.line, 2);
    }

    #[test]
    fn test_unknown_directive() {
        let err = parse_source("x: .byte 3").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::UnknownDirective("byte".to_string()));
    }

    #[test]
    fn test_negative_operand_rejected() {
        let err = parse_source("BEGIN\nSET -1\nEND").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::NegativeOperand);
    }

    #[test]
    fn test_malformed_line() {
        let err = parse_source("LDA five, six").unwrap_err();
        assert_eq!(err.kind, ParseErrKind::MalformedLine);
        assert_eq!(err.line, 1);
    }
}
