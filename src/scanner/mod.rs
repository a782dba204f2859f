use crate::bytecode::Opcode;
use logos::{Lexer, Logos};
use serde::Serialize;

/// Half-open byte range into the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Token {
    pub line: u32,
    /// 1-based column range on the token's line(s).
    pub col_start: u32,
    pub col_end: u32,
    pub span: Span,
    pub kind: TokenKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TokenKind {
    Op(Opcode),
    Register(u8),
    Int32(i32),
    Float32(f32),
    Str(String),
    Label(String),
    LabelRef(String),
    Err(String),
}

#[derive(Debug, Clone, Default, PartialEq, thiserror::Error)]
pub enum ScanError {
    #[error("Unknown opcode: {0}")]
    UnknownOpcode(String),
    #[error("Register index out of range: {0}")]
    RegisterRange(String),
    #[error("Integer literal out of range: {0}")]
    IntRange(String),
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[default]
    #[error("Unknown token")]
    Unknown,
}

fn op_callback(lex: &mut Lexer<RawToken>) -> Result<Opcode, ScanError> {
    Opcode::from_mnemonic(lex.slice())
        .ok_or_else(|| ScanError::UnknownOpcode(lex.slice().to_string()))
}

fn register_callback(lex: &mut Lexer<RawToken>) -> Result<u8, ScanError> {
    lex.slice()[1..]
        .parse::<u32>()
        .ok()
        .and_then(|v| u8::try_from(v).ok())
        .ok_or_else(|| ScanError::RegisterRange(lex.slice().to_string()))
}

fn int_callback(lex: &mut Lexer<RawToken>) -> Result<i32, ScanError> {
    lex.slice()
        .parse::<i32>()
        .map_err(|_| ScanError::IntRange(lex.slice().to_string()))
}

fn float_callback(lex: &mut Lexer<RawToken>) -> f32 {
    // The regex admits only digits, an optional sign, and one dot; f32
    // parsing cannot fail on that shape.
    lex.slice().parse::<f32>().unwrap_or(0.0)
}

fn unterminated_string_callback(_lex: &mut Lexer<RawToken>) -> Result<(), ScanError> {
    Err(ScanError::UnterminatedString)
}

fn unknown_callback(_lex: &mut Lexer<RawToken>) -> Result<(), ScanError> {
    Err(ScanError::Unknown)
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = ScanError)]
#[logos(skip r"[ \t\r\n,]+")]
enum RawToken {
    #[regex(r"[A-Z][A-Za-z0-9_]*", op_callback)]
    Op(Opcode),

    #[regex(r"r[0-9]+", register_callback, priority = 6)]
    Register(u8),

    #[regex(r"[+-]?[0-9]+", int_callback)]
    Int32(i32),

    #[regex(r"[+-]?([0-9]+\.[0-9]*|\.[0-9]+)", float_callback)]
    Float32(f32),

    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),

    #[regex(r#""[^"]*"#, unterminated_string_callback)]
    Unterminated,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*:", |lex| {
        let s = lex.slice();
        s[..s.len() - 1].to_string()
    })]
    Label(String),

    #[regex(r"@[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    LabelRef(String),

    // A bare identifier is not a thing in this assembly; swallowing the whole
    // run keeps the error to one token instead of one per character.
    #[regex(r"[a-z_][A-Za-z0-9_]*", unknown_callback, priority = 1)]
    Junk,
}

fn describe(err: &ScanError, text: &str, pos: usize) -> String {
    match err {
        ScanError::Unknown => {
            format!("Unknown token '{}' starting at position {}", text, pos)
        }
        other => format!("{} at position {}", other, pos),
    }
}

/// Walk a 1-based line/column cursor forward across `source[from..to]`.
fn advance(source: &str, from: usize, to: usize, line: &mut u32, col: &mut u32) {
    for &b in &source.as_bytes()[from..to] {
        if b == b'\n' {
            *line += 1;
            *col = 1;
        } else {
            *col += 1;
        }
    }
}

/// Scan source text into a flat token sequence. Never fails: anything the
/// scanner cannot recognise becomes a `TokenKind::Err` carrying a message,
/// and scanning continues on the next token.
pub fn scan(source: &str) -> Vec<Token> {
    let mut lexer = RawToken::lexer(source);
    let mut tokens = Vec::new();

    // Tokens arrive in offset order, so positions fall out of one pass:
    // advance the cursor over the gap before the token, note where it
    // starts, then advance across the token itself.
    let mut line = 1u32;
    let mut col = 1u32;
    let mut cursor = 0usize;

    while let Some(item) = lexer.next() {
        let range = lexer.span();
        let kind = match item {
            Ok(RawToken::Op(op)) => TokenKind::Op(op),
            Ok(RawToken::Register(r)) => TokenKind::Register(r),
            Ok(RawToken::Int32(v)) => TokenKind::Int32(v),
            Ok(RawToken::Float32(v)) => TokenKind::Float32(v),
            Ok(RawToken::Str(s)) => TokenKind::Str(s),
            Ok(RawToken::Label(name)) => TokenKind::Label(name),
            Ok(RawToken::LabelRef(name)) => TokenKind::LabelRef(name),
            // These two rules always error out of their callbacks.
            Ok(RawToken::Unterminated) | Ok(RawToken::Junk) => unreachable!(),
            Err(e) => TokenKind::Err(describe(&e, &source[range.clone()], range.start)),
        };
        advance(source, cursor, range.start, &mut line, &mut col);
        let token_line = line;
        let col_start = col;
        advance(source, range.start, range.end, &mut line, &mut col);
        cursor = range.end;
        tokens.push(Token {
            line: token_line,
            col_start,
            col_end: col,
            span: Span {
                start: range.start,
                end: range.end,
            },
            kind,
        });
    }

    tokens
}
