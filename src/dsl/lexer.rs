// src/dsl/lexer.rs
//
// =============================================================================
// VOXLOGICA: IMGQL LEXER (v 2.0)
// =============================================================================
//
// Turns UTF-8 source text into a position-tagged token stream.
//
// Lexical classes:
// - identifiers  [A-Za-z_][A-Za-z0-9_]* with optional `ns.name` qualification
// - operator symbols: runs of  # ; : ' | ! $ % & / ^ = * - + < > ? @ ~ `
//   (letters and `_` excluded so operators never collide with identifiers)
// - numbers: unsigned decimal integers/floats with optional exponent; the
//   parser folds a leading `-` into the literal
// - double-quoted strings with \" \\ \n \t \r escapes
// - comments: `//` to end of line (a lone `/` still lexes as an operator)

use crate::core::{EngineError, Position};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Ident(String),
    /// A run of operator-symbol characters, e.g. `+` or `<=`.
    Op(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    Comma,
    /// A lone `=`, the binding sign of `let`.
    Equals,
    Let,
    In,
    For,
    Do,
    Print,
    Save,
    Import,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub pos: Position,
}

const OP_CHARS: &str = "#;:'|!$%&/^=*-+<>?@~`";

fn is_op_char(c: char) -> bool {
    OP_CHARS.contains(c)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, EngineError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut column = 1usize;

    macro_rules! bump {
        () => {{
            let c = chars.next();
            if let Some(ch) = c {
                if ch == '\n' {
                    line += 1;
                    column = 1;
                } else {
                    column += 1;
                }
            }
            c
        }};
    }

    while let Some(&c) = chars.peek() {
        let pos = Position::new(line, column);

        // Whitespace
        if c.is_whitespace() {
            bump!();
            continue;
        }

        // Comments: `//` to end of line. Checked before the operator rule so
        // a comment is never lexed as a `//` operator.
        if c == '/' {
            let mut lookahead = chars.clone();
            lookahead.next();
            if lookahead.peek() == Some(&'/') {
                while let Some(&n) = chars.peek() {
                    if n == '\n' {
                        break;
                    }
                    bump!();
                }
                continue;
            }
        }

        // Delimiters
        if c == '(' || c == ')' || c == ',' {
            bump!();
            let tok = match c {
                '(' => Tok::LParen,
                ')' => Tok::RParen,
                _ => Tok::Comma,
            };
            tokens.push(Token { tok, pos });
            continue;
        }

        // Strings
        if c == '"' {
            bump!();
            let mut value = String::new();
            loop {
                match bump!() {
                    None => {
                        return Err(EngineError::Parse {
                            pos,
                            message: "unterminated string literal".into(),
                        })
                    }
                    Some('"') => break,
                    Some('\\') => match bump!() {
                        Some('"') => value.push('"'),
                        Some('\\') => value.push('\\'),
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        other => {
                            return Err(EngineError::Parse {
                                pos,
                                message: format!("invalid escape sequence: \\{:?}", other),
                            })
                        }
                    },
                    Some(other) => value.push(other),
                }
            }
            tokens.push(Token {
                tok: Tok::Str(value),
                pos,
            });
            continue;
        }

        // Numbers (unsigned; sign is the parser's business)
        if c.is_ascii_digit() {
            let mut text = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_digit() {
                    text.push(n);
                    bump!();
                } else {
                    break;
                }
            }
            // Fractional part: only if `.` is followed by a digit.
            if chars.peek() == Some(&'.') {
                let mut lookahead = chars.clone();
                lookahead.next();
                if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    text.push('.');
                    bump!();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_digit() {
                            text.push(n);
                            bump!();
                        } else {
                            break;
                        }
                    }
                }
            }
            // Exponent
            if matches!(chars.peek(), Some('e') | Some('E')) {
                let mut lookahead = chars.clone();
                lookahead.next();
                let signed = matches!(lookahead.peek(), Some('+') | Some('-'));
                if signed {
                    lookahead.next();
                }
                if lookahead.peek().is_some_and(|d| d.is_ascii_digit()) {
                    text.push('e');
                    bump!();
                    if signed {
                        text.push(bump!().unwrap_or('+'));
                    }
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_digit() {
                            text.push(n);
                            bump!();
                        } else {
                            break;
                        }
                    }
                }
            }
            let value: f64 = text.parse().map_err(|_| EngineError::Parse {
                pos,
                message: format!("invalid number literal '{}'", text),
            })?;
            tokens.push(Token {
                tok: Tok::Number(value),
                pos,
            });
            continue;
        }

        // Identifiers, keywords, qualified names
        if is_ident_start(c) {
            let mut name = String::new();
            while let Some(&n) = chars.peek() {
                if is_ident_continue(n) {
                    name.push(n);
                    bump!();
                } else {
                    break;
                }
            }
            // Qualification: `ns.name` lexes as a single identifier.
            if chars.peek() == Some(&'.') {
                let mut lookahead = chars.clone();
                lookahead.next();
                if lookahead.peek().is_some_and(|d| is_ident_start(*d)) {
                    name.push('.');
                    bump!();
                    while let Some(&n) = chars.peek() {
                        if is_ident_continue(n) {
                            name.push(n);
                            bump!();
                        } else {
                            break;
                        }
                    }
                }
            }
            let tok = match name.as_str() {
                "let" => Tok::Let,
                "in" => Tok::In,
                "for" => Tok::For,
                "do" => Tok::Do,
                "print" => Tok::Print,
                "save" => Tok::Save,
                "import" => Tok::Import,
                "true" => Tok::True,
                "false" => Tok::False,
                _ => Tok::Ident(name),
            };
            tokens.push(Token { tok, pos });
            continue;
        }

        // Operator symbols
        if is_op_char(c) {
            let mut op = String::new();
            while let Some(&n) = chars.peek() {
                if is_op_char(n) {
                    op.push(n);
                    bump!();
                } else {
                    break;
                }
            }
            let tok = if op == "=" { Tok::Equals } else { Tok::Op(op) };
            tokens.push(Token { tok, pos });
            continue;
        }

        return Err(EngineError::Parse {
            pos,
            message: format!("unexpected character '{}'", c),
        });
    }

    Ok(tokens)
}
