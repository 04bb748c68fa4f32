// src/dsl/parser.rs
//
// =============================================================================
// VOXLOGICA: IMGQL PARSER (v 2.0)
// =============================================================================
//
// Recursive descent over the token stream.
//
// Grammar (commands):
//   program  := { command }
//   command  := 'import' STR
//             | 'print' STR expr
//             | 'save' STR expr
//             | 'let' name [ '(' params ')' ] '=' expr
//   name     := IDENT | OP
//
// Grammar (expressions):
//   expr     := term { OP term }            (left-associative, one level)
//   term     := OP '(' args ')'             (declared operator, call form)
//             | OP term                     (prefix application)
//             | atom
//   atom     := NUMBER | STRING | 'true' | 'false'
//             | IDENT [ '(' args ')' ]
//             | '(' expr ')'
//             | 'let' name '=' expr 'in' expr
//             | 'for' IDENT 'in' expr 'do' expr
//
// `-` directly before a numeric literal folds into a negative literal, so
// `0 - 3` and `-3` stay distinguishable from unary application.

use super::lexer::{tokenize, Tok, Token};
use super::{Command, Expr, ExprKind, Program};
use crate::core::{EngineError, Position};

pub fn parse_source(source: &str) -> Result<Program, EngineError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, index: 0 };
    parser.program()
}

struct Parser {
    tokens: Vec<Token>,
    index: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.index).map(|t| &t.tok)
    }

    fn pos(&self) -> Position {
        self.tokens
            .get(self.index)
            .map(|t| t.pos)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|t| t.pos)
                    .unwrap_or_default()
            })
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.index).cloned();
        if t.is_some() {
            self.index += 1;
        }
        t
    }

    fn error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Parse {
            pos: self.pos(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: &Tok, what: &str) -> Result<Position, EngineError> {
        match self.next() {
            Some(t) if &t.tok == expected => Ok(t.pos),
            Some(t) => Err(EngineError::Parse {
                pos: t.pos,
                message: format!("expected {}, found {:?}", what, t.tok),
            }),
            None => Err(self.error(format!("expected {}, found end of input", what))),
        }
    }

    fn expect_string(&mut self, what: &str) -> Result<(String, Position), EngineError> {
        match self.next() {
            Some(Token {
                tok: Tok::Str(s),
                pos,
            }) => Ok((s, pos)),
            Some(t) => Err(EngineError::Parse {
                pos: t.pos,
                message: format!("expected {} string, found {:?}", what, t.tok),
            }),
            None => Err(self.error(format!("expected {} string, found end of input", what))),
        }
    }

    /// A bindable name: an identifier or a declared operator symbol.
    fn expect_name(&mut self) -> Result<(String, Position), EngineError> {
        match self.next() {
            Some(Token {
                tok: Tok::Ident(name),
                pos,
            }) => Ok((name, pos)),
            Some(Token {
                tok: Tok::Op(name),
                pos,
            }) => Ok((name, pos)),
            Some(t) => Err(EngineError::Parse {
                pos: t.pos,
                message: format!("expected a name, found {:?}", t.tok),
            }),
            None => Err(self.error("expected a name, found end of input")),
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn program(&mut self) -> Result<Program, EngineError> {
        let mut commands = Vec::new();
        while self.peek().is_some() {
            commands.push(self.command()?);
        }
        Ok(Program { commands })
    }

    fn command(&mut self) -> Result<Command, EngineError> {
        match self.peek() {
            Some(Tok::Import) => {
                self.next();
                let (namespace, pos) = self.expect_string("namespace")?;
                Ok(Command::Import { namespace, pos })
            }
            Some(Tok::Print) => {
                self.next();
                let (label, pos) = self.expect_string("label")?;
                let target = self.expr()?;
                Ok(Command::Print { label, target, pos })
            }
            Some(Tok::Save) => {
                self.next();
                let (path, pos) = self.expect_string("path")?;
                let target = self.expr()?;
                Ok(Command::Save { path, target, pos })
            }
            Some(Tok::Let) => {
                self.next();
                let (name, pos) = self.expect_name()?;
                if self.peek() == Some(&Tok::LParen) {
                    let parameters = self.parameter_list()?;
                    self.expect(&Tok::Equals, "'='")?;
                    let body = self.expr()?;
                    Ok(Command::Function {
                        name,
                        parameters,
                        body,
                        pos,
                    })
                } else {
                    self.expect(&Tok::Equals, "'='")?;
                    let body = self.expr()?;
                    Ok(Command::Let { name, body, pos })
                }
            }
            Some(other) => Err(self.error(format!(
                "expected a command (let/print/save/import), found {:?}",
                other
            ))),
            None => Err(self.error("expected a command, found end of input")),
        }
    }

    fn parameter_list(&mut self) -> Result<Vec<String>, EngineError> {
        self.expect(&Tok::LParen, "'('")?;
        let mut params = Vec::new();
        if self.peek() == Some(&Tok::RParen) {
            self.next();
            return Ok(params);
        }
        loop {
            match self.next() {
                Some(Token {
                    tok: Tok::Ident(name),
                    ..
                }) => params.push(name),
                Some(t) => {
                    return Err(EngineError::Parse {
                        pos: t.pos,
                        message: format!("expected a parameter name, found {:?}", t.tok),
                    })
                }
                None => return Err(self.error("expected a parameter name, found end of input")),
            }
            match self.next() {
                Some(Token {
                    tok: Tok::Comma, ..
                }) => continue,
                Some(Token {
                    tok: Tok::RParen, ..
                }) => break,
                Some(t) => {
                    return Err(EngineError::Parse {
                        pos: t.pos,
                        message: format!("expected ',' or ')', found {:?}", t.tok),
                    })
                }
                None => return Err(self.error("expected ')' in parameter list")),
            }
        }
        Ok(params)
    }

    // ------------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------------

    fn expr(&mut self) -> Result<Expr, EngineError> {
        let mut lhs = self.term()?;
        while let Some(Tok::Op(_)) = self.peek() {
            let Some(Token {
                tok: Tok::Op(op),
                pos,
            }) = self.next()
            else {
                unreachable!()
            };
            let rhs = self.term()?;
            lhs = Expr::new(
                ExprKind::Call {
                    callee: op,
                    args: vec![lhs, rhs],
                },
                pos,
            );
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EngineError> {
        if let Some(Tok::Op(_)) = self.peek() {
            let Some(Token {
                tok: Tok::Op(op),
                pos,
            }) = self.next()
            else {
                unreachable!()
            };
            // Negative literal fold
            if op == "-" {
                if let Some(Tok::Number(_)) = self.peek() {
                    let Some(Token {
                        tok: Tok::Number(n),
                        ..
                    }) = self.next()
                    else {
                        unreachable!()
                    };
                    return Ok(Expr::new(ExprKind::Number(-n), pos));
                }
            }
            // Call form: `+(a, b)`
            if self.peek() == Some(&Tok::LParen) {
                let args = self.argument_list()?;
                return Ok(Expr::new(ExprKind::Call { callee: op, args }, pos));
            }
            // Prefix application: `!x`
            let operand = self.term()?;
            return Ok(Expr::new(
                ExprKind::Call {
                    callee: op,
                    args: vec![operand],
                },
                pos,
            ));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, EngineError> {
        match self.next() {
            Some(Token {
                tok: Tok::Number(n),
                pos,
            }) => Ok(Expr::new(ExprKind::Number(n), pos)),
            Some(Token {
                tok: Tok::Str(s),
                pos,
            }) => Ok(Expr::new(ExprKind::String(s), pos)),
            Some(Token {
                tok: Tok::True,
                pos,
            }) => Ok(Expr::new(ExprKind::Bool(true), pos)),
            Some(Token {
                tok: Tok::False,
                pos,
            }) => Ok(Expr::new(ExprKind::Bool(false), pos)),
            Some(Token {
                tok: Tok::Ident(name),
                pos,
            }) => {
                if self.peek() == Some(&Tok::LParen) {
                    let args = self.argument_list()?;
                    Ok(Expr::new(ExprKind::Call { callee: name, args }, pos))
                } else {
                    Ok(Expr::new(ExprKind::Ident(name), pos))
                }
            }
            Some(Token {
                tok: Tok::LParen, ..
            }) => {
                let inner = self.expr()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(inner)
            }
            Some(Token { tok: Tok::Let, pos }) => {
                let (name, _) = self.expect_name()?;
                self.expect(&Tok::Equals, "'='")?;
                let value = self.expr()?;
                self.expect(&Tok::In, "'in'")?;
                let body = self.expr()?;
                Ok(Expr::new(
                    ExprKind::LetIn {
                        name,
                        value: Box::new(value),
                        body: Box::new(body),
                    },
                    pos,
                ))
            }
            Some(Token { tok: Tok::For, pos }) => {
                let (var, _) = self.expect_name()?;
                self.expect(&Tok::In, "'in'")?;
                let iterable = self.expr()?;
                self.expect(&Tok::Do, "'do'")?;
                let body = self.expr()?;
                Ok(Expr::new(
                    ExprKind::For {
                        var,
                        iterable: Box::new(iterable),
                        body: Box::new(body),
                    },
                    pos,
                ))
            }
            Some(t) => Err(EngineError::Parse {
                pos: t.pos,
                message: format!("expected an expression, found {:?}", t.tok),
            }),
            None => Err(self.error("expected an expression, found end of input")),
        }
    }

    fn argument_list(&mut self) -> Result<Vec<Expr>, EngineError> {
        self.expect(&Tok::LParen, "'('")?;
        let mut args = Vec::new();
        if self.peek() == Some(&Tok::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.next() {
                Some(Token {
                    tok: Tok::Comma, ..
                }) => continue,
                Some(Token {
                    tok: Tok::RParen, ..
                }) => break,
                Some(t) => {
                    return Err(EngineError::Parse {
                        pos: t.pos,
                        message: format!("expected ',' or ')', found {:?}", t.tok),
                    })
                }
                None => return Err(self.error("expected ')' in argument list")),
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Program {
        parse_source(src).unwrap()
    }

    #[test]
    fn let_with_infix() {
        let p = parse("let a = 1 + 2");
        let Command::Let { name, body, .. } = &p.commands[0] else {
            panic!("expected let");
        };
        assert_eq!(name, "a");
        let ExprKind::Call { callee, args } = &body.kind else {
            panic!("expected call");
        };
        assert_eq!(callee, "+");
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn infix_is_left_associative() {
        let p = parse("let a = 1 + 2 + 3");
        let Command::Let { body, .. } = &p.commands[0] else {
            panic!()
        };
        let ExprKind::Call { callee, args } = &body.kind else {
            panic!()
        };
        assert_eq!(callee, "+");
        assert!(matches!(&args[0].kind, ExprKind::Call { .. }));
        assert!(matches!(&args[1].kind, ExprKind::Number(n) if *n == 3.0));
    }

    #[test]
    fn operator_declaration() {
        let p = parse("let +(a,b) = addition(a,b)");
        let Command::Function {
            name, parameters, ..
        } = &p.commands[0]
        else {
            panic!("expected function");
        };
        assert_eq!(name, "+");
        assert_eq!(parameters, &["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn for_loop_and_calls() {
        let p = parse("let xs = for i in range(0,3) do i + 1");
        let Command::Let { body, .. } = &p.commands[0] else {
            panic!()
        };
        let ExprKind::For { var, iterable, .. } = &body.kind else {
            panic!("expected for");
        };
        assert_eq!(var, "i");
        assert!(matches!(&iterable.kind, ExprKind::Call { callee, .. } if callee == "range"));
    }

    #[test]
    fn negative_literal_folds() {
        let p = parse("let a = -3");
        let Command::Let { body, .. } = &p.commands[0] else {
            panic!()
        };
        assert!(matches!(&body.kind, ExprKind::Number(n) if *n == -3.0));
    }

    #[test]
    fn let_in_expression() {
        let p = parse("print \"y\" let x = 2 in x * x");
        let Command::Print { label, target, .. } = &p.commands[0] else {
            panic!()
        };
        assert_eq!(label, "y");
        assert!(matches!(&target.kind, ExprKind::LetIn { .. }));
    }

    #[test]
    fn commands_in_sequence() {
        let p = parse("import \"default\"\nlet a = 1\nprint \"a\" a");
        assert_eq!(p.commands.len(), 3);
    }

    #[test]
    fn parse_error_carries_position() {
        let err = parse_source("let = 3").unwrap_err();
        match err {
            EngineError::Parse { pos, .. } => assert_eq!(pos.line, 1),
            other => panic!("unexpected error: {other}"),
        }
    }
}
