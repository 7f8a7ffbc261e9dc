//! Expression text parser
//!
//! Hand-written tokenizer plus precedence climbing. Accepts the canonical
//! form produced by `Display` as well as the looser forms rule authors type
//! (`AND`/`&&`/`&`, `=`/`==`, `c ? a : b` or `IF(c, a, b)`).

use crate::ast::{BinaryOp, Constant, Expr, TemporalOp, UnaryOp};
use crate::error::{CalcError, Result};
use chrono::TimeDelta;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Duration(TimeDelta),
    Text(String),
    Ident(String),
    Bracketed(String),
    True,
    False,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Question,
    Colon,
    Bang,
    Op(BinaryOp),
    Eof,
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    position: usize,
}

/// Parse a duration unit suffix such as `h`, `min` or `d`
fn duration_from_unit(value: f64, unit: &str) -> Option<TimeDelta> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" => 1.0,
        "m" | "min" | "mins" => 60.0,
        "h" | "hr" | "hrs" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "wk" | "wks" => 604_800.0,
        _ => return None,
    };
    Some(TimeDelta::milliseconds((value * seconds * 1000.0).round() as i64))
}

fn tokenize(input: &str) -> Result<Vec<Spanned>> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (position, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let single = match c {
            '(' => Some(Token::LParen),
            ')' => Some(Token::RParen),
            '{' => Some(Token::LBrace),
            '}' => Some(Token::RBrace),
            ',' => Some(Token::Comma),
            '.' if !chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit()) => Some(Token::Dot),
            '?' => Some(Token::Question),
            ':' => Some(Token::Colon),
            '+' => Some(Token::Op(BinaryOp::Add)),
            '-' => Some(Token::Op(BinaryOp::Subtract)),
            '*' => Some(Token::Op(BinaryOp::Multiply)),
            '/' => Some(Token::Op(BinaryOp::Divide)),
            '%' => Some(Token::Op(BinaryOp::Modulo)),
            '^' => Some(Token::Op(BinaryOp::Power)),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(Spanned { token, position });
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|(_, n)| *n);
        let double = match (c, next) {
            ('=', Some('=')) | ('!', Some('=')) | ('<', Some('=')) | ('>', Some('=')) => true,
            ('<', Some('>')) | ('&', Some('&')) | ('|', Some('|')) => true,
            _ => false,
        };
        if double {
            let token = match c {
                '=' => Token::Op(BinaryOp::Equal),
                '!' => Token::Op(BinaryOp::NotEqual),
                '<' if next == Some('>') => Token::Op(BinaryOp::NotEqual),
                '<' => Token::Op(BinaryOp::LessOrEqual),
                '>' => Token::Op(BinaryOp::GreaterOrEqual),
                '&' => Token::Op(BinaryOp::And),
                _ => Token::Op(BinaryOp::Or),
            };
            tokens.push(Spanned { token, position });
            i += 2;
            continue;
        }

        let operator = match c {
            '=' => Some(Token::Op(BinaryOp::Equal)),
            '<' => Some(Token::Op(BinaryOp::Less)),
            '>' => Some(Token::Op(BinaryOp::Greater)),
            '&' => Some(Token::Op(BinaryOp::And)),
            '|' => Some(Token::Op(BinaryOp::Or)),
            '!' => Some(Token::Bang),
            _ => None,
        };
        if let Some(token) = operator {
            tokens.push(Spanned { token, position });
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(CalcError::parse(position, "Unterminated string")),
                    Some((_, '\\')) if chars.get(i + 1).is_some() => {
                        text.push(chars[i + 1].1);
                        i += 2;
                    },
                    Some((_, ch)) if *ch == quote => {
                        i += 1;
                        break;
                    },
                    Some((_, ch)) => {
                        text.push(*ch);
                        i += 1;
                    },
                }
            }
            tokens.push(Spanned {
                token: Token::Text(text),
                position,
            });
            continue;
        }

        if c == '[' {
            let mut depth = 1;
            let mut text = String::new();
            i += 1;
            while depth > 0 {
                match chars.get(i) {
                    None => return Err(CalcError::parse(position, "Unterminated '['")),
                    Some((_, '[')) => depth += 1,
                    Some((_, ']')) => depth -= 1,
                    _ => {},
                }
                if depth > 0 {
                    text.push(chars[i].1);
                }
                i += 1;
            }
            let name = text.trim();
            if name.is_empty() {
                return Err(CalcError::parse(position, "Empty identifier '[]'"));
            }
            tokens.push(Spanned {
                token: Token::Bracketed(name.to_string()),
                position,
            });
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            // Exponent, only when followed by a digit so `2e` stays a unit error
            if i < chars.len() && (chars[i].1 == 'e' || chars[i].1 == 'E') {
                let mut j = i + 1;
                if j < chars.len() && (chars[j].1 == '+' || chars[j].1 == '-') {
                    j += 1;
                }
                if j < chars.len() && chars[j].1.is_ascii_digit() {
                    i = j;
                    while i < chars.len() && chars[i].1.is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            let literal: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            let value: f64 = literal
                .parse()
                .map_err(|_| CalcError::parse(position, format!("Invalid number '{}'", literal)))?;

            let unit_start = i;
            while i < chars.len() && chars[i].1.is_ascii_alphabetic() {
                i += 1;
            }
            if unit_start == i {
                tokens.push(Spanned {
                    token: Token::Number(value),
                    position,
                });
            } else {
                let unit: String = chars[unit_start..i].iter().map(|(_, ch)| ch).collect();
                let duration = duration_from_unit(value, &unit).ok_or_else(|| {
                    CalcError::parse(position, format!("Unknown duration unit '{}'", unit))
                })?;
                tokens.push(Spanned {
                    token: Token::Duration(duration),
                    position,
                });
            }
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|(_, ch)| ch).collect();
            let token = match word.to_ascii_uppercase().as_str() {
                "TRUE" => Token::True,
                "FALSE" => Token::False,
                "AND" => Token::Op(BinaryOp::And),
                "OR" => Token::Op(BinaryOp::Or),
                "NOT" => Token::Bang,
                _ => Token::Ident(word),
            };
            tokens.push(Spanned { token, position });
            continue;
        }

        return Err(CalcError::parse(
            position,
            format!("Unexpected character '{}'", c),
        ));
    }

    tokens.push(Spanned {
        token: Token::Eof,
        position: input.len(),
    });
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.cursor.min(self.tokens.len() - 1)].token
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        &self.tokens[(self.cursor + ahead).min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.cursor.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(CalcError::parse(
                self.position(),
                format!("Expected {} but found {:?}", what, self.peek()),
            ))
        }
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        let condition = self.parse_binary(1)?;
        if self.eat(&Token::Question) {
            let then = self.parse_expression()?;
            self.expect(&Token::Colon, "':'")?;
            let otherwise = self.parse_expression()?;
            return Ok(Expr::ternary(condition, then, otherwise));
        }
        Ok(condition)
    }

    fn parse_binary(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Op(op) if op.precedence() >= min_precedence => *op,
                _ => break,
            };
            self.advance();
            // `^` is right associative
            let next = if op == BinaryOp::Power {
                op.precedence()
            } else {
                op.precedence() + 1
            };
            let right = self.parse_binary(next)?;
            left = Expr::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Op(BinaryOp::Subtract) => {
                self.advance();
                let child = self.parse_unary()?;
                Ok(match child {
                    Expr::Constant(Constant::Number(n)) => Expr::number(-n),
                    other => Expr::unary(UnaryOp::Negate, other),
                })
            },
            Token::Op(BinaryOp::Add) => {
                self.advance();
                self.parse_unary()
            },
            Token::Bang => {
                self.advance();
                Ok(Expr::unary(UnaryOp::Not, self.parse_unary()?))
            },
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        while self.eat(&Token::Dot) {
            let name = match self.advance() {
                Token::Ident(name) | Token::Bracketed(name) => name,
                other => {
                    return Err(CalcError::parse(
                        self.position(),
                        format!("Expected property name after '.' but found {:?}", other),
                    ))
                },
            };
            expr = Expr::Property {
                child: Box::new(expr),
                name,
            };
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.advance() {
            Token::Number(n) => Ok(Expr::number(n)),
            Token::Text(s) => Ok(Expr::text(s)),
            Token::True => Ok(Expr::boolean(true)),
            Token::False => Ok(Expr::boolean(false)),
            Token::Bracketed(name) => Ok(Expr::variable(name)),
            Token::Ident(name) => {
                if self.peek() == &Token::LParen {
                    self.parse_call(name)
                } else if name.eq_ignore_ascii_case("NULL") {
                    Ok(Expr::Constant(Constant::Null))
                } else {
                    Ok(Expr::variable(name))
                }
            },
            Token::LParen => {
                let inner = self.parse_expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            },
            Token::LBrace => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBrace) {
                    loop {
                        items.push(self.parse_expression()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                    self.expect(&Token::RBrace, "'}'")?;
                }
                Ok(Expr::Array(items))
            },
            Token::Duration(_) => Err(CalcError::parse(
                position,
                "A duration is only valid as a time window argument",
            )),
            other => Err(CalcError::parse(
                position,
                format!("Unexpected token {:?}", other),
            )),
        }
    }

    /// Consume `[-]<duration>` if it is next
    fn try_duration(&mut self) -> Option<TimeDelta> {
        match (self.peek().clone(), self.peek_at(1).clone()) {
            (Token::Duration(d), _) => {
                self.advance();
                Some(d)
            },
            (Token::Op(BinaryOp::Subtract), Token::Duration(d)) => {
                self.advance();
                self.advance();
                Some(-d)
            },
            _ => None,
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        let position = self.position();
        self.expect(&Token::LParen, "'('")?;
        let name = name.to_ascii_uppercase();

        let mut args = Vec::new();
        let mut durations = Vec::new();
        if self.peek() != &Token::RParen {
            loop {
                if let Some(duration) = self.try_duration() {
                    durations.push(duration);
                } else if durations.is_empty() {
                    args.push(self.parse_expression()?);
                } else {
                    return Err(CalcError::parse(
                        self.position(),
                        "Only durations may follow a time window",
                    ));
                }
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')'")?;

        let temporal = TemporalOp::from_name(&name);

        if !durations.is_empty() {
            let op = temporal.ok_or_else(|| {
                CalcError::parse(position, format!("{} does not take a time window", name))
            })?;
            if args.len() != 1 || durations.len() > 2 {
                return Err(CalcError::parse(
                    position,
                    format!("{} expects (value, window[, offset])", name),
                ));
            }
            let child = args.remove(0);
            return Ok(Expr::Temporal {
                op,
                child: Box::new(child),
                window: Some(durations[0]),
                offset: durations.get(1).copied().unwrap_or_else(TimeDelta::zero),
            });
        }

        if let Some(op) = temporal.filter(|op| op.is_pointwise()) {
            if args.len() != 1 {
                return Err(CalcError::parse(position, format!("{} expects one argument", name)));
            }
            return Ok(Expr::Temporal {
                op,
                child: Box::new(args.remove(0)),
                window: None,
                offset: TimeDelta::zero(),
            });
        }

        if name == "IF" {
            if args.len() != 3 {
                return Err(CalcError::parse(position, "IF expects three arguments"));
            }
            let otherwise = args.remove(2);
            let then = args.remove(1);
            let condition = args.remove(0);
            return Ok(Expr::ternary(condition, then, otherwise));
        }

        Ok(Expr::call(name, args))
    }
}

/// Parse expression text into a tree
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, cursor: 0 };
    if parser.peek() == &Token::Eof {
        return Err(CalcError::parse(0, "Empty expression"));
    }
    let expr = parser.parse_expression()?;
    if parser.peek() != &Token::Eof {
        return Err(CalcError::parse(
            parser.position(),
            format!("Unexpected trailing {:?}", parser.peek()),
        ));
    }
    Ok(expr)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_precedence() {
        let expr = parse("a + b * 2 > 10 & !c").unwrap();
        assert_eq!(expr.to_string(), "((a + (b * 2)) > 10) & !c");
    }

    #[test]
    fn test_power_is_right_associative() {
        let expr = parse("2 ^ 3 ^ 2").unwrap();
        assert_eq!(expr.to_string(), "2 ^ (3 ^ 2)");
    }

    #[test]
    fn test_keyword_operators() {
        let a = parse("x AND y OR NOT z").unwrap();
        let b = parse("x && y || !z").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_bracketed_identifiers() {
        let expr = parse("[dtmi:com:willowinc:ZoneAirTemperatureSensor;1] - [Zone Air Temp Sp]")
            .unwrap();
        match expr {
            Expr::Binary { left, right, .. } => {
                assert_eq!(
                    *left,
                    Expr::variable("dtmi:com:willowinc:ZoneAirTemperatureSensor;1")
                );
                assert_eq!(*right, Expr::variable("Zone Air Temp Sp"));
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_property_access() {
        let expr = parse("[FCU;1].[ZoneAirTemperatureSensor;1]").unwrap();
        assert_eq!(expr.to_string(), "[FCU;1].[ZoneAirTemperatureSensor;1]");
    }

    #[test]
    fn test_temporal_calls() {
        let expr = parse("MAX([sensor], 1h)").unwrap();
        assert!(matches!(
            expr,
            Expr::Temporal {
                op: TemporalOp::Max,
                window: Some(w),
                ..
            } if w == TimeDelta::hours(1)
        ));

        let anchored = parse("average(x, 1d, -1d)").unwrap();
        assert_eq!(anchored.to_string(), "AVERAGE(x, 1d, -1d)");

        let delta = parse("DELTA(x)").unwrap();
        assert!(matches!(
            delta,
            Expr::Temporal {
                op: TemporalOp::Delta,
                window: None,
                ..
            }
        ));
    }

    #[test]
    fn test_array_function_without_window_is_a_call() {
        let expr = parse("MAX(a, b)").unwrap();
        assert_eq!(expr, Expr::call("MAX", vec![Expr::variable("a"), Expr::variable("b")]));
    }

    #[test]
    fn test_if_becomes_ternary() {
        let a = parse("IF(x > 1, 2, 3)").unwrap();
        let b = parse("x > 1 ? 2 : 3").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_duration_units() {
        let expr = parse("MIN(x, 15min)").unwrap();
        assert_eq!(expr.to_string(), "MIN(x, 15m)");
        assert!(parse("MIN(x, 15parsecs)").is_err());
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse("a + (b * 2").unwrap_err();
        assert!(matches!(err, CalcError::Parse { position: 10, .. }));
        assert!(parse("").is_err());
        assert!(parse("ABS(1h)").is_err());
        assert!(parse("a b").is_err());
    }

    #[test]
    fn test_canonical_text_reparses_to_same_tree() {
        let source = "IF(OPTION([a], [b]) >= 2.5, {1, 2}, \"x\")";
        let first = parse(source).unwrap();
        let second = parse(&first.to_string()).unwrap();
        assert_eq!(first, second);
    }
}
