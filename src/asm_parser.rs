// SPDX-License-Identifier: (Apache-2.0 OR MIT)
// Copyright 2017 Rich Lane <lanerl@gmail.com>

//! This module parses eBPF assembly language source code.

use combine::parser::char::{alpha_num, char, digit, hex_digit, spaces, string};
use combine::stream::position;
use combine::{
    attempt, between, eof, many, many1, one_of, optional, sep_by, EasyParser, ParseError, Parser,
    Stream,
};

/// Operand of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// Register number.
    Register(i64),
    /// Jump offset or immediate.
    Integer(i64),
    /// Register number and offset.
    Memory(i64, i64),
    /// Used for pattern matching.
    Nil,
}

/// Parsed instruction.
#[derive(Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Instruction name.
    pub name: String,
    /// Operands.
    pub operands: Vec<Operand>,
}

fn ident<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(alpha_num())
}

fn integer<Input>() -> impl Parser<Input, Output = i64>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let sign = optional(one_of("-+".chars())).map(|x| match x {
        Some('-') => -1,
        _ => 1,
    });
    let hex = string("0x")
        .with(many1(hex_digit()))
        .map(|x: String| u64::from_str_radix(&x, 16).unwrap_or(0) as i64);
    let dec = many1(digit()).map(|x: String| x.parse::<i64>().unwrap_or(0));
    (sign, attempt(hex).or(dec)).map(|(sign, value): (i64, i64)| sign * value)
}

fn register<Input>() -> impl Parser<Input, Output = i64>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    char('r')
        .with(many1(digit()))
        .map(|x: String| x.parse::<i64>().unwrap_or(0))
}

fn operand<Input>() -> impl Parser<Input, Output = Operand>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let register_operand = register().map(Operand::Register);
    let immediate = integer().map(Operand::Integer);
    let memory = between(char('['), char(']'), (register(), optional(integer())))
        .map(|t| Operand::Memory(t.0, t.1.unwrap_or(0)));
    attempt(register_operand).or(immediate).or(memory)
}

fn instruction<Input>() -> impl Parser<Input, Output = Instruction>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    let operands = sep_by(operand(), char(',').skip(spaces()));
    (ident().skip(spaces()), operands, spaces()).map(|t| Instruction {
        name: t.0,
        operands: t.1,
    })
}

/// Parse a string into a list of instructions.
///
/// The instructions are not validated and may have invalid names and operand types.
pub fn parse(input: &str) -> Result<Vec<Instruction>, String> {
    match spaces()
        .with(many(instruction()).skip(eof()))
        .easy_parse(position::Stream::new(input))
    {
        Ok((insts, _)) => Ok(insts),
        Err(err) => Err(format!("Parse error: {}", err)),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse, Instruction, Operand};

    fn ins(name: &str, operands: &[Operand]) -> Instruction {
        Instruction {
            name: name.to_string(),
            operands: operands.to_vec(),
        }
    }

    #[test]
    fn test_parse_no_operands() {
        assert_eq!(parse("exit"), Ok(vec![ins("exit", &[])]));
    }

    #[test]
    fn test_parse_operands() {
        assert_eq!(
            parse("add64 r1, 0x605"),
            Ok(vec![ins(
                "add64",
                &[Operand::Register(1), Operand::Integer(0x605)]
            )])
        );
        assert_eq!(
            parse("ja +1"),
            Ok(vec![ins("ja", &[Operand::Integer(1)])])
        );
        assert_eq!(
            parse("jgt r1, 0, -4"),
            Ok(vec![ins(
                "jgt",
                &[
                    Operand::Register(1),
                    Operand::Integer(0),
                    Operand::Integer(-4)
                ]
            )])
        );
        assert_eq!(
            parse("ldxdw r2, [r10-8]"),
            Ok(vec![ins(
                "ldxdw",
                &[Operand::Register(2), Operand::Memory(10, -8)]
            )])
        );
    }

    #[test]
    fn test_parse_program() {
        assert_eq!(
            parse(
                "
                mov64 r0, r1
                stxb [r10-1], r0
                exit"
            ),
            Ok(vec![
                ins("mov64", &[Operand::Register(0), Operand::Register(1)]),
                ins(
                    "stxb",
                    &[Operand::Memory(10, -1), Operand::Register(0)]
                ),
                ins("exit", &[]),
            ])
        );
    }

    #[test]
    fn test_parse_error() {
        assert!(parse("exit\n$invalid").is_err());
    }
}
