// opcode.rs - Kernel opcode table and token model

use crate::dict::{APPLICATION_MAX, KERNEL_MAX, TOKEN_MAX};
use crate::memory::Cell;

/// Macro to define all kernel opcodes in a single place.
/// Generates the Op enum, name() and from_name() lookups, and the all()
/// table whose order fixes the byte encoding of each opcode.
macro_rules! define_opcodes {
    (
        $(
            $variant:ident => $name:literal : $doc:literal
        ),* $(,)?
    ) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Op {
            $(
                #[doc = $doc]
                $variant,
            )*
        }

        impl Op {
            /// Dictionary name of this opcode.
            pub fn name(&self) -> &'static str {
                match self {
                    $(
                        Op::$variant => $name,
                    )*
                }
            }

            /// Find an opcode by its dictionary name.
            pub fn from_name(name: &str) -> Option<Op> {
                match name {
                    $(
                        $name => Some(Op::$variant),
                    )*
                    _ => None,
                }
            }

            /// All opcodes as (name, opcode) pairs, in token order.
            pub fn all() -> &'static [(&'static str, Op)] {
                &[
                    $(
                        ($name, Op::$variant),
                    )*
                ]
            }
        }
    };
}

// Kernel opcode set. Declaration order is the wire encoding: the first 128
// entries are single-byte tokens, anything past that is reached through the
// (kernel) prefix. Names in parentheses take inline operands and are not
// meant to be typed interactively.
define_opcodes! {
    // Control structure and literals
    Exit => "exit": "exit ( -- ) Pop instruction pointer from return stack",
    Lit => "(literal)": "(literal) ( -- x ) Push inline cell, little-endian",
    Clit => "(cliteral)": "(cliteral) ( -- x ) Push sign-extended inline byte",
    Slit => "(sliteral)": "(sliteral) ( -- addr ) Push address of inline string, branch over it",
    Var => "(var)": "(var) ( -- addr ) Push inline cell and return",
    Const => "(const)": "(const) ( -- x ) Push inline cell and return",
    Does => "(does)": "(does) ( -- addr ) Pop object pointer slot from return stack, push its cell",
    Func => "(func)": "(func) ( ... ) Call host extension function with inline registry index and env",
    Param => "(param)": "(param) ( xn..x0 -- xn..x0 xi ) Push copy of inline-indexed element",
    Branch => "(branch)": "(branch) ( -- ) Branch always, 8-bit offset",
    ZeroBranch => "(0branch)": "(0branch) ( f -- ) Branch if zero, 8-bit offset",
    Do => "(do)": "(do) ( limit idx -- ) Start loop; branch over body when empty",
    Loop => "(loop)": "(loop) ( -- ) Increment index, branch back until limit",
    PlusLoop => "(+loop)": "(+loop) ( n -- ) Add n to index, branch back until crossed",
    Kernel => "(kernel)": "(kernel) ( -- ) Prefix: next byte is extended kernel token",
    Call => "(call)": "(call) ( -- ) Prefix: next byte is dynamic word index",
    ZeroExit => "0exit": "0exit ( f -- ) Exit when flag is zero",
    Execute => "execute": "execute ( tok -- ) Dispatch token from lookup",
    Trace => "trace": "trace ( f -- ) Set task trace mode",
    Yield => "yield": "yield ( -- ) Suspend task, resume continues after",
    Halt => "halt": "halt ( -- ) Halt task; sticky across resume",
    I => "i": "i ( -- idx ) Innermost loop index",
    J => "j": "j ( -- idx ) Next outer loop index",
    Leave => "leave": "leave ( -- ) Force loop exit at next (loop)",

    // Memory access
    CFetch => "c@": "c@ ( addr -- x ) Load signed byte",
    CStore => "c!": "c! ( x addr -- ) Store byte",
    Fetch => "@": "@ ( addr -- x ) Load cell",
    Store => "!": "! ( x addr -- ) Store cell",
    PlusStore => "+!": "+! ( n addr -- ) Add to cell at address",
    Dp => "dp": "dp ( -- addr ) Address of the data pointer cell",
    Here => "here": "here ( -- addr ) Current data pointer",
    Allot => "allot": "allot ( n -- ) Advance data pointer by n bytes",
    Comma => ",": ", ( x -- ) Compile cell into data space",
    CComma => "c,": "c, ( x -- ) Compile byte into data space",
    Cells => "cells": "cells ( n -- n' ) Convert cells to bytes",
    CellSize => "cell": "cell ( -- n ) Cell width in bytes",

    // Return stack
    ToR => ">r": ">r ( x -- ) Move to return stack",
    RFrom => "r>": "r> ( -- x ) Move from return stack",
    RFetch => "r@": "r@ ( -- x ) Copy top of return stack",

    // Parameter stack
    Sp => "sp": "sp ( -- n ) Current stack pointer index",
    Depth => "depth": "depth ( -- n ) Number of stack elements",
    Drop => "drop": "drop ( x -- ) Drop top of stack",
    Nip => "nip": "nip ( x y -- y ) Drop next of stack",
    Empty => "empty": "empty ( xn..x0 -- ) Empty the stack",
    Dup => "dup": "dup ( x -- x x ) Duplicate top of stack",
    QDup => "?dup": "?dup ( x -- x x | 0 -- 0 ) Duplicate non-zero top of stack",
    Over => "over": "over ( x y -- x y x ) Duplicate next of stack",
    Tuck => "tuck": "tuck ( x y -- y x y ) Duplicate top below next",
    Pick => "pick": "pick ( xn..x0 i -- xn..x0 xi ) Duplicate indexed element",
    Swap => "swap": "swap ( x y -- y x ) Swap top two elements",
    Rot => "rot": "rot ( x y z -- y z x ) Rotate three elements up",
    MinusRot => "-rot": "-rot ( x y z -- z x y ) Rotate three elements down",
    Roll => "roll": "roll ( xn..x0 n -- xn-1..x0 xn ) Rotate n+1 elements",
    TwoSwap => "2swap": "2swap ( x1 x2 y1 y2 -- y1 y2 x1 x2 ) Swap cell pairs",
    TwoDup => "2dup": "2dup ( x y -- x y x y ) Duplicate cell pair",
    TwoOver => "2over": "2over ( x1 x2 y1 y2 -- x1 x2 y1 y2 x1 x2 ) Duplicate next pair",
    TwoDrop => "2drop": "2drop ( x y -- ) Drop cell pair",

    // Constants
    MinusTwo => "-2": "-2 ( -- -2 )",
    MinusOne => "-1": "-1 ( -- -1 )",
    Zero => "0": "0 ( -- 0 )",
    One => "1": "1 ( -- 1 )",
    Two => "2": "2 ( -- 2 )",
    True => "true": "true ( -- -1 )",
    False => "false": "false ( -- 0 )",

    // Bitwise logic
    Bool => "bool": "bool ( x -- f ) Convert to boolean flag",
    Not => "not": "not ( x -- f ) Convert to inverted boolean flag",
    Invert => "invert": "invert ( x -- ~x ) Bitwise complement",
    And => "and": "and ( x y -- x&y )",
    Or => "or": "or ( x y -- x|y )",
    Xor => "xor": "xor ( x y -- x^y )",
    Lshift => "lshift": "lshift ( x n -- x<<n ) Logical shift left",
    Rshift => "rshift": "rshift ( x n -- x>>n ) Logical shift right",

    // Arithmetic
    Negate => "negate": "negate ( x -- -x )",
    OnePlus => "1+": "1+ ( x -- x+1 )",
    OneMinus => "1-": "1- ( x -- x-1 )",
    TwoPlus => "2+": "2+ ( x -- x+2 )",
    TwoMinus => "2-": "2- ( x -- x-2 )",
    TwoStar => "2*": "2* ( x -- x*2 )",
    TwoSlash => "2/": "2/ ( x -- x/2 ) Arithmetic shift right",
    Plus => "+": "+ ( x y -- x+y )",
    Minus => "-": "- ( x y -- x-y )",
    Star => "*": "* ( x y -- x*y )",
    StarSlash => "*/": "*/ ( x y z -- x*y/z ) Double-width intermediate product",
    Slash => "/": "/ ( x y -- x/y ) Quotient, rounds toward zero",
    Mod => "mod": "mod ( x y -- x%y ) Remainder, takes dividend sign",
    SlashMod => "/mod": "/mod ( x y -- x/y x%y ) Quotient and remainder",
    Abs => "abs": "abs ( x -- |x| )",
    Min => "min": "min ( x y -- min )",
    Max => "max": "max ( x y -- max )",
    Within => "within": "within ( x lo hi -- f ) lo <= x < hi, wrapping when lo > hi",

    // Relational
    ZeroNotEquals => "0<>": "0<> ( x -- f )",
    ZeroLess => "0<": "0< ( x -- f )",
    ZeroEquals => "0=": "0= ( x -- f )",
    ZeroGreater => "0>": "0> ( x -- f )",
    NotEquals => "<>": "<> ( x y -- f )",
    Less => "<": "< ( x y -- f )",
    Equals => "=": "= ( x y -- f )",
    Greater => ">": "> ( x y -- f )",
    ULess => "u<": "u< ( x y -- f ) Unsigned less than",

    // Dictionary
    Lookup => "lookup": "lookup ( addr -- tok ) Look up name in dictionary, -1 on miss",
    ToBody => ">body": ">body ( tok -- addr ) Inline cell of a (var)/(const) definition",
    Words => "words": "words ( -- ) Print all dictionary names",
    DotName => ".name": ".name ( tok -- len ) Print token name, push its length",

    // Numeric conversion and basic I/O
    Base => "base": "base ( -- addr ) Address of the numeric conversion base",
    Hex => "hex": "hex ( -- ) Set base 16",
    Decimal => "decimal": "decimal ( -- ) Set base 10",
    QKey => "?key": "?key ( -- c -1 | 0 ) Read character if available",
    Key => "key": "key ( -- c ) Wait for character, yielding",
    Emit => "emit": "emit ( c -- ) Print character",
    Cr => "cr": "cr ( -- ) Print newline",
    Space => "space": "space ( -- ) Print space",
    Spaces => "spaces": "spaces ( n -- ) Print spaces",
    Type => "type": "type ( addr -- ) Print NUL-terminated string from memory",
    DotQuote => "(.\")": "(.\") ( -- ) Print inline NUL-terminated string",
    UDot => "u.": "u. ( x -- ) Print top of stack as unsigned",
    Dot => ".": ". ( x -- ) Print top of stack as signed, trailing space",
    DotS => ".s": ".s ( -- ) Print stack contents",
    Question => "?": "? ( addr -- ) Print value of variable",
    Nop => "nop": "nop ( -- ) No operation",
}

impl Op {
    /// Kernel token of this opcode.
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Opcode for a kernel token, including the prefixed range.
    pub fn from_code(code: u16) -> Option<Op> {
        Op::all().get(code as usize).map(|(_, op)| *op)
    }

    /// Number of kernel opcodes currently defined.
    pub fn count() -> usize {
        Op::all().len()
    }
}

/// A dictionary token. The packed one-or-two-byte encoding exists only at
/// the boundary of code memory; everywhere else tokens are this sum type
/// or the flat cell returned by lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Kernel opcode, tokens 0..KERNEL_MAX.
    Kernel(u8),
    /// Static application word, tokens KERNEL_MAX..APPLICATION_MAX.
    App(u8),
    /// Dynamic application word, tokens APPLICATION_MAX..TOKEN_MAX.
    Word(u8),
}

impl Token {
    /// Decode a flat token cell as returned by lookup.
    pub fn from_cell(tok: Cell) -> Option<Token> {
        let tok = tok as i32;
        if !(0..TOKEN_MAX as i32).contains(&tok) {
            return None;
        }
        let tok = tok as u16;
        if tok < KERNEL_MAX {
            Some(Token::Kernel(tok as u8))
        } else if tok < APPLICATION_MAX {
            Some(Token::App((tok - KERNEL_MAX) as u8))
        } else {
            Some(Token::Word((tok - APPLICATION_MAX) as u8))
        }
    }

    /// Flat token cell for lookup and execute.
    pub fn to_cell(&self) -> Cell {
        match self {
            Token::Kernel(t) => *t as Cell,
            Token::App(i) => (KERNEL_MAX + *i as u16) as Cell,
            Token::Word(i) => (APPLICATION_MAX + *i as u16) as Cell,
        }
    }

    /// Packed byte encoding: one byte for direct kernel tokens and static
    /// application calls, two for the prefixed ranges.
    pub fn encode(&self) -> (u8, Option<u8>) {
        match self {
            Token::Kernel(t) if *t < 128 => (*t, None),
            Token::Kernel(t) => (Op::Kernel.code(), Some(t - 128)),
            Token::App(i) => ((-(*i as i16) - 1) as i8 as u8, None),
            Token::Word(i) => (Op::Call.code(), Some(*i)),
        }
    }
}
