// compiler.rs - Colon compiler: defining words and control flow

use crate::assembler::branch_offset;
use crate::dict::WORD_MAX;
use crate::memory::{Cell, Fault};
use crate::opcode::{Op, Token};
use crate::outer::{parse_number, scan_until, scan_word, InterpretError};
use crate::task::Task;
use crate::vm::{Exit, Vm};

#[derive(Debug)]
pub enum CompileError {
    Unknown(String),
    /// A branch target does not fit the 8-bit offset encoding.
    BranchOutOfRange,
    ControlMismatch(&'static str),
    DictionaryFull,
    MissingName,
    Fault(Fault),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CompileError::Unknown(word) => write!(f, "unknown word: {}", word),
            CompileError::BranchOutOfRange => write!(f, "branch offset out of range"),
            CompileError::ControlMismatch(word) => {
                write!(f, "unbalanced control structure: {}", word)
            }
            CompileError::DictionaryFull => write!(f, "dictionary full"),
            CompileError::MissingName => write!(f, "missing name"),
            CompileError::Fault(fault) => write!(f, "{}", fault),
        }
    }
}

impl std::error::Error for CompileError {}

/// Open control structure awaiting its closing word. Patches hold the
/// address of an offset byte still to be resolved.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Frame {
    If { patch: u16 },
    Else { patch: u16 },
    Begin { head: u16 },
    While { head: u16, patch: u16 },
    Do { head: u16, patch: u16 },
}

/// Compile state carried by the VM between interpret steps.
#[derive(Default)]
pub(crate) struct Compile {
    /// Dynamic index of the open colon definition.
    pub(crate) target: Option<usize>,
    /// Start of an interactive control structure compiled for one run.
    pub(crate) anonymous: Option<u16>,
    pub(crate) frames: Vec<Frame>,
}

impl Compile {
    pub(crate) fn is_open(&self) -> bool {
        self.target.is_some() || self.anonymous.is_some()
    }
}

impl Vm {
    pub fn is_compiling(&self) -> bool {
        self.compile.is_open()
    }

    /// Drop any open definition or control structure, e.g. after an error.
    /// An abandoned anonymous structure gives its arena bytes back.
    pub fn abort_compile(&mut self) {
        self.compile.frames.clear();
        self.compile.target = None;
        if let Some(start) = self.compile.anonymous.take() {
            self.memory.set_here(start);
        }
    }

    pub(crate) fn begin_anonymous(&mut self) {
        self.compile.anonymous = Some(self.memory.here());
    }

    /// Once an interactive control structure closes, seal it with a halt,
    /// run it, and give the arena bytes back.
    pub(crate) fn finish_anonymous(&mut self, task: &mut Task) -> Result<(), InterpretError> {
        if self.compile.anonymous.is_none()
            || self.compile.target.is_some()
            || !self.compile.frames.is_empty()
        {
            return Ok(());
        }
        let start = self.compile.anonymous.take().unwrap();
        self.emit_op(Op::Halt).map_err(InterpretError::Compile)?;
        let exit = self.execute_code(start, task);
        // A yielded task is still inside these bytes; leave them in place.
        if exit != Exit::Yield {
            self.memory.set_here(start);
        }
        match exit {
            Exit::Halt | Exit::Yield => Ok(()),
            other => Err(InterpretError::Trap(other)),
        }
    }

    /// Interpret-mode words owned by the compiler layer. Returns true when
    /// the word was one of them.
    pub(crate) fn defining_word(
        &mut self,
        task: &mut Task,
        word: &str,
    ) -> Result<bool, CompileError> {
        match word {
            ":" => {
                let name = self.scan_name(task)?;
                let index = self.define(&name)?;
                self.compile.target = Some(index);
            }
            "variable" => {
                let name = self.scan_name(task)?;
                self.define(&name)?;
                let slot = self.emit_data_head()?;
                let storage = self.memory.here();
                self.emit_cell(0)?;
                self.memory
                    .set_cell(slot, storage as Cell)
                    .map_err(CompileError::Fault)?;
            }
            "constant" => {
                let name = self.scan_name(task)?;
                let value = task.pop().map_err(CompileError::Fault)?;
                self.define(&name)?;
                self.emit_op(Op::Const)?;
                self.emit_cell(value)?;
                self.emit_op(Op::Exit)?;
            }
            "create" => {
                let name = self.scan_name(task)?;
                self.define(&name)?;
                let slot = self.emit_data_head()?;
                let data = self.memory.here();
                self.memory
                    .set_cell(slot, data as Cell)
                    .map_err(CompileError::Fault)?;
            }
            "forget" => {
                let name = self.scan_name(task)?;
                if !self.forget(&name) {
                    return Err(CompileError::Unknown(name));
                }
            }
            "'" => {
                let name = self.scan_name(task)?;
                let token = self.lookup(&name);
                if token < 0 {
                    return Err(CompileError::Unknown(name));
                }
                task.push(token).map_err(CompileError::Fault)?;
            }
            ".\"" => {
                let text = scan_until(task, b'"');
                task.ios.borrow_mut().print(&text);
            }
            ";" => return Err(CompileError::ControlMismatch(";")),
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Compile one word into the open definition.
    pub(crate) fn compile_word(&mut self, task: &mut Task, word: &str) -> Result<(), CompileError> {
        match word {
            ";" => {
                if !self.compile.frames.is_empty() {
                    return Err(CompileError::ControlMismatch(";"));
                }
                if self.compile.target.take().is_none() {
                    return Err(CompileError::ControlMismatch(";"));
                }
                self.emit_op(Op::Exit)?;
            }
            "if" => {
                let patch = self.emit_fwd(Op::ZeroBranch)?;
                self.compile.frames.push(Frame::If { patch });
            }
            "else" => match self.compile.frames.pop() {
                Some(Frame::If { patch }) => {
                    let out = self.emit_fwd(Op::Branch)?;
                    self.patch_branch(patch)?;
                    self.compile.frames.push(Frame::Else { patch: out });
                }
                _ => return Err(CompileError::ControlMismatch("else")),
            },
            "then" => match self.compile.frames.pop() {
                Some(Frame::If { patch }) | Some(Frame::Else { patch }) => {
                    self.patch_branch(patch)?;
                }
                _ => return Err(CompileError::ControlMismatch("then")),
            },
            "begin" => {
                let head = self.memory.here();
                self.compile.frames.push(Frame::Begin { head });
            }
            "until" => match self.compile.frames.pop() {
                Some(Frame::Begin { head }) => self.emit_branch_to(Op::ZeroBranch, head)?,
                _ => return Err(CompileError::ControlMismatch("until")),
            },
            "again" => match self.compile.frames.pop() {
                Some(Frame::Begin { head }) => self.emit_branch_to(Op::Branch, head)?,
                _ => return Err(CompileError::ControlMismatch("again")),
            },
            "while" => match self.compile.frames.pop() {
                Some(Frame::Begin { head }) => {
                    let patch = self.emit_fwd(Op::ZeroBranch)?;
                    self.compile.frames.push(Frame::While { head, patch });
                }
                _ => return Err(CompileError::ControlMismatch("while")),
            },
            "repeat" => match self.compile.frames.pop() {
                Some(Frame::While { head, patch }) => {
                    self.emit_branch_to(Op::Branch, head)?;
                    self.patch_branch(patch)?;
                }
                _ => return Err(CompileError::ControlMismatch("repeat")),
            },
            "do" => {
                let patch = self.emit_fwd(Op::Do)?;
                let head = self.memory.here();
                self.compile.frames.push(Frame::Do { head, patch });
            }
            "loop" => match self.compile.frames.pop() {
                Some(Frame::Do { head, patch }) => {
                    self.emit_branch_to(Op::Loop, head)?;
                    self.patch_branch(patch)?;
                }
                _ => return Err(CompileError::ControlMismatch("loop")),
            },
            "+loop" => match self.compile.frames.pop() {
                Some(Frame::Do { head, patch }) => {
                    self.emit_branch_to(Op::PlusLoop, head)?;
                    self.patch_branch(patch)?;
                }
                _ => return Err(CompileError::ControlMismatch("+loop")),
            },
            "recurse" => {
                let target = self
                    .compile
                    .target
                    .ok_or(CompileError::ControlMismatch("recurse"))?;
                self.emit_token(Token::Word(target as u8))?;
            }
            ".\"" => {
                let text = scan_until(task, b'"');
                self.emit_op(Op::DotQuote)?;
                self.emit_string(&text)?;
            }
            "s\"" => {
                let text = scan_until(task, b'"');
                self.emit_op(Op::Slit)?;
                let at = self.memory.here();
                self.emit_byte(0)?;
                self.emit_string(&text)?;
                let offset =
                    branch_offset(at, self.memory.here()).ok_or(CompileError::BranchOutOfRange)?;
                self.memory
                    .set_byte(at, offset as u8)
                    .map_err(CompileError::Fault)?;
            }
            "'" => {
                let name = self.scan_name(task)?;
                let token = self.lookup(&name);
                if token < 0 {
                    return Err(CompileError::Unknown(name));
                }
                self.emit_literal(token)?;
            }
            _ => {
                if let Some(token) = self.dict.lookup(word, &self.memory) {
                    self.emit_token(token)?;
                } else if let Some(x) = parse_number(word, task.base) {
                    self.emit_literal(x)?;
                } else {
                    return Err(CompileError::Unknown(word.to_string()));
                }
            }
        }
        Ok(())
    }

    fn scan_name(&mut self, task: &mut Task) -> Result<String, CompileError> {
        scan_word(task)
            .map(|(word, _)| word)
            .ok_or(CompileError::MissingName)
    }

    fn define(&mut self, name: &str) -> Result<usize, CompileError> {
        if self.dict.word_count() >= WORD_MAX {
            return Err(CompileError::DictionaryFull);
        }
        self.dict
            .define(name, &mut self.memory)
            .map(|index| index as usize)
            .map_err(CompileError::Fault)
    }

    /// The [(var) slot exit] head shared by variable and create. Returns
    /// the address of the inline cell to point at the data field.
    fn emit_data_head(&mut self) -> Result<u16, CompileError> {
        self.emit_op(Op::Var)?;
        let slot = self.memory.here();
        self.emit_cell(0)?;
        self.emit_op(Op::Exit)?;
        Ok(slot)
    }

    fn emit_byte(&mut self, b: u8) -> Result<(), CompileError> {
        self.memory.c_comma(b).map_err(CompileError::Fault)
    }

    fn emit_op(&mut self, op: Op) -> Result<(), CompileError> {
        self.emit_byte(op.code())
    }

    fn emit_cell(&mut self, x: Cell) -> Result<(), CompileError> {
        self.memory.comma(x).map_err(CompileError::Fault)
    }

    fn emit_token(&mut self, token: Token) -> Result<(), CompileError> {
        let (first, second) = token.encode();
        self.emit_byte(first)?;
        if let Some(b) = second {
            self.emit_byte(b)?;
        }
        Ok(())
    }

    fn emit_literal(&mut self, x: Cell) -> Result<(), CompileError> {
        if let Ok(b) = i8::try_from(x) {
            self.emit_op(Op::Clit)?;
            self.emit_byte(b as u8)
        } else {
            self.emit_op(Op::Lit)?;
            self.emit_cell(x)
        }
    }

    fn emit_string(&mut self, text: &str) -> Result<(), CompileError> {
        for b in text.bytes() {
            self.emit_byte(b)?;
        }
        self.emit_byte(0)
    }

    /// Branch with a placeholder offset; returns the offset byte address.
    fn emit_fwd(&mut self, op: Op) -> Result<u16, CompileError> {
        self.emit_op(op)?;
        let at = self.memory.here();
        self.emit_byte(0)?;
        Ok(at)
    }

    /// Resolve a forward branch to the current compile point.
    fn patch_branch(&mut self, at: u16) -> Result<(), CompileError> {
        let offset =
            branch_offset(at, self.memory.here()).ok_or(CompileError::BranchOutOfRange)?;
        self.memory
            .set_byte(at, offset as u8)
            .map_err(CompileError::Fault)
    }

    fn emit_branch_to(&mut self, op: Op, target: u16) -> Result<(), CompileError> {
        self.emit_op(op)?;
        let at = self.memory.here();
        let offset = branch_offset(at, target).ok_or(CompileError::BranchOutOfRange)?;
        self.emit_byte(offset as u8)
    }
}
