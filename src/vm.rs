// vm.rs - The virtual machine: inner interpreter, execute, trace

use crate::assembler::Assembler;
use crate::compiler::Compile;
use crate::dict::Dict;
use crate::memory::{Cell, DoubleCell, Fault, Memory, BASE_ADDR, CELL};
use crate::opcode::{Op, Token};
use crate::task::Task;
use std::time::Instant;

/// Host extension function: may inspect and mutate the task and the cells
/// its stacks address. The VM reloads its state from the task afterwards.
pub type HostFunc = Box<dyn FnMut(&mut Task, Cell) -> Result<(), Fault>>;

/// Outcome of resuming a task, mirroring the 1/0/-1 return contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Cooperative pause; resuming continues after the yield.
    Yield,
    /// Sticky termination; resuming re-executes the halt.
    Halt,
    /// Undefined token reached the dispatcher.
    Illegal,
    /// Detected stack, memory or arithmetic domain violation.
    Fault(Fault),
}

impl Exit {
    /// The flat return code: 1 on yield, 0 on halt, -1 otherwise.
    pub fn code(&self) -> Cell {
        match self {
            Exit::Yield => 1,
            Exit::Halt => 0,
            _ => -1,
        }
    }
}

/// Entry points of the kernel support code assembled into every image.
pub(crate) struct Sys {
    /// [execute][halt]: the launch pad for execute-by-token.
    pub(crate) execute_halt: u16,
    /// key as threaded code: ?key + yield loop.
    pub(crate) key: u16,
}

/// Assemble the kernel support words at the front of the code image.
/// Address zero holds a halt so a fresh task resumes into a harmless stop.
fn assemble_prelude(asm: &mut Assembler) -> Sys {
    asm.op(Op::Halt);
    let execute_halt = asm.here();
    asm.op(Op::Execute);
    asm.op(Op::Halt);
    // : key ( -- c ) begin ?key not while yield repeat ;
    let key = asm.here();
    asm.op(Op::QKey);
    asm.op(Op::Not);
    let done = asm.fwd(Op::ZeroBranch);
    asm.op(Op::Yield);
    asm.branch_to(Op::Branch, key).unwrap();
    asm.patch(done).unwrap();
    asm.op(Op::Exit);
    Sys { execute_halt, key }
}

/// Builds the static application dictionary: threaded-code words assembled
/// after the kernel prelude, plus host extension functions reachable
/// through the (func) opcode.
pub struct AppBuilder {
    asm: Assembler,
    names: Vec<String>,
    entries: Vec<u16>,
    funcs: Vec<HostFunc>,
    sys: Sys,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AppBuilder {
    pub fn new() -> Self {
        let mut asm = Assembler::new();
        let sys = assemble_prelude(&mut asm);
        AppBuilder {
            asm,
            names: Vec::new(),
            entries: Vec::new(),
            funcs: Vec::new(),
            sys,
        }
    }

    /// Define a threaded-code word. The body closure must assemble a
    /// complete definition ending in exit. Returns the word's index in the
    /// static table.
    pub fn word(&mut self, name: &str, body: impl FnOnce(&mut Assembler)) -> u8 {
        assert!(self.names.len() < 128, "static dictionary full");
        let index = self.names.len() as u8;
        self.names.push(name.to_string());
        self.entries.push(self.asm.here());
        body(&mut self.asm);
        index
    }

    /// Register a host extension function as a one-word definition
    /// [(func) index env exit]. Returns the word's index.
    pub fn func(
        &mut self,
        name: &str,
        env: Cell,
        func: impl FnMut(&mut Task, Cell) -> Result<(), Fault> + 'static,
    ) -> u8 {
        let registry = self.funcs.len() as Cell;
        self.funcs.push(Box::new(func));
        self.word(name, |asm| {
            asm.op(Op::Func);
            asm.cell(registry);
            asm.cell(env);
            asm.op(Op::Exit);
        })
    }
}

/// The virtual machine: code image, data arena, dictionaries, and the
/// host-function registry. Tasks are external; any number of them may be
/// resumed against one VM.
pub struct Vm {
    pub(crate) memory: Memory,
    pub(crate) dict: Dict,
    pub(crate) compile: Compile,
    funcs: Vec<HostFunc>,
    sys: Sys,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// A VM with an empty static application dictionary.
    pub fn new() -> Self {
        Vm::with_app(AppBuilder::new())
    }

    pub fn with_app(app: AppBuilder) -> Self {
        let AppBuilder {
            asm,
            names,
            entries,
            funcs,
            sys,
        } = app;
        Vm {
            memory: Memory::new(asm.into_code()),
            dict: Dict::new(names.into_iter().zip(entries).collect()),
            compile: Compile::default(),
            funcs,
            sys,
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn dict(&self) -> &Dict {
        &self.dict
    }

    /// Look up a name; the flat token on a hit, -1 on a miss.
    pub fn lookup(&self, name: &str) -> Cell {
        self.dict
            .lookup(name, &self.memory)
            .map(|t| t.to_cell())
            .unwrap_or(-1)
    }

    /// Drop a dynamic word and everything defined after it, rewinding the
    /// data pointer.
    pub fn forget(&mut self, name: &str) -> bool {
        match self.dict.find_word(name, &self.memory) {
            Some(index) => {
                self.dict.forget(index, &mut self.memory);
                true
            }
            None => false,
        }
    }

    /// Execute a token with the given task: runs [execute][halt], so a
    /// normal completion reports Halt.
    pub fn execute(&mut self, token: Cell, task: &mut Task) -> Exit {
        if let Err(fault) = task.push(token) {
            return Exit::Fault(fault);
        }
        task.ip = self.sys.execute_halt;
        self.resume(task)
    }

    /// Execute threaded code at an address with the given task.
    pub fn execute_code(&mut self, addr: u16, task: &mut Task) -> Exit {
        task.call(addr);
        self.resume(task)
    }

    /// Run the task until it yields, halts, or trips. The task's ip and
    /// stacks always hold the state at the suspension point.
    pub fn resume(&mut self, task: &mut Task) -> Exit {
        match self.run(task) {
            Ok(exit) => exit,
            Err(fault) => Exit::Fault(fault),
        }
    }

    fn run(&mut self, task: &mut Task) -> Result<Exit, Fault> {
        let mut start = Instant::now();
        loop {
            if task.trace {
                self.print_trace(task, &mut start);
            }

            // Fetch. Negative bytes are threaded calls into the static
            // application table; everything else dispatches below.
            let ir = self.memory.byte_at(task.ip)? as i8;
            task.ip = task.ip.wrapping_add(1);
            if ir < 0 {
                let index = (-(ir as i16) - 1) as usize;
                match self.dict.app_entry(index) {
                    Some(addr) => {
                        self.threaded_call(task, addr)?;
                        continue;
                    }
                    None => return Ok(Exit::Illegal),
                }
            }

            let mut op = match Op::from_code(ir as u16) {
                Some(op) => op,
                None => return Ok(Exit::Illegal),
            };

            // The labelled loop stands in for the original's goto
            // DISPATCH: execute and the prefix opcodes re-enter it.
            'dispatch: loop {
                match op {
                    // Control structure and literals
                    Op::Exit => {
                        task.ip = task.rstack.pop()?;
                    }
                    Op::Lit => {
                        let x = self.operand_cell(task)?;
                        task.push(x)?;
                    }
                    Op::Clit => {
                        let x = self.operand_byte(task)? as Cell;
                        task.push(x)?;
                    }
                    Op::Slit => {
                        let addr = task.ip.wrapping_add(1);
                        task.push(addr as Cell)?;
                        self.do_branch(task)?;
                    }
                    Op::Var | Op::Const => {
                        let x = self.memory.cell_at(task.ip)?;
                        task.push(x)?;
                        task.ip = task.rstack.pop()?;
                    }
                    Op::Does => {
                        let slot = task.rstack.pop()?;
                        let x = self.memory.cell_at(slot)?;
                        task.push(x)?;
                    }
                    Op::Func => {
                        let index = self.operand_cell(task)? as u16 as usize;
                        let env = self.operand_cell(task)?;
                        match self.funcs.get_mut(index) {
                            Some(func) => func(task, env)?,
                            None => return Ok(Exit::Illegal),
                        }
                        task.ip = task.rstack.pop()?;
                    }
                    Op::Param => {
                        let n = self.operand_byte(task)? as u8 as usize;
                        let x = task.stack.from_top(n)?;
                        task.push(x)?;
                    }
                    Op::Branch => {
                        self.do_branch(task)?;
                    }
                    Op::ZeroBranch => {
                        let offset = self.operand_byte(task)?;
                        if task.pop()? == 0 {
                            task.ip = task.ip.wrapping_add(offset as i16 as u16);
                        }
                    }
                    Op::Do => {
                        let offset = self.operand_byte(task)?;
                        let index = task.pop()?;
                        let limit = task.pop()?;
                        if limit == index {
                            task.ip = task.ip.wrapping_add(offset as i16 as u16);
                        } else {
                            task.rstack.push(limit as u16)?;
                            task.rstack.push(index as u16)?;
                        }
                    }
                    Op::Loop => {
                        let offset = self.operand_byte(task)?;
                        let limit = task.rstack.from_top(1)? as Cell;
                        let index = (task.rstack.from_top(0)? as Cell).wrapping_add(1);
                        if index >= limit {
                            task.rstack.pop()?;
                            task.rstack.pop()?;
                        } else {
                            task.rstack.set_from_top(0, index as u16)?;
                            task.ip = task.ip.wrapping_add(offset as i16 as u16);
                        }
                    }
                    Op::PlusLoop => {
                        let offset = self.operand_byte(task)?;
                        let n = task.pop()?;
                        let limit = task.rstack.from_top(1)? as Cell;
                        let index = (task.rstack.from_top(0)? as Cell).wrapping_add(n);
                        let crossed = if n >= 0 { index >= limit } else { index < limit };
                        if crossed {
                            task.rstack.pop()?;
                            task.rstack.pop()?;
                        } else {
                            task.rstack.set_from_top(0, index as u16)?;
                            task.ip = task.ip.wrapping_add(offset as i16 as u16);
                        }
                    }
                    Op::Kernel => {
                        let n = self.operand_byte(task)? as u8;
                        match Op::from_code(128 + n as u16) {
                            Some(next) => {
                                op = next;
                                continue 'dispatch;
                            }
                            None => return Ok(Exit::Illegal),
                        }
                    }
                    Op::Call => {
                        let n = self.operand_byte(task)? as u8 as usize;
                        match self.dict.word_body(n) {
                            Some(addr) => self.threaded_call(task, addr)?,
                            None => return Ok(Exit::Illegal),
                        }
                    }
                    Op::ZeroExit => {
                        if task.pop()? == 0 {
                            task.ip = task.rstack.pop()?;
                        }
                    }
                    Op::Execute => {
                        let token = task.pop()?;
                        match Token::from_cell(token) {
                            Some(Token::Kernel(t)) => match Op::from_code(t as u16) {
                                Some(next) => {
                                    op = next;
                                    continue 'dispatch;
                                }
                                None => return Ok(Exit::Illegal),
                            },
                            Some(Token::App(i)) => match self.dict.app_entry(i as usize) {
                                Some(addr) => {
                                    task.rstack.push(task.ip)?;
                                    task.ip = addr;
                                }
                                None => return Ok(Exit::Illegal),
                            },
                            Some(Token::Word(i)) => match self.dict.word_body(i as usize) {
                                Some(addr) => {
                                    task.rstack.push(task.ip)?;
                                    task.ip = addr;
                                }
                                None => return Ok(Exit::Illegal),
                            },
                            None => return Ok(Exit::Illegal),
                        }
                    }
                    Op::Trace => {
                        task.trace = task.pop()? != 0;
                    }
                    Op::Yield => {
                        return Ok(Exit::Yield);
                    }
                    Op::Halt => {
                        // Sticky: back the ip onto the halt byte and reset
                        // the return stack to its floor.
                        task.ip = task.ip.wrapping_sub(1);
                        task.rstack.clear();
                        return Ok(Exit::Halt);
                    }
                    Op::I => {
                        let index = task.rstack.from_top(0)? as Cell;
                        task.push(index)?;
                    }
                    Op::J => {
                        let index = task.rstack.from_top(2)? as Cell;
                        task.push(index)?;
                    }
                    Op::Leave => {
                        let limit = task.rstack.from_top(1)?;
                        task.rstack.set_from_top(0, limit)?;
                    }

                    // Memory access
                    Op::CFetch => {
                        let addr = task.pop()? as u16;
                        let x = self.memory.byte_at(addr)? as i8 as Cell;
                        task.push(x)?;
                    }
                    Op::CStore => {
                        let addr = task.pop()? as u16;
                        let x = task.pop()?;
                        self.memory.set_byte(addr, x as u8)?;
                    }
                    Op::Fetch => {
                        let addr = task.pop()? as u16;
                        let x = self.cell_fetch(task, addr)?;
                        task.push(x)?;
                    }
                    Op::Store => {
                        let addr = task.pop()? as u16;
                        let x = task.pop()?;
                        self.cell_store(task, addr, x)?;
                    }
                    Op::PlusStore => {
                        let addr = task.pop()? as u16;
                        let n = task.pop()?;
                        let x = self.cell_fetch(task, addr)?.wrapping_add(n);
                        self.cell_store(task, addr, x)?;
                    }
                    Op::Dp => {
                        task.push(crate::memory::DP_ADDR as Cell)?;
                    }
                    Op::Here => {
                        let here = self.memory.here() as Cell;
                        task.push(here)?;
                    }
                    Op::Allot => {
                        let n = task.pop()?;
                        self.memory.allot(n)?;
                    }
                    Op::Comma => {
                        let x = task.pop()?;
                        self.memory.comma(x)?;
                    }
                    Op::CComma => {
                        let x = task.pop()?;
                        self.memory.c_comma(x as u8)?;
                    }
                    Op::Cells => {
                        let n = task.pop()?;
                        task.push(n.wrapping_mul(CELL))?;
                    }
                    Op::CellSize => {
                        task.push(CELL)?;
                    }

                    // Return stack
                    Op::ToR => {
                        let x = task.pop()?;
                        task.rstack.push(x as u16)?;
                    }
                    Op::RFrom => {
                        let x = task.rstack.pop()? as Cell;
                        task.push(x)?;
                    }
                    Op::RFetch => {
                        let x = task.rstack.from_top(0)? as Cell;
                        task.push(x)?;
                    }

                    // Parameter stack
                    Op::Sp | Op::Depth => {
                        let depth = task.stack.depth() as Cell;
                        task.push(depth)?;
                    }
                    Op::Drop => {
                        task.pop()?;
                    }
                    Op::Nip => {
                        let y = task.pop()?;
                        task.pop()?;
                        task.push(y)?;
                    }
                    Op::Empty => {
                        task.stack.clear();
                    }
                    Op::Dup => {
                        let x = task.stack.from_top(0)?;
                        task.push(x)?;
                    }
                    Op::QDup => {
                        let x = task.stack.from_top(0)?;
                        if x != 0 {
                            task.push(x)?;
                        }
                    }
                    Op::Over => {
                        let x = task.stack.from_top(1)?;
                        task.push(x)?;
                    }
                    Op::Tuck => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(y)?;
                        task.push(x)?;
                        task.push(y)?;
                    }
                    Op::Pick => {
                        let n = task.pop()?;
                        if n < 0 {
                            return Err(Fault::OutOfRange);
                        }
                        let x = task.stack.from_top(n as usize)?;
                        task.push(x)?;
                    }
                    Op::Swap => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(y)?;
                        task.push(x)?;
                    }
                    Op::Rot => {
                        let z = task.pop()?;
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(y)?;
                        task.push(z)?;
                        task.push(x)?;
                    }
                    Op::MinusRot => {
                        let z = task.pop()?;
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(z)?;
                        task.push(x)?;
                        task.push(y)?;
                    }
                    Op::Roll => {
                        let n = task.pop()?;
                        if n < 0 {
                            return Err(Fault::OutOfRange);
                        }
                        task.stack.roll(n as usize)?;
                    }
                    Op::TwoSwap => {
                        let y2 = task.pop()?;
                        let y1 = task.pop()?;
                        let x2 = task.pop()?;
                        let x1 = task.pop()?;
                        task.push(y1)?;
                        task.push(y2)?;
                        task.push(x1)?;
                        task.push(x2)?;
                    }
                    Op::TwoDup => {
                        let y = task.stack.from_top(0)?;
                        let x = task.stack.from_top(1)?;
                        task.push(x)?;
                        task.push(y)?;
                    }
                    Op::TwoOver => {
                        let x1 = task.stack.from_top(3)?;
                        task.push(x1)?;
                        let x2 = task.stack.from_top(3)?;
                        task.push(x2)?;
                    }
                    Op::TwoDrop => {
                        task.pop()?;
                        task.pop()?;
                    }

                    // Constants
                    Op::MinusTwo => task.push(-2)?,
                    Op::MinusOne | Op::True => task.push(-1)?,
                    Op::Zero | Op::False => task.push(0)?,
                    Op::One => task.push(1)?,
                    Op::Two => task.push(2)?,

                    // Bitwise logic
                    Op::Bool => {
                        let x = task.pop()?;
                        task.push(flag(x != 0))?;
                    }
                    Op::Not => {
                        let x = task.pop()?;
                        task.push(flag(x == 0))?;
                    }
                    Op::Invert => {
                        let x = task.pop()?;
                        task.push(!x)?;
                    }
                    Op::And => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x & y)?;
                    }
                    Op::Or => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x | y)?;
                    }
                    Op::Xor => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x ^ y)?;
                    }
                    Op::Lshift => {
                        let n = task.pop()?;
                        let x = task.pop()? as u16;
                        let shifted = x.checked_shl(n as u16 as u32).unwrap_or(0);
                        task.push(shifted as Cell)?;
                    }
                    Op::Rshift => {
                        let n = task.pop()?;
                        let x = task.pop()? as u16;
                        let shifted = x.checked_shr(n as u16 as u32).unwrap_or(0);
                        task.push(shifted as Cell)?;
                    }

                    // Arithmetic. Division rounds toward zero; the
                    // remainder takes the dividend's sign.
                    Op::Negate => {
                        let x = task.pop()?;
                        task.push(x.wrapping_neg())?;
                    }
                    Op::OnePlus => {
                        let x = task.pop()?;
                        task.push(x.wrapping_add(1))?;
                    }
                    Op::OneMinus => {
                        let x = task.pop()?;
                        task.push(x.wrapping_sub(1))?;
                    }
                    Op::TwoPlus => {
                        let x = task.pop()?;
                        task.push(x.wrapping_add(2))?;
                    }
                    Op::TwoMinus => {
                        let x = task.pop()?;
                        task.push(x.wrapping_sub(2))?;
                    }
                    Op::TwoStar => {
                        let x = task.pop()?;
                        task.push(x.wrapping_shl(1))?;
                    }
                    Op::TwoSlash => {
                        let x = task.pop()?;
                        task.push(x >> 1)?;
                    }
                    Op::Plus => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x.wrapping_add(y))?;
                    }
                    Op::Minus => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x.wrapping_sub(y))?;
                    }
                    Op::Star => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x.wrapping_mul(y))?;
                    }
                    Op::StarSlash => {
                        let z = task.pop()?;
                        let y = task.pop()?;
                        let x = task.pop()?;
                        if z == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        let product = x as DoubleCell * y as DoubleCell;
                        task.push((product / z as DoubleCell) as Cell)?;
                    }
                    Op::Slash => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        if y == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        task.push(x.wrapping_div(y))?;
                    }
                    Op::Mod => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        if y == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        task.push(x.wrapping_rem(y))?;
                    }
                    Op::SlashMod => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        if y == 0 {
                            return Err(Fault::DivisionByZero);
                        }
                        task.push(x.wrapping_div(y))?;
                        task.push(x.wrapping_rem(y))?;
                    }
                    Op::Abs => {
                        let x = task.pop()?;
                        task.push(x.wrapping_abs())?;
                    }
                    Op::Min => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x.min(y))?;
                    }
                    Op::Max => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(x.max(y))?;
                    }
                    Op::Within => {
                        let hi = task.pop()?;
                        let lo = task.pop()?;
                        let x = task.pop()?;
                        let inside = if lo <= hi {
                            lo <= x && x < hi
                        } else {
                            x >= lo || x < hi
                        };
                        task.push(flag(inside))?;
                    }

                    // Relational
                    Op::ZeroNotEquals => {
                        let x = task.pop()?;
                        task.push(flag(x != 0))?;
                    }
                    Op::ZeroLess => {
                        let x = task.pop()?;
                        task.push(flag(x < 0))?;
                    }
                    Op::ZeroEquals => {
                        let x = task.pop()?;
                        task.push(flag(x == 0))?;
                    }
                    Op::ZeroGreater => {
                        let x = task.pop()?;
                        task.push(flag(x > 0))?;
                    }
                    Op::NotEquals => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(flag(x != y))?;
                    }
                    Op::Less => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(flag(x < y))?;
                    }
                    Op::Equals => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(flag(x == y))?;
                    }
                    Op::Greater => {
                        let y = task.pop()?;
                        let x = task.pop()?;
                        task.push(flag(x > y))?;
                    }
                    Op::ULess => {
                        let y = task.pop()? as u16;
                        let x = task.pop()? as u16;
                        task.push(flag(x < y))?;
                    }

                    // Dictionary
                    Op::Lookup => {
                        let addr = task.pop()? as u16;
                        let name = self.memory.str_at(addr)?;
                        let token = self.lookup(&name);
                        task.push(token)?;
                    }
                    Op::ToBody => {
                        let token = task.pop()?;
                        let body = match Token::from_cell(token) {
                            Some(Token::App(i)) => self.dict.app_entry(i as usize),
                            Some(Token::Word(i)) => self.dict.word_body(i as usize),
                            _ => None,
                        };
                        match body {
                            Some(addr) => {
                                let x = self.memory.cell_at(addr.wrapping_add(1))?;
                                task.push(x)?;
                            }
                            None => return Ok(Exit::Illegal),
                        }
                    }
                    Op::Words => {
                        self.words(task);
                    }
                    Op::DotName => {
                        let token = task.pop()?;
                        let name = Token::from_cell(token)
                            .and_then(|t| self.dict.token_name(t, &self.memory));
                        match name {
                            Some(name) => {
                                let len = name.len() as Cell;
                                self.print(task, &name);
                                task.push(len)?;
                            }
                            None => task.push(0)?,
                        }
                    }

                    // Numeric conversion and basic I/O
                    Op::Base => {
                        task.push(BASE_ADDR as Cell)?;
                    }
                    Op::Hex => {
                        task.base = 16;
                    }
                    Op::Decimal => {
                        task.base = 10;
                    }
                    Op::QKey => {
                        let byte = {
                            let mut ios = task.ios.borrow_mut();
                            if ios.available() {
                                ios.read()
                            } else {
                                None
                            }
                        };
                        match byte {
                            Some(c) => {
                                task.push(c as Cell)?;
                                task.push(-1)?;
                            }
                            None => task.push(0)?,
                        }
                    }
                    Op::Key => {
                        task.rstack.push(task.ip)?;
                        task.ip = self.sys.key;
                    }
                    Op::Emit => {
                        let c = task.pop()? as u16 as u8;
                        self.print(task, &(c as char).to_string());
                    }
                    Op::Cr => {
                        task.ios.borrow_mut().println();
                    }
                    Op::Space => {
                        self.print(task, " ");
                    }
                    Op::Spaces => {
                        let n = task.pop()?;
                        for _ in 0..n.max(0) {
                            self.print(task, " ");
                        }
                    }
                    Op::Type => {
                        let addr = task.pop()? as u16;
                        let text = self.memory.str_at(addr)?;
                        self.print(task, &text);
                    }
                    Op::DotQuote => {
                        let mut text = Vec::new();
                        loop {
                            let b = self.memory.byte_at(task.ip)?;
                            task.ip = task.ip.wrapping_add(1);
                            if b == 0 {
                                break;
                            }
                            text.push(b);
                        }
                        let text = String::from_utf8_lossy(&text).into_owned();
                        self.print(task, &text);
                    }
                    Op::UDot => {
                        let x = task.pop()?;
                        let base = task.base as u32;
                        task.ios.borrow_mut().print_number(x, base);
                    }
                    Op::Dot => {
                        let x = task.pop()?;
                        self.dot(task, x);
                    }
                    Op::DotS => {
                        self.dot_s(task);
                    }
                    Op::Question => {
                        let addr = task.pop()? as u16;
                        let x = self.cell_fetch(task, addr)?;
                        self.dot(task, x);
                    }
                    Op::Nop => {}
                }
                break 'dispatch;
            }
        }
    }

    /// Threaded call with tail-call elision: when the byte after the call
    /// is exit, the return-address push is skipped and the call becomes a
    /// jump. The lookahead assumes an instruction boundary, which compiled
    /// code guarantees.
    fn threaded_call(&self, task: &mut Task, addr: u16) -> Result<(), Fault> {
        if self.memory.byte_at(task.ip) != Ok(Op::Exit.code()) {
            task.rstack.push(task.ip)?;
        }
        task.ip = addr;
        Ok(())
    }

    fn operand_byte(&self, task: &mut Task) -> Result<i8, Fault> {
        let b = self.memory.byte_at(task.ip)? as i8;
        task.ip = task.ip.wrapping_add(1);
        Ok(b)
    }

    fn operand_cell(&self, task: &mut Task) -> Result<Cell, Fault> {
        let x = self.memory.cell_at(task.ip)?;
        task.ip = task.ip.wrapping_add(CELL as u16);
        Ok(x)
    }

    fn do_branch(&self, task: &mut Task) -> Result<(), Fault> {
        let offset = self.operand_byte(task)?;
        task.ip = task.ip.wrapping_add(offset as i16 as u16);
        Ok(())
    }

    /// Cell fetch routed on the pointer value; the base address reaches
    /// the resuming task's field.
    pub(crate) fn cell_fetch(&self, task: &Task, addr: u16) -> Result<Cell, Fault> {
        if addr == BASE_ADDR {
            Ok(task.base)
        } else {
            self.memory.cell_at(addr)
        }
    }

    pub(crate) fn cell_store(&mut self, task: &mut Task, addr: u16, x: Cell) -> Result<(), Fault> {
        if addr == BASE_ADDR {
            task.base = x;
            Ok(())
        } else {
            self.memory.set_cell(addr, x)
        }
    }

    fn print(&self, task: &Task, text: &str) {
        task.ios.borrow_mut().print(text);
    }

    /// Signed print with the trailing space of the . word.
    pub(crate) fn dot(&self, task: &Task, x: Cell) {
        let base = task.base as u32;
        let mut ios = task.ios.borrow_mut();
        if base == 10 && x < 0 {
            ios.print("-");
            ios.print_number(x.wrapping_neg(), 10);
        } else {
            ios.print_number(x, base);
        }
        ios.print(" ");
    }

    fn dot_s(&self, task: &Task) {
        {
            let mut ios = task.ios.borrow_mut();
            ios.print("[");
            ios.print_number(task.stack.depth() as Cell, task.base as u32);
            ios.print("]: ");
        }
        let values: Vec<Cell> = task.stack.iter().copied().collect();
        for x in values {
            self.dot(task, x);
        }
        task.ios.borrow_mut().println();
    }

    fn words(&self, task: &Task) {
        let names = self.dict.all_names(&self.memory);
        let mut ios = task.ios.borrow_mut();
        for (i, name) in names.iter().enumerate() {
            ios.print(name);
            if (i + 1) % 5 == 0 {
                ios.println();
            } else {
                for _ in name.len()..16 {
                    ios.print(" ");
                }
            }
        }
        ios.println();
    }

    /// Resolve the name of the token at ip, peeking through the prefix
    /// encodings, for the trace line.
    fn token_name_at(&self, ip: u16) -> String {
        let byte = match self.memory.byte_at(ip) {
            Ok(b) => b,
            Err(_) => return "?".to_string(),
        };
        let next = self.memory.byte_at(ip.wrapping_add(1)).ok();
        let token = if (byte as i8) < 0 {
            Some(Token::App((-(byte as i8 as i16) - 1) as u8))
        } else if byte == Op::Kernel.code() {
            next.filter(|n| *n < 128).map(|n| Token::Kernel(128 + n))
        } else if byte == Op::Call.code() {
            next.map(Token::Word)
        } else {
            Some(Token::Kernel(byte))
        };
        token
            .and_then(|t| self.dict.token_name(t, &self.memory))
            .unwrap_or_else(|| "?".to_string())
    }

    /// One trace line per dispatch: task identity, elapsed microseconds
    /// since the previous dispatch, instruction pointer, return-stack
    /// depth as indentation, token name, bracketed parameter stack. The
    /// format is part of the interface; tools parse it.
    fn print_trace(&self, task: &Task, start: &mut Instant) {
        let elapsed = start.elapsed().as_micros();
        let mut line = format!("{}:{}:{}:", task.id, elapsed, task.ip);
        for _ in 0..task.rstack.depth() {
            line.push_str("  ");
        }
        line.push_str(&self.token_name_at(task.ip));
        line.push_str(" [");
        let dump: Vec<String> = task.stack.iter().map(|x| x.to_string()).collect();
        line.push_str(&dump.join(" "));
        line.push(']');
        let mut ios = task.ios.borrow_mut();
        ios.print(&line);
        ios.println();
        ios.flush();
        *start = Instant::now();
    }
}

fn flag(b: bool) -> Cell {
    if b {
        -1
    } else {
        0
    }
}
