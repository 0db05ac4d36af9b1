// host.rs - Host extension shim: clocks and pins behind narrow traits

use crate::memory::Cell;
use crate::opcode::{Op, Token};
use crate::vm::AppBuilder;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

/// Time source for the timing words. Values wrap at the cell width, as on
/// the 16-bit reference target.
pub trait Clock {
    fn millis(&mut self) -> Cell;
    fn micros(&mut self) -> Cell;
}

/// Wall-clock time since construction.
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&mut self) -> Cell {
        self.epoch.elapsed().as_millis() as u16 as Cell
    }

    fn micros(&mut self) -> Cell {
        self.epoch.elapsed().as_micros() as u16 as Cell
    }
}

/// Digital and analog pin access for the pin words.
pub trait Pins {
    fn mode(&mut self, pin: Cell, mode: Cell);
    fn digital_read(&mut self, pin: Cell) -> Cell;
    fn digital_write(&mut self, pin: Cell, state: Cell);
    fn analog_read(&mut self, pin: Cell) -> Cell;
    fn analog_write(&mut self, pin: Cell, duty: Cell);
}

/// Pin board backed by plain arrays, for tests and hosts without hardware.
#[derive(Default)]
pub struct SimPins {
    pub modes: [Cell; 32],
    pub digital: [Cell; 32],
    pub analog: [Cell; 16],
}

impl SimPins {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pins for SimPins {
    fn mode(&mut self, pin: Cell, mode: Cell) {
        self.modes[pin as usize & 31] = mode;
    }

    fn digital_read(&mut self, pin: Cell) -> Cell {
        self.digital[pin as usize & 31]
    }

    fn digital_write(&mut self, pin: Cell, state: Cell) {
        self.digital[pin as usize & 31] = if state != 0 { 1 } else { 0 };
    }

    fn analog_read(&mut self, pin: Cell) -> Cell {
        self.analog[pin as usize & 15]
    }

    fn analog_write(&mut self, pin: Cell, duty: Cell) {
        self.analog[pin as usize & 15] = duty;
    }
}

/// Register millis, micros and delay. delay is threaded code around a
/// yield, so it suspends cooperatively instead of blocking the host:
/// : delay ( ms -- ) millis >r begin millis r@ - over u< while yield repeat r> 2drop ;
pub fn install_timing(app: &mut AppBuilder, clock: impl Clock + 'static) {
    let clock = Rc::new(RefCell::new(clock));
    let handle = clock.clone();
    let millis = app.func("millis", 0, move |task, _| {
        task.push(handle.borrow_mut().millis())
    });
    let handle = clock;
    app.func("micros", 0, move |task, _| {
        task.push(handle.borrow_mut().micros())
    });
    app.word("delay", |asm| {
        asm.call(Token::App(millis));
        asm.op(Op::ToR);
        let head = asm.here();
        asm.call(Token::App(millis));
        asm.op(Op::RFetch);
        asm.op(Op::Minus);
        asm.op(Op::Over);
        asm.op(Op::ULess);
        let done = asm.fwd(Op::ZeroBranch);
        asm.op(Op::Yield);
        asm.branch_to(Op::Branch, head).unwrap();
        asm.patch(done).unwrap();
        asm.op(Op::RFrom);
        asm.op(Op::TwoDrop);
        asm.op(Op::Exit);
    });
}

/// Register the digital and analog pin words.
pub fn install_pins(app: &mut AppBuilder, pins: impl Pins + 'static) {
    let pins = Rc::new(RefCell::new(pins));

    let handle = pins.clone();
    app.func("pinmode", 0, move |task, _| {
        let pin = task.pop()?;
        let mode = task.pop()?;
        handle.borrow_mut().mode(pin, mode);
        Ok(())
    });

    let handle = pins.clone();
    app.func("digitalread", 0, move |task, _| {
        let pin = task.pop()?;
        let state = handle.borrow_mut().digital_read(pin);
        task.push(state)
    });

    let handle = pins.clone();
    app.func("digitalwrite", 0, move |task, _| {
        let pin = task.pop()?;
        let state = task.pop()?;
        handle.borrow_mut().digital_write(pin, state);
        Ok(())
    });

    let handle = pins.clone();
    app.func("digitaltoggle", 0, move |task, _| {
        let pin = task.pop()?;
        let mut pins = handle.borrow_mut();
        let state = pins.digital_read(pin);
        pins.digital_write(pin, if state != 0 { 0 } else { 1 });
        Ok(())
    });

    let handle = pins.clone();
    app.func("analogread", 0, move |task, _| {
        let pin = task.pop()?;
        let sample = handle.borrow_mut().analog_read(pin & 0xf);
        task.push(sample)
    });

    let handle = pins;
    app.func("analogwrite", 0, move |task, _| {
        let pin = task.pop()?;
        let duty = task.pop()?;
        handle.borrow_mut().analog_write(pin, duty);
        Ok(())
    });
}
