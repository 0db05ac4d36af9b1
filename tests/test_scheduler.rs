use ember::host::{install_pins, install_timing, Clock, SimPins};
use ember::io::BufferIos;
use ember::memory::Cell;
use ember::task::Task;
use ember::vm::{AppBuilder, Exit, Vm};
use std::cell::Cell as HostCell;
use std::rc::Rc;

struct FakeClock {
    ticks: Rc<HostCell<Cell>>,
}

impl Clock for FakeClock {
    fn millis(&mut self) -> Cell {
        self.ticks.get()
    }

    fn micros(&mut self) -> Cell {
        self.ticks.get()
    }
}

#[test]
fn test_two_tasks_round_robin() {
    let mut vm = Vm::new();

    // Compile the shared word through task a's stream; the dictionary is
    // process-wide.
    let ios_a = BufferIos::shared();
    let ios_b = BufferIos::shared();
    let mut a = Task::new(ios_a.clone());
    let mut b = Task::new(ios_b.clone());
    a.id = 1;
    b.id = 2;
    ios_a.borrow_mut().feed(": loop10 10 0 do yield loop ;");
    while vm.interpret(&mut a).unwrap() {}

    let token = vm.lookup("loop10");
    assert!(token >= 0);

    // Each task yields once per iteration, ten times, then halts.
    assert_eq!(vm.execute(token, &mut a), Exit::Yield);
    assert_eq!(vm.execute(token, &mut b), Exit::Yield);
    for _ in 0..9 {
        assert_eq!(vm.resume(&mut a), Exit::Yield);
        assert_eq!(vm.resume(&mut b), Exit::Yield);
    }
    assert_eq!(vm.resume(&mut a), Exit::Halt);
    assert_eq!(vm.resume(&mut b), Exit::Halt);

    // Halts are sticky.
    assert_eq!(vm.resume(&mut a), Exit::Halt);
    assert_eq!(vm.resume(&mut b), Exit::Halt);
    assert!(a.stack.is_empty());
    assert!(b.stack.is_empty());
}

#[test]
fn test_yielded_task_state_is_preserved() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    let mut task = Task::new(ios.clone());
    ios.borrow_mut().feed(": gen 3 0 do i yield loop ;");
    while vm.interpret(&mut task).unwrap() {}

    let token = vm.lookup("gen");
    assert_eq!(vm.execute(token, &mut task), Exit::Yield);
    let ip = task.ip;
    let rdepth = task.rstack.depth();
    assert_eq!(task.tos(), Some(0));

    // Resuming without touching the task picks up exactly where it left.
    assert_eq!(vm.resume(&mut task), Exit::Yield);
    assert_eq!(task.ip, ip);
    assert_eq!(task.rstack.depth(), rdepth);
    assert_eq!(task.tos(), Some(1));
}

#[test]
fn test_key_blocks_cooperatively() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    let mut task = Task::new(ios.clone());

    // No input: key yields instead of blocking the host.
    let token = vm.lookup("key");
    assert_eq!(vm.execute(token, &mut task), Exit::Yield);
    assert_eq!(vm.resume(&mut task), Exit::Yield);

    // Input arrives: the yield loop completes with the byte on the stack.
    ios.borrow_mut().feed("A");
    assert_eq!(vm.resume(&mut task), Exit::Halt);
    assert_eq!(task.tos(), Some(65));
}

#[test]
fn test_qkey_is_non_blocking() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    let mut task = Task::new(ios.clone());

    let token = vm.lookup("?key");
    assert_eq!(vm.execute(token, &mut task), Exit::Halt);
    assert_eq!(task.tos(), Some(0));
    task.pop().unwrap();

    ios.borrow_mut().feed("Z");
    assert_eq!(vm.execute(token, &mut task), Exit::Halt);
    let flag = task.pop().unwrap();
    let byte = task.pop().unwrap();
    assert_eq!(flag, -1);
    assert_eq!(byte, b'Z' as Cell);
}

#[test]
fn test_delay_yields_until_elapsed() {
    let ticks = Rc::new(HostCell::new(0));
    let mut app = AppBuilder::new();
    install_timing(
        &mut app,
        FakeClock {
            ticks: ticks.clone(),
        },
    );
    let mut vm = Vm::with_app(app);
    let ios = BufferIos::shared();
    let mut task = Task::new(ios);

    task.push(5).unwrap();
    let token = vm.lookup("delay");
    assert_eq!(vm.execute(token, &mut task), Exit::Yield);
    ticks.set(3);
    assert_eq!(vm.resume(&mut task), Exit::Yield);
    ticks.set(5);
    assert_eq!(vm.resume(&mut task), Exit::Halt);
    assert!(task.stack.is_empty());
}

#[test]
fn test_millis_reads_clock() {
    let ticks = Rc::new(HostCell::new(123));
    let mut app = AppBuilder::new();
    install_timing(&mut app, FakeClock { ticks });
    let mut vm = Vm::with_app(app);
    let ios = BufferIos::shared();
    let mut task = Task::new(ios);

    let token = vm.lookup("millis");
    assert_eq!(vm.execute(token, &mut task), Exit::Halt);
    assert_eq!(task.tos(), Some(123));
}

#[test]
fn test_pin_words() {
    let mut app = AppBuilder::new();
    install_pins(&mut app, SimPins::new());
    let mut vm = Vm::with_app(app);
    let ios = BufferIos::shared();
    ios.borrow_mut()
        .feed("1 13 digitalwrite 13 digitalread . 13 digitaltoggle 13 digitalread .");
    let mut task = Task::new(ios.clone());
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(ios.borrow().output(), "1 0 ");
}

#[test]
fn test_analog_pin_words() {
    let mut app = AppBuilder::new();
    install_pins(&mut app, SimPins::new());
    let mut vm = Vm::with_app(app);
    let ios = BufferIos::shared();
    ios.borrow_mut().feed("200 3 analogwrite 3 analogread .");
    let mut task = Task::new(ios.clone());
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(ios.borrow().output(), "200 ");
}

#[test]
fn test_tasks_own_their_stacks() {
    let mut vm = Vm::new();
    let ios_a = BufferIos::shared();
    let ios_b = BufferIos::shared();
    let mut a = Task::new(ios_a.clone());
    let mut b = Task::new(ios_b.clone());

    ios_a.borrow_mut().feed("1 2 3");
    while vm.interpret(&mut a).unwrap() {}
    ios_b.borrow_mut().feed("9");
    while vm.interpret(&mut b).unwrap() {}

    let sa: Vec<Cell> = a.stack.iter().copied().collect();
    let sb: Vec<Cell> = b.stack.iter().copied().collect();
    assert_eq!(sa, vec![1, 2, 3]);
    assert_eq!(sb, vec![9]);
}

#[test]
fn test_tasks_share_the_dictionary() {
    let mut vm = Vm::new();
    let ios_a = BufferIos::shared();
    let ios_b = BufferIos::shared();
    let mut a = Task::new(ios_a.clone());
    let mut b = Task::new(ios_b.clone());

    ios_a.borrow_mut().feed(": double 2 * ;");
    while vm.interpret(&mut a).unwrap() {}
    ios_b.borrow_mut().feed("21 double .");
    while vm.interpret(&mut b).unwrap() {}
    assert_eq!(ios_b.borrow().output(), "42 ");
}

#[test]
fn test_per_task_base() {
    let mut vm = Vm::new();
    let ios_a = BufferIos::shared();
    let ios_b = BufferIos::shared();
    let mut a = Task::new(ios_a.clone());
    let mut b = Task::new(ios_b.clone());

    ios_a.borrow_mut().feed("hex 255");
    let result = loop {
        match vm.interpret(&mut a) {
            Ok(true) => {}
            other => break other,
        }
    };
    result.unwrap();
    ios_b.borrow_mut().feed("255 .");
    while vm.interpret(&mut b).unwrap() {}

    // Task a parsed 255 as hex, task b still speaks decimal.
    assert_eq!(a.tos(), Some(0x255));
    assert_eq!(ios_b.borrow().output(), "255 ");
}
