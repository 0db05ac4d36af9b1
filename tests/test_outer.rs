use ember::compiler::CompileError;
use ember::io::BufferIos;
use ember::memory::Cell;
use ember::outer::InterpretError;
use ember::task::Task;
use ember::vm::Vm;

/// Feed a program through the outer interpreter and collect its output.
/// Programs are fed without a trailing newline, like a stream that ends
/// mid-line.
fn run_program(source: &str) -> String {
    let (output, result) = try_program(source);
    result.unwrap();
    output
}

fn try_program(source: &str) -> (String, Result<(), InterpretError>) {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    ios.borrow_mut().feed(source);
    let mut task = Task::new(ios.clone());
    let result = loop {
        match vm.interpret(&mut task) {
            Ok(true) => {}
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };
    let output = ios.borrow().output().to_string();
    (output, result)
}

#[test]
fn test_arithmetic_program() {
    assert_eq!(run_program("5 3 + ."), "8 ");
}

#[test]
fn test_colon_definition() {
    assert_eq!(run_program(": sq dup * ; 7 sq ."), "49 ");
}

#[test]
fn test_interactive_do_loop() {
    assert_eq!(run_program("10 0 do i . loop cr"), "0 1 2 3 4 5 6 7 8 9 \n");
}

#[test]
fn test_recursive_factorial() {
    assert_eq!(
        run_program(": fact dup 1 > if dup 1 - recurse * then ; 5 fact ."),
        "120 "
    );
}

#[test]
fn test_variable_roundtrip() {
    assert_eq!(run_program("variable x 42 x ! x @ ."), "42 ");
}

#[test]
fn test_unknown_word_reports_and_errors() {
    let (output, result) = try_program("xyzzy");
    assert!(matches!(result, Err(InterpretError::Unknown(w)) if w == "xyzzy"));
    assert_eq!(output, "xyzzy ??\n");
}

#[test]
fn test_number_parsing_uses_base() {
    assert_eq!(run_program("hex ff decimal ."), "255 ");
    assert_eq!(run_program("255 hex . decimal"), "ff ");
    // Out-of-range literals wrap to a cell.
    assert_eq!(run_program("65535 ."), "-1 ");
    assert_eq!(run_program("-42 ."), "-42 ");
}

#[test]
fn test_newline_triggers_stack_report() {
    assert_eq!(run_program("1 2\n"), "[2]: 1 2 \n");
}

#[test]
fn test_no_stack_report_inside_definition() {
    assert_eq!(run_program(": sq\ndup * ;\n7 sq ."), "[0]: \n49 ");
}

#[test]
fn test_stack_report_with_empty_stack() {
    assert_eq!(run_program(".s"), "[0]: \n");
}

#[test]
fn test_comments_are_skipped() {
    assert_eq!(run_program("( a comment ) 5 ."), "5 ");
    assert_eq!(run_program("\\ to end of line\n5 ."), "5 ");
}

#[test]
fn test_constant_definition() {
    assert_eq!(run_program("5 constant five five five + ."), "10 ");
}

#[test]
fn test_create_and_allot() {
    assert_eq!(run_program("create buf 2 cells allot 7 buf ! buf @ ."), "7 ");
}

#[test]
fn test_tick_pushes_token() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    ios.borrow_mut().feed("' dup");
    let mut task = Task::new(ios.clone());
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(task.tos(), Some(vm.lookup("dup")));
}

#[test]
fn test_tick_with_execute() {
    assert_eq!(run_program("3 4 ' + execute ."), "7 ");
}

#[test]
fn test_dot_quote_interactive_and_compiled() {
    assert_eq!(run_program(".\" hello\""), "hello");
    assert_eq!(run_program(": greet .\" yo\" ; greet"), "yo");
}

#[test]
fn test_s_quote_compiled() {
    assert_eq!(run_program(": greet s\" hi\" type ; greet"), "hi");
}

#[test]
fn test_user_definition_shadows_kernel() {
    assert_eq!(run_program(": dup 42 ; dup ."), "42 ");
}

#[test]
fn test_begin_until_interactive() {
    assert_eq!(run_program("5 begin 1 - dup 0 = until ."), "0 ");
}

#[test]
fn test_begin_while_repeat() {
    assert_eq!(
        run_program(": count begin dup 0 > while dup . 1 - repeat drop ; 3 count"),
        "3 2 1 "
    );
}

#[test]
fn test_if_else_then() {
    assert_eq!(run_program(": sign 0 < if -1 else 1 then . ; 5 sign -5 sign"), "1 -1 ");
}

#[test]
fn test_leave_exits_loop_early() {
    assert_eq!(
        run_program(": t 10 0 do i . i 4 = if leave then loop ; t"),
        "0 1 2 3 4 "
    );
}

#[test]
fn test_nested_loops_and_j() {
    assert_eq!(
        run_program(": t 3 0 do 30 10 do j . 10 +loop loop ; t"),
        "0 0 1 1 2 2 "
    );
}

#[test]
fn test_forget_truncates_dictionary() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    ios.borrow_mut().feed(": a 1 ; : b 2 ;");
    let mut task = Task::new(ios.clone());
    while vm.interpret(&mut task).unwrap() {}
    let before = vm.memory().here();
    assert!(vm.lookup("a") >= 0);
    assert!(vm.lookup("b") >= 0);

    ios.borrow_mut().feed(" forget a");
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(vm.lookup("a"), -1);
    assert_eq!(vm.lookup("b"), -1);
    assert!(vm.memory().here() < before);

    // The reclaimed arena is reusable.
    ios.borrow_mut().feed(" : c 3 ; c .");
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(ios.borrow().output(), "3 ");
}

#[test]
fn test_words_lists_all_dictionaries() {
    let output = run_program(": mine 1 ; words");
    assert!(output.contains("mine"));
    assert!(output.contains("dup"));
    assert!(output.contains("exit"));
}

#[test]
fn test_dot_name_prints_token_name() {
    assert_eq!(run_program("' swap .name ."), "swap4 ");
}

#[test]
fn test_lookup_word_finds_stored_name() {
    // Write a name into the arena by hand, then look it up.
    assert_eq!(run_program("here 100 c, 117 c, 112 c, 0 c, lookup ' dup = ."), "-1 ");
}

#[test]
fn test_unknown_word_while_compiling() {
    let (_, result) = try_program(": t qqq ;");
    assert!(matches!(
        result,
        Err(InterpretError::Compile(CompileError::Unknown(w))) if w == "qqq"
    ));
}

#[test]
fn test_abort_compile_recovers() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    ios.borrow_mut().feed(": t qqq ;");
    let mut task = Task::new(ios.clone());
    let result = loop {
        match vm.interpret(&mut task) {
            Ok(true) => {}
            other => break other,
        }
    };
    assert!(result.is_err());
    assert!(vm.is_compiling());
    vm.abort_compile();
    assert!(!vm.is_compiling());
}

#[test]
fn test_control_mismatch_is_reported() {
    let (_, result) = try_program(": t then ;");
    assert!(matches!(
        result,
        Err(InterpretError::Compile(CompileError::ControlMismatch(_)))
    ));
}

#[test]
fn test_branch_out_of_range_is_a_compile_error() {
    // Each "1 +" compiles two bytes; 70 of them overflow the 8-bit
    // forward branch of if.
    let mut source = String::from(": big 0 if ");
    for _ in 0..70 {
        source.push_str("1 + ");
    }
    source.push_str("then ;");
    let (_, result) = try_program(&source);
    assert!(matches!(
        result,
        Err(InterpretError::Compile(CompileError::BranchOutOfRange))
    ));
}

#[test]
fn test_deep_tail_recursion_through_compiler() {
    // recurse in tail position compiles to an elided call, so the return
    // stack stays flat for a thousand levels.
    assert_eq!(run_program(": down ?dup if 1 - recurse then ; 1000 down depth ."), "0 ");
}

#[test]
fn test_stack_effects_sum_over_program() {
    // depth after a mixed sequence matches the sum of the catalogue's
    // stack effects.
    assert_eq!(run_program("1 2 3 over + swap drop depth ."), "2 ");
}

#[test]
fn test_empty_input_reports_exhaustion() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    let mut task = Task::new(ios);
    assert!(matches!(vm.interpret(&mut task), Ok(false)));
}

#[test]
fn test_question_prints_variable() {
    assert_eq!(run_program("variable x 9 x ! x ?"), "9 ");
}

#[test]
fn test_spaces_and_emit() {
    assert_eq!(run_program("65 emit 2 spaces 66 emit"), "A  B");
}

#[test]
fn test_u_dot_prints_unsigned() {
    assert_eq!(run_program("-1 u."), "65535");
}

fn stack_of(task: &Task) -> Vec<Cell> {
    task.stack.iter().copied().collect()
}

#[test]
fn test_number_push_leaves_stack() {
    let mut vm = Vm::new();
    let ios = BufferIos::shared();
    ios.borrow_mut().feed("12 34");
    let mut task = Task::new(ios);
    while vm.interpret(&mut task).unwrap() {}
    assert_eq!(stack_of(&task), vec![12, 34]);
}
