use std::process::Command;

use crate::prelude::*;

use super::run;

#[test]
fn unreferenced_function_is_dead_stripped() {
    let ctx = ctx();

    let obj = ctx.nasm(
        "main",
        "
        global _start
        section .text
        _start:
            mov rax, 60
            mov rdi, 0
            syscall
        unused:
            ret
    ",
    );

    let out = elven_wald!(ctx; "--gc-sections", obj);
    run(Command::new(out));
}

#[test]
fn cross_file_data_symbol_reference_resolves() {
    let ctx = ctx();

    let start = ctx.nasm(
        "start",
        "
        global _start
        extern counter
        section .text
        _start:
            mov rax, [counter]
            mov rax, 60
            mov rdi, 0
            syscall
    ",
    );
    let data = ctx.nasm(
        "data",
        "
        global counter
        section .data
        counter: dq 0
    ",
    );

    let out = elven_wald!(ctx; start, data);
    run(Command::new(out));
}
