use std::fs::File;
use std::io::Write;

use codespan_reporting::files::SimpleFiles;
use codespan_reporting::term::termcolor::{ColorChoice, StandardStream};
use codespan_reporting::term::{self, Config, DisplayStyle};
use log::debug;

use crate::args::Options;
use crate::codegen::x64;
use crate::message::Messages;
use crate::{alloc, emit, flow, input, ir, lex, opt, parse, sema};

/// How a compilation ended: either assembly was written, or diagnostics
/// were reported and the process should exit non-zero.
#[derive(Debug, Eq, PartialEq)]
pub enum Status {
    Compiled,
    Rejected,
}

/// Read the source, run the pipeline, write the assembly.
pub fn run(opts: &Options) -> anyhow::Result<Status> {
    let source = input::read_file(&opts.in_file)?;

    match compile(opts, &source)? {
        Some(asm) => {
            let mut out = File::create(&opts.out_file)?;
            out.write_all(asm.as_bytes())?;
            Ok(Status::Compiled)
        }
        None => Ok(Status::Rejected),
    }
}

/// The nine-stage pipeline over one source text. `None` means diagnostics
/// were printed.
pub fn compile(opts: &Options, source: &str) -> anyhow::Result<Option<String>> {
    let mut files = SimpleFiles::new();
    let file = files.add(opts.in_file.display().to_string(), source.to_string());

    let mut msgs = Messages::new();

    // Front end.
    let tokens = lex::lex(&mut msgs, source, file);
    let ast = parse::parse(&mut msgs, tokens, file);
    if !msgs.is_empty() {
        report(&files, msgs)?;
        return Ok(None);
    }

    let mut world = sema::resolve(&mut msgs, ast);
    sema::typeck(&mut msgs, &mut world);
    if !msgs.is_empty() {
        report(&files, msgs)?;
        return Ok(None);
    }

    sema::eliminate_irrelevant(&mut world, opts.print_remove, source);

    // The core.
    let ir = ir::build(&world);
    let mut program = emit::emit(&world, ir);
    flow::analyze(&mut program);
    opt::optimize(&mut program);

    if opts.print_ins {
        let mut dump = String::new();
        x64::dump_instructions(&program, &mut dump)?;
        eprint!("{dump}");
    }

    alloc::allocate(&mut program)?;

    let asm = x64::translate(&world, &program);
    debug!("compiled {}", opts.in_file.display());
    Ok(Some(asm))
}

/// One short line per diagnostic, to stderr.
fn report(files: &SimpleFiles<String, String>, msgs: Messages) -> anyhow::Result<()> {
    let mut writer = StandardStream::stderr(ColorChoice::Auto);
    let config = Config {
        display_style: DisplayStyle::Short,
        ..Default::default()
    };

    for msg in &msgs.msgs {
        term::emit(&mut writer, &config, files, msg)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn opts() -> Options {
        Options {
            in_file: PathBuf::from("test.mx"),
            out_file: PathBuf::from("test.asm"),
            print_ins: false,
            print_remove: false,
        }
    }

    fn compile_ok(source: &str) -> String {
        compile(&opts(), source)
            .expect("no internal error")
            .expect("no diagnostics")
    }

    fn rejects(source: &str) {
        assert!(compile(&opts(), source).unwrap().is_none());
    }

    #[test]
    fn hello_world_compiles() {
        let asm = compile_ok(r#"int main() { println("hello"); return 0; }"#);

        assert!(asm.contains("global main"));
        assert!(asm.contains("extern puts"));
        assert!(asm.contains("call __init"));
        assert!(asm.contains("call fn_main"));
        assert!(asm.contains("fn_main:"));
        assert!(asm.contains("\"hello\", 0"));
        // The string block starts with its length word.
        assert!(asm.contains("dq 5"));
    }

    #[test]
    fn empty_function_still_has_prologue_and_epilogue() {
        let asm = compile_ok("void nop() {} int main() { nop(); return 0; }");

        let fun = asm.split("fn_nop:").nth(1).expect("fn_nop emitted");
        assert!(fun.contains("push rbp"));
        assert!(fun.contains("mov rbp, rsp"));
        assert!(fun.contains("leave"));
        assert!(fun.contains("ret"));
    }

    #[test]
    fn no_virtual_registers_in_output() {
        let asm = compile_ok(
            "int add(int a, int b) { return a + b; }
             int main() { return add(add(1, 2), add(3, 4)); }",
        );
        for line in asm.lines() {
            assert!(!line.contains(" v0"), "virtual register leaked: {line}");
        }
    }

    #[test]
    fn global_initializers() {
        let asm = compile_ok(
            "int simple = 42;
             int computed = 6 * 7 + 1;
             int main() { return simple + computed; }",
        );

        // A constant initializer lands in .data; a computed one runs in
        // the implicit initializer.
        assert!(asm.contains("gv_simple:"));
        assert!(asm.contains("dq 42"));
        assert!(asm.contains("__init:"));
    }

    #[test]
    fn classes_and_arrays_work_end_to_end() {
        let asm = compile_ok(
            "class Point {
                 int x; int y;
                 Point(int a) { x = a; y = a + 1; }
                 int sum() { return x + y; }
             }
             int main() {
                 Point[] ps = new Point[3];
                 ps[0] = new Point(4);
                 return ps[0].sum() + ps.size();
             }",
        );

        assert!(asm.contains("fn_Point_Point:"));
        assert!(asm.contains("fn_Point_sum:"));
        assert!(asm.contains("call __malloc"));
    }

    #[test]
    fn semantic_errors_reject() {
        rejects("int main() { return x; }");
        rejects("int main() { return true; }");
        rejects("int main() { int a; int a; return 0; }");
        rejects("int main() { 1 = 2; return 0; }");
        rejects("void f() {} void f() {} int main() { return 0; }");
        rejects("int main() { break; return 0; }");
        rejects("void main() {}");
    }

    #[test]
    fn parse_errors_reject() {
        rejects("int main() { return 0 }");
        rejects("int main( { return 0; }");
        rejects("class { }");
    }

    #[test]
    fn short_circuit_scenario() {
        // The right-hand side traps if evaluated; it must sit behind the
        // short-circuit branch, not before it.
        let asm = compile_ok(
            r#"int zero = 0;
             bool error() { return 1 / zero > 0; }
             int main() {
                 int a = getInt();
                 if (a == 0 || error()) println("1 - true");
                 if (a != 0 && error()) println("x"); else println("2 - false");
                 if (!(!(a == 0))) println("4 - true");
                 return 0;
             }"#,
        );
        assert!(asm.contains("fn_error:"));
    }

    #[test]
    fn deep_array_scenario() {
        let asm = compile_ok(
            "int main() {
                 int[][][] a = new int[2][2][2];
                 a[0][1][0] = 3;
                 a[1][0][1] = a[0][1][0] + 2;
                 __printlnInt(a[1][0][1]);
                 return 0;
             }",
        );
        assert!(asm.contains("call __malloc"));
        assert!(asm.contains("call __printlnInt"));
    }

    #[test]
    fn member_chain_scenario() {
        let asm = compile_ok(
            "class Node {
                 int value;
                 Node next;
             }
             int main() {
                 Node head = new Node();
                 head.next = new Node();
                 head.next.value = 494;
                 __printlnInt(head.next.value);
                 return 0;
             }",
        );
        assert!(asm.contains("fn_main:"));
    }

    #[test]
    fn constant_propagation_scenario() {
        // Every operand is statically known; the whole computation should
        // fold down to constant stores.
        let asm = compile_ok(
            "int main() {
                 int a = 5;
                 int b = a * 4;
                 int c = b << 13;
                 __printlnInt(c);
                 return 0;
             }",
        );

        // 5 * 4 << 13 = 163840, moved straight into the argument register.
        assert!(asm.contains("163840"));
        assert!(!asm.contains("imul"));
        assert!(!asm.contains("shl"));
    }

    #[test]
    fn naive_allocation_scenario() {
        // More locals than the graph allocator's threshold: everything
        // lives on the stack and goes through the scratch pair.
        let mut source = String::from("int main() {\n");
        for at in 0..260 {
            source.push_str(&format!("int x{at} = {at};\n"));
        }
        source.push_str("return x0 + x259;\n}\n");

        let asm = compile_ok(&source);
        assert!(asm.contains("r10"), "scratch registers in use");
        assert!(asm.contains("sub rsp,"));
    }

    #[test]
    fn division_strength_reduction() {
        let asm = compile_ok("int main() { int a = getInt(); return a / 8 + a % 4 + a * 16; }");

        // No idiv: all three reduce to shift sequences.
        assert!(!asm.contains("idiv"));
        assert!(asm.contains("sar"));
        assert!(asm.contains("shl"));
    }

    #[test]
    fn general_division_uses_fixed_registers() {
        let asm = compile_ok("int main() { int a = getInt(); return a / getInt(); }");

        assert!(asm.contains("cqo"));
        assert!(asm.contains("idiv"));
    }
}
