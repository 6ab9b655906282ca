use std::fmt::Write;

use log::debug;

use crate::emit::global_sym;
use crate::ir::runtime;
use crate::lir::{Instruction, Proc, Program, Reg};
use crate::sema::World;

/// Symbols the linked runtime library provides.
const EXTERNS: [&str; 14] = [
    runtime::PRINTF,
    runtime::PUTS,
    "malloc",
    runtime::MALLOC,
    runtime::PRINT_INT,
    runtime::PRINTLN_INT,
    runtime::GET_STRING,
    runtime::GET_INT,
    runtime::TO_STRING,
    runtime::STR_CONCAT,
    runtime::STR_COMPARE,
    runtime::STR_SUBSTRING,
    runtime::STR_PARSE_INT,
    runtime::STR_ORD,
];

/// Render the allocated program as NASM source: data and bss sections,
/// then one procedure per function with its prologue and epilogue, and the
/// `main` entry that runs the global initializer before the source main.
pub fn translate(world: &World, program: &Program) -> String {
    let mut translator = Translator {
        world,
        program,
        out: String::new(),
    };
    translator.translate();
    debug!("emitted {} bytes of assembly", translator.out.len());
    translator.out
}

struct Translator<'a> {
    world: &'a World,
    program: &'a Program,
    out: String,
}

impl Translator<'_> {
    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    fn translate(&mut self) {
        self.header();
        self.data_section();
        self.bss_section();
        self.text_section();
    }

    fn header(&mut self) {
        self.line("global main");
        for sym in EXTERNS {
            self.line(format!("extern {sym}"));
        }
        self.line("");
    }

    /// String literals as length-prefixed, NUL-terminated blobs, plus
    /// globals with constant initializers.
    fn data_section(&mut self) {
        if self.program.strings.is_empty() && self.program.const_globals.is_empty() {
            return;
        }

        self.line("section .data");

        for (id, text) in self.program.strings.iter().enumerate() {
            self.line(format!("str_{id}:"));
            self.line(format!("\tdq {}", text.len()));
            self.line(format!("\tdb {}", string_bytes(text)));
        }

        for (var, value) in &self.program.const_globals {
            self.line(format!("{}:", global_sym(self.world, *var)));
            self.line(format!("\tdq {value}"));
        }

        self.line("");
    }

    /// Everything else is zero-initialized.
    fn bss_section(&mut self) {
        let zeroed: Vec<_> = self
            .world
            .globals
            .iter()
            .filter(|var| {
                !self
                    .program
                    .const_globals
                    .iter()
                    .any(|(const_var, _)| const_var == *var)
            })
            .collect();

        if zeroed.is_empty() {
            return;
        }

        self.line("section .bss");
        for var in zeroed {
            self.line(format!("{}:", global_sym(self.world, *var)));
            self.line("\tresq 1");
        }
        self.line("");
    }

    fn text_section(&mut self) {
        self.line("section .text");
        self.entry();

        for proc in &self.program.procs {
            self.procedure(proc);
        }
    }

    /// The process entry: run the global initializer, then hand the source
    /// main's result straight back as the exit status.
    fn entry(&mut self) {
        let main = self
            .world
            .main
            .map(|id| self.world.fun(id).label.clone())
            .unwrap_or_else(|| "fn_main".to_string());

        self.line("main:");
        self.line("\tpush rbp");
        self.line("\tmov rbp, rsp");
        self.line(format!("\tcall {}", runtime::GLOBAL_INIT));
        self.line(format!("\tcall {main}"));
        self.line("\tpop rbp");
        self.line("\tret");
        self.line("");
    }

    fn procedure(&mut self, proc: &Proc) {
        // Frame bytes, padded so the stack stays 16-aligned at every call
        // site given the callee-saved pushes below.
        let mut frame = 8 * proc.frame_slots;
        if (frame + 8 * proc.callee_saved.len()) % 16 != 0 {
            frame += 8;
        }

        self.line(format!("{}:", proc.name));
        self.line("\tpush rbp");
        self.line("\tmov rbp, rsp");
        if frame > 0 {
            self.line(format!("\tsub rsp, {frame}"));
        }
        for saved in &proc.callee_saved {
            self.line(format!("\tpush {saved}"));
        }

        for block in &proc.blocks {
            self.line(format!("{}:", block.label));
            for inst in &block.insts {
                self.instruction(proc, inst);
            }
        }

        self.line("");
    }

    fn instruction(&mut self, proc: &Proc, inst: &Instruction) {
        match inst {
            // The return expands into the epilogue.
            Instruction::Ret => {
                for saved in proc.callee_saved.iter().rev() {
                    self.line(format!("\tpop {saved}"));
                }
                self.line("\tleave");
                self.line("\tret");
            }

            // `set<cc>` writes a byte; widen it back to the full register.
            Instruction::Set(cond, Reg::Phys(phys)) => {
                self.line(format!("\tset{} {}", cond.suffix(), phys.byte_name()));
                self.line(format!("\tmovzx {}, {}", phys.name(), phys.byte_name()));
            }
            Instruction::Set(..) => unreachable!("set on a virtual register after allocation"),

            other => self.line(format!("{other}")),
        }
    }
}

/// NASM `db` payload for a string literal: quoted when it is plain
/// printable ASCII, a byte list otherwise; always NUL-terminated.
fn string_bytes(text: &str) -> String {
    let printable = text
        .bytes()
        .all(|b| (0x20..0x7f).contains(&b) && b != b'"' && b != b'\\' && b != b'`');

    if printable && !text.is_empty() {
        format!("\"{text}\", 0")
    } else if text.is_empty() {
        "0".to_string()
    } else {
        let bytes = text
            .bytes()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{bytes}, 0")
    }
}

/// Abstract instruction dump for `--print-ins`, before allocation.
pub fn dump_instructions(program: &Program, out: &mut impl Write) -> std::fmt::Result {
    for proc in &program.procs {
        writeln!(out, "==== {} ====", proc.name)?;
        for block in &proc.blocks {
            writeln!(out, "{}:", block.label)?;
            for inst in &block.insts {
                writeln!(out, "{inst}")?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::string_bytes;

    #[test]
    fn printable_strings_stay_readable() {
        assert_eq!(string_bytes("hi"), "\"hi\", 0");
    }

    #[test]
    fn escapes_fall_back_to_bytes() {
        assert_eq!(string_bytes("a\n"), "97, 10, 0");
        assert_eq!(string_bytes(""), "0");
    }
}
