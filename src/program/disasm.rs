//! Text listings of a compiled program: full disassembly and symbol names.

use std::fmt::Write;

use super::{Constant, Function, Program};

impl Program {
    pub fn disassemble(&self) -> String {
        let mut out = String::new();

        if !self.classes.is_empty() {
            out.push('\n');
            for (i, c) in self.classes.iter().enumerate() {
                let _ = write!(out, "\n{}C {}", i, c.name);
            }
        }

        if !self.functions.is_empty() {
            out.push('\n');
            for f in &self.functions {
                self.write_function(&mut out, f);
            }
        }

        if !self.constants.is_empty() {
            out.push('\n');
            self.write_constants(&mut out);
        }

        out.push('\n');
        out
    }

    pub fn disassemble_function(&self, f: &Function) -> String {
        let mut out = String::new();
        self.write_function(&mut out, f);
        out
    }

    fn write_function(&self, out: &mut String, f: &Function) {
        let _ = write!(out, "\n{}F {}", f.index, f.name);

        for (pc, instr) in f.instructions.iter().enumerate() {
            let _ = write!(out, "\n  {:<5} {}", pc, instr);
            if f.positions.len() > pc {
                let _ = write!(out, "   ;   {}", self.to_trace_line(f, pc));
            }
        }

        let kind = if f.index == 0 { "G" } else { "L" };
        let _ = write!(out, "\n  MaxRegIndex {}", f.max_reg_index);
        for (i, r) in f.registers.iter().enumerate() {
            let _ = write!(out, "\n  {}{} {} {}-{}", i, kind, r.name, r.start_pc, r.end_pc.unwrap_or(0));
        }
        out.push('\n');
    }

    fn write_constants(&self, out: &mut String) {
        for (i, k) in self.constants.iter().enumerate() {
            match k {
                Constant::String(s) => {
                    let s: String = s.chars().take(50).collect();
                    let _ = writeln!(out, "{}K string {}", i, s.replace('\n', "\\n"));
                }
                other => {
                    let v = other.to_value();
                    let _ = writeln!(out, "{}K {} {}", i, v.type_name(), v);
                }
            }
        }
    }

    /// Lists classes, functions and optionally their registers.
    pub fn names(&self, registers: bool) -> String {
        let mut out = String::new();

        if !self.classes.is_empty() {
            for (i, c) in self.classes.iter().enumerate() {
                let _ = write!(out, "\n{}C {}", i, c.name);
                let functions: Vec<&Function> = c.functions.iter().map(|&fi| &self.functions[fi]).collect();
                self.write_names(&mut out, true, 1, &functions, registers);
            }
            out.push('\n');
        }

        let functions: Vec<&Function> = self.functions.iter().collect();
        self.write_names(&mut out, false, 0, &functions, registers);
        out.push('\n');
        out
    }

    fn write_names(&self, out: &mut String, in_class: bool, indent: usize, functions: &[&Function], registers: bool) {
        let tabs = "\t".repeat(indent);
        for (i, f) in functions.iter().enumerate() {
            if !in_class && f.is_class {
                continue;
            }
            let _ = write!(out, "\n{}{}F {}    {}", tabs, i, f.name, self.to_trace_line(f, 0));

            if registers {
                let kind = if f.is_global { "G" } else { "L" };
                for (j, r) in f.registers.iter().enumerate() {
                    let _ = write!(out, "\n{}\t{}{} {}", tabs, j, kind, r.name);
                }
            }
        }
    }
}
