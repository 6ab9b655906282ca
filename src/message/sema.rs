use codespan_reporting::diagnostic::{Diagnostic, Label};

use super::MessageAdder;

const UNDECLARED: &str = "ES01";
const DUPLICATE: &str = "ES02";
const TYPE_MISMATCH: &str = "ES03";
const NOT_LVALUE: &str = "ES04";
const WRONG_ARG_COUNT: &str = "ES05";
const NOT_CALLABLE: &str = "ES06";
const NOT_INDEXABLE: &str = "ES07";
const NO_MEMBER: &str = "ES08";
const RETURN_MISMATCH: &str = "ES09";
const OUTSIDE_LOOP: &str = "ES10";
const NO_MAIN: &str = "ES11";
const CONDITION_NOT_BOOL: &str = "ES12";
const BAD_DIMENSIONS: &str = "ES13";
const VOID_VARIABLE: &str = "ES14";
const UNKNOWN_TYPE: &str = "ES15";
const BAD_OPERANDS: &str = "ES16";

impl<'a> MessageAdder<'a> {
    pub fn sema_undeclared(&mut self, name: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(UNDECLARED)
                .with_message(format!("undeclared name '{name}'"))
                .with_labels(labels),
        );
    }

    pub fn sema_duplicate(&mut self, name: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(DUPLICATE)
                .with_message(format!("duplicate declaration of '{name}'"))
                .with_labels(labels),
        );
    }

    pub fn sema_type_mismatch(&mut self, expected: &str, found: &str) {
        let labels = vec![
            Label::primary(self.at.file, self.at).with_message(format!("this has type {found}"))
        ];

        self.add(
            Diagnostic::error()
                .with_code(TYPE_MISMATCH)
                .with_message(format!("expected {expected}, found {found}"))
                .with_labels(labels),
        );
    }

    pub fn sema_not_lvalue(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(NOT_LVALUE)
                .with_message("this expression is not assignable")
                .with_labels(labels),
        );
    }

    pub fn sema_wrong_arg_count(&mut self, expected: usize, found: usize) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(WRONG_ARG_COUNT)
                .with_message(format!("expected {expected} arguments, found {found}"))
                .with_labels(labels),
        );
    }

    pub fn sema_not_callable(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(NOT_CALLABLE)
                .with_message("this expression is not callable")
                .with_labels(labels),
        );
    }

    pub fn sema_not_indexable(&mut self, found: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(NOT_INDEXABLE)
                .with_message(format!("cannot index a value of type {found}"))
                .with_labels(labels),
        );
    }

    pub fn sema_no_member(&mut self, ty: &str, member: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(NO_MEMBER)
                .with_message(format!("type {ty} has no member '{member}'"))
                .with_labels(labels),
        );
    }

    pub fn sema_return_mismatch(&mut self, expected: &str, found: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(RETURN_MISMATCH)
                .with_message(format!(
                    "return type mismatch: expected {expected}, found {found}"
                ))
                .with_labels(labels),
        );
    }

    pub fn sema_outside_loop(&mut self, what: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(OUTSIDE_LOOP)
                .with_message(format!("'{what}' outside of a loop"))
                .with_labels(labels),
        );
    }

    pub fn sema_no_main(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(NO_MAIN)
                .with_message("program has no 'int main()'")
                .with_labels(labels),
        );
    }

    pub fn sema_condition_not_bool(&mut self, found: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(CONDITION_NOT_BOOL)
                .with_message(format!("condition must be bool, found {found}"))
                .with_labels(labels),
        );
    }

    pub fn sema_bad_dimensions(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(BAD_DIMENSIONS)
                .with_message("array dimensions must be given left to right")
                .with_labels(labels),
        );
    }

    pub fn sema_void_variable(&mut self, name: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(VOID_VARIABLE)
                .with_message(format!("variable '{name}' cannot have type void"))
                .with_labels(labels),
        );
    }

    pub fn sema_unknown_type(&mut self, name: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(UNKNOWN_TYPE)
                .with_message(format!("unknown type '{name}'"))
                .with_labels(labels),
        );
    }

    pub fn sema_bad_operands(&mut self, op: &str, lhs: &str, rhs: &str) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(BAD_OPERANDS)
                .with_message(format!("operator '{op}' cannot combine {lhs} and {rhs}"))
                .with_labels(labels),
        );
    }
}
