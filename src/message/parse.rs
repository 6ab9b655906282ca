use codespan_reporting::diagnostic::{Diagnostic, Label};

use super::MessageAdder;

const INVALID_TOKEN: &str = "EP00";
const UNEXPECTED: &str = "EP01";
const EXPECTED_EXPR: &str = "EP02";
const EXPECTED_TYPE: &str = "EP03";
const EXPECTED_NAME: &str = "EP04";
const UNTERMINATED_STRING: &str = "EP05";

impl<'a> MessageAdder<'a> {
    pub fn lex_invalid_token(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(INVALID_TOKEN)
                .with_message("invalid token")
                .with_labels(labels),
        );
    }

    pub fn lex_unterminated_string(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(UNTERMINATED_STRING)
                .with_message("unterminated string literal")
                .with_labels(labels),
        );
    }

    pub fn parse_unexpected(&mut self, expected: &str, found: &str) {
        let labels = vec![
            Label::primary(self.at.file, self.at).with_message(format!("found {found}"))
        ];

        self.add(
            Diagnostic::error()
                .with_code(UNEXPECTED)
                .with_message(format!("expected {expected}"))
                .with_labels(labels),
        );
    }

    pub fn parse_expected_expr(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(EXPECTED_EXPR)
                .with_message("expected an expression")
                .with_labels(labels),
        );
    }

    pub fn parse_expected_type(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(EXPECTED_TYPE)
                .with_message("expected a type")
                .with_labels(labels),
        );
    }

    pub fn parse_expected_name(&mut self) {
        let labels = vec![Label::primary(self.at.file, self.at)];

        self.add(
            Diagnostic::error()
                .with_code(EXPECTED_NAME)
                .with_message("expected a name")
                .with_labels(labels),
        );
    }
}
