// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

/// Bit set in the composite status word for a fatal problem.
pub const STATUS_FATAL: u64 = 0o400000_000000;
/// Bit pattern set for an error attributable to the caller.
pub const STATUS_CALLER_ERROR: u64 = 0o600000_000000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacStatusCategory {
    Info,
    Warning,
    Error,
}

/// The closed set of status messages the directory services can emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FacStatusCode {
    Complete,
    SyntaxErrorInImage,
    FilenameIsRequired,
    FileIsAlreadyCataloged,
    FileIsNotCataloged,
    FileCycleOutOfRange,
    FileCycleConflict,
    PlusOneCycleExists,
    IncorrectReadKey,
    IncorrectWriteKey,
    ReadWriteKeysNeeded,
    IllegalOption,
    IllegalOptionCombination,
    MnemonicIsNotConfigured,
    MassStorageSpaceExhausted,
    HoldForPackRejected,
    RunHeldForMassStorageSpace,
    RunHeldForDiskPackMount,
}

fn template(code: FacStatusCode) -> (FacStatusCategory, &'static str) {
    use FacStatusCategory::*;
    use FacStatusCode::*;
    match code {
        Complete => (Info, "{} complete"),
        SyntaxErrorInImage => (Error, "Syntax error in image submitted."),
        FilenameIsRequired => (Error, "A filename is required on the image."),
        FileIsAlreadyCataloged => (Error, "File is already catalogued."),
        FileIsNotCataloged => (Error, "File is not catalogued."),
        FileCycleOutOfRange => (Error, "File cycle out of range."),
        FileCycleConflict => (Error, "Relative F-cycle conflict."),
        PlusOneCycleExists => (Error, "A +1 file cycle already exists for the file set."),
        IncorrectReadKey => (Error, "Read key is incorrect."),
        IncorrectWriteKey => (Error, "Write key is incorrect."),
        ReadWriteKeysNeeded => (Error, "Read and/or write keys are needed."),
        IllegalOption => (Error, "Illegal option {}."),
        IllegalOptionCombination => (Error, "Illegal option combination {}{}."),
        MnemonicIsNotConfigured => (Error, "{} is not a configured assign mnemonic."),
        MassStorageSpaceExhausted => (Error, "Mass storage space exhausted."),
        HoldForPackRejected => (Error, "Hold for disk pack rejected because of Z option."),
        RunHeldForMassStorageSpace => (Info, "Run {} held for mass storage space for {} min."),
        RunHeldForDiskPackMount => (Info, "Run {} held for disk pack to be mounted for {} min."),
    }
}

#[derive(Clone, Debug)]
pub struct FacMessage {
    pub category: FacStatusCategory,
    pub code: FacStatusCode,
    pub text: String,
}

impl fmt::Display for FacMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.category {
            FacStatusCategory::Info => "I",
            FacStatusCategory::Warning => "W",
            FacStatusCategory::Error => "E",
        };
        write!(f, "{}:{}", prefix, self.text)
    }
}

/// Accumulates the info/warning/error messages of one facilities request,
/// together with the composite status word returned to the caller.
#[derive(Clone, Debug, Default)]
pub struct FacResult {
    messages: Vec<FacMessage>,
    status_word: u64,
}

impl FacResult {
    pub fn new() -> Self {
        FacResult::default()
    }

    pub fn post(&mut self, code: FacStatusCode, values: &[&str]) {
        let (category, text) = template(code);
        if category == FacStatusCategory::Error {
            self.status_word |= STATUS_CALLER_ERROR;
        }
        self.messages.push(FacMessage {
            category,
            code,
            text: fill_template(text, values),
        });
    }

    pub fn set_fatal(&mut self) {
        self.status_word |= STATUS_FATAL;
    }

    pub fn status_word(&self) -> u64 {
        self.status_word
    }

    pub fn has_error(&self) -> bool {
        self.status_word & STATUS_FATAL != 0
            || self.status_word & STATUS_CALLER_ERROR == STATUS_CALLER_ERROR
    }

    pub fn messages(&self) -> &[FacMessage] {
        &self.messages
    }

    pub fn has_code(&self, code: FacStatusCode) -> bool {
        self.messages.iter().any(|m| m.code == code)
    }
}

fn fill_template(template: &str, values: &[&str]) -> String {
    let mut result = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut rest = template;
    while let Some(ix) = rest.find("{}") {
        result.push_str(&rest[..ix]);
        result.push_str(values.next().copied().unwrap_or(""));
        rest = &rest[ix + 2..];
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_set_the_caller_error_pattern() {
        let mut fr = FacResult::new();
        assert!(!fr.has_error());
        fr.post(FacStatusCode::Complete, &["CAT"]);
        assert!(!fr.has_error());
        assert_eq!(fr.messages()[0].text, "CAT complete");

        fr.post(FacStatusCode::IncorrectWriteKey, &[]);
        assert!(fr.has_error());
        assert_eq!(fr.status_word(), STATUS_CALLER_ERROR);
    }

    #[test]
    fn fatal_bit_is_distinct_from_caller_error() {
        let mut fr = FacResult::new();
        fr.set_fatal();
        assert_eq!(fr.status_word(), STATUS_FATAL);
        assert!(fr.has_error());
    }

    #[test]
    fn templates_substitute_in_order() {
        let mut fr = FacResult::new();
        fr.post(FacStatusCode::IllegalOptionCombination, &["I", "Z"]);
        assert_eq!(fr.messages()[0].text, "Illegal option combination IZ.");
        assert_eq!(fr.messages()[0].to_string(), "E:Illegal option combination IZ.");
    }
}
