// citron-vm - Compiler driver
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! The compile driver: loads a root script, runs frontend and backend, and
//! buffers diagnostics with source-file attribution.
//!
//! Where it is safe to continue after an error (separate function bodies),
//! the driver keeps going and reports everything it found; no partial module
//! is ever installed.

pub mod backend;
pub mod error;
pub mod frontend;
pub mod loader;
pub mod nodes;
pub mod options;
pub mod preprocessor;
pub mod token_processing;
pub mod type_casting;

use citron_core::{GlobalsLookup, LineNumberTranslation, Module};

use error::{CompileError, ErrorMessage};
use loader::{FileSystem, ScriptLoader};
use options::CompileOptions;

/// Compiles one module from a root script path.
pub struct Compiler<'a> {
    module: &'a mut Module,
    globals: &'a mut GlobalsLookup,
    options: CompileOptions,
    translation: LineNumberTranslation,
    errors: Vec<ErrorMessage>,
}

impl<'a> Compiler<'a> {
    pub fn new(
        module: &'a mut Module,
        globals: &'a mut GlobalsLookup,
        options: CompileOptions,
    ) -> Self {
        Compiler {
            module,
            globals,
            options,
            translation: LineNumberTranslation::new(),
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[ErrorMessage] {
        &self.errors
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn line_number_translation(&self) -> &LineNumberTranslation {
        &self.translation
    }

    /// Load and compile the script at `path` (plus everything it includes)
    /// into the module. Returns false and buffers diagnostics on failure.
    pub fn load_script(&mut self, path: &str, file_system: &dyn FileSystem) -> bool {
        self.errors.clear();
        self.translation = LineNumberTranslation::new();
        self.module.start_compiling(self.globals);

        let lines = {
            let mut loader = ScriptLoader::new(
                file_system,
                self.module,
                self.globals,
                &mut self.translation,
            );
            match loader.load(path) {
                Ok(lines) => lines,
                Err(error) => {
                    self.push_error(error);
                    return false;
                }
            }
        };

        if let Some(output_path) = self.options.output_combined_source.clone() {
            let combined = lines.join("\r\n");
            if std::fs::write(&output_path, combined).is_err() {
                self.push_error(CompileError::load(
                    format!("Failed to write combined source to '{}'", output_path.display()),
                    0,
                ));
                return false;
            }
        }

        self.compile_lines(&lines)
    }

    /// Compile already-loaded, preprocessed lines.
    pub fn compile_lines(&mut self, lines: &[String]) -> bool {
        let mut body_errors: Vec<CompileError> = Vec::new();
        let entries = match frontend::run_frontend(
            self.module,
            self.globals,
            &mut self.options,
            &self.translation,
            lines,
            &mut body_errors,
        ) {
            Ok(entries) => entries,
            Err(error) => {
                self.push_error(error);
                return false;
            }
        };
        if !body_errors.is_empty() {
            for error in body_errors {
                self.push_error(error);
            }
            return false;
        }

        let mut any_failed = false;
        for entry in &entries {
            if let Err(error) = backend::compile_function(entry, &self.options) {
                self.push_error(error);
                any_failed = true;
            }
        }
        !any_failed
    }

    fn push_error(&mut self, error: CompileError) {
        self.errors.push(translate_error(&self.translation, error));
    }
}

/// Attach source-file information to an error's flattened line number.
pub fn translate_error(
    translation: &LineNumberTranslation,
    error: CompileError,
) -> ErrorMessage {
    match translation.translate(error.line) {
        Some(translated) => ErrorMessage {
            filename: translated.source_file.filename.clone(),
            // Local lines are 0-based internally, 1-based for display
            line: translated.local_line + 1,
            kind: error.kind,
            text: error.message,
        },
        None => ErrorMessage {
            filename: String::new(),
            line: error.line,
            kind: error.kind,
            text: error.message,
        },
    }
}
