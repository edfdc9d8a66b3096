// citron-vm - Source loader
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Recursive source loading with `include` resolution.
//!
//! The loader reads the root file, feeds each file through the preprocessor,
//! resolves `include` lines (including the `include dir/?` wildcard form)
//! and flattens everything into one line list, maintaining the line-number
//! translation table back to the original files.

use std::path::Path;

use ahash::AHashSet;
use citron_core::{GlobalsLookup, LineNumberTranslation, Module};
use citron_parser::fnv1a_64;

use super::error::{CompileError, CompileResult};
use super::preprocessor::Preprocessor;

/// The script file extension appended to include paths.
pub const SCRIPT_FILE_EXTENSION: &str = ".lemon";

/// Host file access used by the loader.
///
/// Paths use forward slashes. The default implementation reads from disk;
/// tests inject in-memory trees.
pub trait FileSystem {
    fn read_file(&self, path: &str) -> Option<Vec<u8>>;

    /// Names of script files (`*.lemon`) directly inside a directory,
    /// sorted by name so wildcard includes stay deterministic.
    fn list_script_files(&self, base_path: &str) -> Vec<String>;

    fn exists(&self, path: &str) -> bool {
        self.read_file(path).is_some()
    }
}

/// In-memory file tree, for tests and embedded script bundles.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    files: ahash::AHashMap<String, String>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(files: &[(&str, &str)]) -> Self {
        MemoryFileSystem {
            files: files
                .iter()
                .map(|(path, content)| (path.to_string(), content.to_string()))
                .collect(),
        }
    }

    pub fn add_file(&mut self, path: &str, content: &str) {
        self.files.insert(path.to_string(), content.to_string());
    }
}

impl FileSystem for MemoryFileSystem {
    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|content| content.clone().into_bytes())
    }

    fn list_script_files(&self, base_path: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter_map(|path| path.strip_prefix(base_path))
            .filter(|rest| !rest.contains('/') && rest.ends_with(SCRIPT_FILE_EXTENSION))
            .map(|rest| rest.to_string())
            .collect();
        names.sort();
        names
    }
}

/// Disk-backed file access.
#[derive(Debug, Default)]
pub struct DiskFileSystem;

impl FileSystem for DiskFileSystem {
    fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        std::fs::read(path).ok()
    }

    fn list_script_files(&self, base_path: &str) -> Vec<String> {
        let directory = if base_path.is_empty() { "." } else { base_path };
        let mut names: Vec<String> = std::fs::read_dir(directory)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.path().is_file())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter(|name| name.ends_with(SCRIPT_FILE_EXTENSION))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }
}

/// Split a slash-separated path into base directory (with trailing slash)
/// and filename.
fn split_path(path: &str) -> (String, String) {
    match path.rfind(['/', '\\']) {
        Some(position) => (
            path[..=position].replace('\\', "/"),
            path[position + 1..].to_string(),
        ),
        None => (String::new(), path.to_string()),
    }
}

/// Recursive script loader for one compile run.
pub struct ScriptLoader<'a> {
    file_system: &'a dyn FileSystem,
    module: &'a mut Module,
    globals: &'a mut GlobalsLookup,
    translation: &'a mut LineNumberTranslation,
    included_path_hashes: AHashSet<u64>,
}

impl<'a> ScriptLoader<'a> {
    pub fn new(
        file_system: &'a dyn FileSystem,
        module: &'a mut Module,
        globals: &'a mut GlobalsLookup,
        translation: &'a mut LineNumberTranslation,
    ) -> Self {
        ScriptLoader {
            file_system,
            module,
            globals,
            translation,
            included_path_hashes: AHashSet::new(),
        }
    }

    /// Load the root script and everything it includes. Returns the
    /// flattened, preprocessed line list.
    pub fn load(&mut self, path: &str) -> CompileResult<Vec<String>> {
        let (base_path, filename) = split_path(path);
        let mut lines = Vec::new();
        self.load_file(&base_path, &filename, &mut lines)?;
        Ok(lines)
    }

    fn load_file(
        &mut self,
        base_path: &str,
        filename: &str,
        out_lines: &mut Vec<String>,
    ) -> CompileResult<()> {
        let full_path = format!("{}{}", base_path, filename);
        let path_hash = fnv1a_64(full_path.as_bytes());
        if !self.included_path_hashes.insert(path_hash) {
            // Silently ignore double inclusion
            return Ok(());
        }

        let content = self.file_system.read_file(&full_path).ok_or_else(|| {
            CompileError::load(
                format!("Failed to load script file '{}' at '{}'", filename, base_path),
                out_lines.len() as u32 + 1,
            )
        })?;
        let content = String::from_utf8(content).map_err(|_| {
            CompileError::load(
                format!("Script file '{}' is not valid UTF-8", full_path),
                out_lines.len() as u32 + 1,
            )
        })?;

        let source_file = self.module.add_source_file(base_path, filename);
        self.translation
            .push(out_lines.len() as u32 + 1, source_file.clone(), 0);

        let mut file_lines: Vec<String> = content
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();

        // Preprocess this file's lines in place
        {
            let mut preprocessor =
                Preprocessor::new(&mut self.globals.preprocessor_definitions);
            preprocessor.process_lines(&mut file_lines)?;
            for (name, value) in preprocessor.new_definitions.drain(..) {
                self.module.add_preprocessor_definition(name, value);
            }
        }

        for (file_line_index, line) in file_lines.into_iter().enumerate() {
            if let Some(include_path) = line.strip_prefix("include ") {
                let include_path = include_path
                    .split(' ')
                    .next()
                    .unwrap_or("")
                    .replace('\\', "/");
                let (include_base, include_filename) = split_path(&include_path);

                if include_filename == "?" {
                    // Wildcard: include every script file in the directory
                    let directory = format!("{}{}", base_path, include_base);
                    for entry in self.file_system.list_script_files(&directory) {
                        self.load_file(&directory, &entry, out_lines)?;
                    }
                } else {
                    self.load_file(
                        &format!("{}{}", base_path, include_base),
                        &format!("{}{}", include_filename, SCRIPT_FILE_EXTENSION),
                        out_lines,
                    )?;
                }

                // Resume mapping to this file after the include
                self.translation.push(
                    out_lines.len() as u32 + 1,
                    source_file.clone(),
                    file_line_index as u32,
                );
            } else {
                out_lines.push(line);
            }
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn load(files: &[(&str, &str)], root: &str) -> CompileResult<Vec<String>> {
        let file_system = MemoryFileSystem::with(files);
        let mut globals = GlobalsLookup::new();
        let mut module = Module::new("test");
        module.start_compiling(&globals);
        let mut translation = LineNumberTranslation::new();
        let mut loader =
            ScriptLoader::new(&file_system, &mut module, &mut globals, &mut translation);
        loader.load(root)
    }

    #[test]
    fn test_simple_load() {
        let lines = load(&[("main.lemon", "a\nb\nc")], "main.lemon").unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_include_is_flattened() {
        let lines = load(
            &[
                ("scripts/main.lemon", "top\ninclude sub/part\nbottom"),
                ("scripts/sub/part.lemon", "included"),
            ],
            "scripts/main.lemon",
        )
        .unwrap();
        assert_eq!(lines, vec!["top", "included", "bottom"]);
    }

    #[test]
    fn test_double_include_is_ignored() {
        let lines = load(
            &[
                ("main.lemon", "include sub/part\ninclude sub/part"),
                ("sub/part.lemon", "once"),
            ],
            "main.lemon",
        )
        .unwrap();
        assert_eq!(lines, vec!["once"]);
    }

    #[test]
    fn test_wildcard_include() {
        let lines = load(
            &[
                ("main.lemon", "include mods/?"),
                ("mods/a.lemon", "alpha"),
                ("mods/b.lemon", "beta"),
            ],
            "main.lemon",
        )
        .unwrap();
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_wildcard_over_empty_directory_is_noop() {
        let lines = load(&[("main.lemon", "include mods/?\nend")], "main.lemon").unwrap();
        assert_eq!(lines, vec!["end"]);
    }

    #[test]
    fn test_missing_file_errors() {
        let error = load(&[("main.lemon", "include gone")], "main.lemon").unwrap_err();
        assert!(error.message.contains("Failed to load"));
    }

    #[test]
    fn test_backslashes_normalized() {
        let lines = load(
            &[
                ("main.lemon", "include sub\\part"),
                ("sub/part.lemon", "ok"),
            ],
            "main.lemon",
        )
        .unwrap();
        assert_eq!(lines, vec!["ok"]);
    }
}
