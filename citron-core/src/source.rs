// citron-core - Source file records and line-number translation
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Source-file records and the translation from flattened line numbers back
//! to the originating file and local line.

use std::rc::Rc;

/// A source file pulled in during compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileInfo {
    pub base_path: String,
    pub filename: String,
    /// Index inside the module's source-file list.
    pub index: usize,
}

impl SourceFileInfo {
    pub fn full_path(&self) -> String {
        format!("{}{}", self.base_path, self.filename)
    }
}

/// One span of the flattened line space mapping back into a source file.
#[derive(Debug, Clone)]
struct TranslationEntry {
    /// First global line (1-based) this entry covers.
    global_line_start: u32,
    source_file: Rc<SourceFileInfo>,
    /// Local line (0-based) corresponding to `global_line_start`.
    local_line_offset: u32,
}

/// Result of translating a flattened line number.
#[derive(Debug, Clone)]
pub struct TranslatedLine {
    pub source_file: Rc<SourceFileInfo>,
    /// 0-based line inside the source file.
    pub local_line: u32,
}

/// Append-only table mapping flattened (include-resolved) line numbers back
/// to their source files.
///
/// Entries are pushed in increasing global-line order: one when a file
/// starts contributing lines, and one after each resolved include to return
/// to the including file.
#[derive(Debug, Default)]
pub struct LineNumberTranslation {
    entries: Vec<TranslationEntry>,
}

impl LineNumberTranslation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record that global line `global_line_start` maps to
    /// `source_file`:`local_line_offset`.
    pub fn push(
        &mut self,
        global_line_start: u32,
        source_file: Rc<SourceFileInfo>,
        local_line_offset: u32,
    ) {
        debug_assert!(
            self.entries
                .last()
                .map(|e| e.global_line_start <= global_line_start)
                .unwrap_or(true),
            "translation entries must be pushed in increasing order"
        );
        self.entries.push(TranslationEntry {
            global_line_start,
            source_file,
            local_line_offset,
        });
    }

    /// Translate a 1-based flattened line number. Lines before the first
    /// entry (or an empty table) return `None`.
    pub fn translate(&self, global_line: u32) -> Option<TranslatedLine> {
        let entry = self
            .entries
            .iter()
            .rev()
            .find(|e| e.global_line_start <= global_line)?;
        Some(TranslatedLine {
            source_file: entry.source_file.clone(),
            local_line: entry.local_line_offset + (global_line - entry.global_line_start),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, index: usize) -> Rc<SourceFileInfo> {
        Rc::new(SourceFileInfo {
            base_path: "scripts/".to_string(),
            filename: name.to_string(),
            index,
        })
    }

    #[test]
    fn test_translate_single_file() {
        let mut table = LineNumberTranslation::new();
        table.push(1, file("main.lemon", 0), 0);

        let t = table.translate(5).unwrap();
        assert_eq!(t.source_file.filename, "main.lemon");
        assert_eq!(t.local_line, 4);
    }

    #[test]
    fn test_translate_after_include() {
        let mut table = LineNumberTranslation::new();
        // main.lemon line 1 is the include, sub.lemon has 10 lines
        table.push(1, file("sub.lemon", 1), 0);
        table.push(11, file("main.lemon", 0), 1);

        let t = table.translate(3).unwrap();
        assert_eq!(t.source_file.filename, "sub.lemon");
        assert_eq!(t.local_line, 2);

        let t = table.translate(12).unwrap();
        assert_eq!(t.source_file.filename, "main.lemon");
        assert_eq!(t.local_line, 2);
    }

    #[test]
    fn test_translate_empty() {
        let table = LineNumberTranslation::new();
        assert!(table.translate(1).is_none());
    }
}
