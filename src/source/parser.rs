//! Syntax tree producers
//!
//! Parsing is an external capability as far as the snapshot store is
//! concerned: it only needs something that can tell whether a path is a
//! source file and turn text into a tree. `TreeSitterParser` is the default,
//! picking a grammar by file extension.

use std::path::Path;
use tree_sitter::{Language, Parser, Tree};

/// Produces syntax trees for source units.
pub trait SyntaxParser: Send + Sync {
    /// Whether files at `path` are source files this parser understands
    fn supports(&self, path: &Path) -> bool;

    /// Build a tree for `source`. `None` means the text could not be parsed.
    fn parse(&self, path: &str, source: &str) -> Option<Tree>;
}

struct Grammar {
    name: &'static str,
    language: Language,
    extensions: &'static [&'static str],
}

/// Tree-sitter backed parser with one grammar per extension family
pub struct TreeSitterParser {
    grammars: Vec<Grammar>,
}

impl TreeSitterParser {
    /// Parser covering every bundled grammar
    pub fn new() -> Self {
        Self {
            grammars: vec![
                Grammar {
                    name: "Rust",
                    language: tree_sitter_rust::LANGUAGE.into(),
                    extensions: &["rs"],
                },
                Grammar {
                    name: "Python",
                    language: tree_sitter_python::LANGUAGE.into(),
                    extensions: &["py", "pyi"],
                },
                Grammar {
                    name: "JavaScript",
                    language: tree_sitter_javascript::LANGUAGE.into(),
                    extensions: &["js", "jsx", "mjs", "cjs"],
                },
                Grammar {
                    name: "Go",
                    language: tree_sitter_go::LANGUAGE.into(),
                    extensions: &["go"],
                },
            ],
        }
    }

    /// Restrict to the grammars whose extensions are listed
    pub fn only(extensions: &[&str]) -> Self {
        let mut parser = Self::new();
        parser
            .grammars
            .retain(|g| g.extensions.iter().any(|ext| extensions.contains(ext)));
        parser
    }

    fn grammar_for(&self, path: &Path) -> Option<&Grammar> {
        let ext = path.extension()?.to_str()?;
        self.grammars.iter().find(|g| g.extensions.contains(&ext))
    }

    /// Name of the grammar that handles `path`
    pub fn language_name(&self, path: &Path) -> Option<&'static str> {
        self.grammar_for(path).map(|g| g.name)
    }
}

impl Default for TreeSitterParser {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntaxParser for TreeSitterParser {
    fn supports(&self, path: &Path) -> bool {
        self.grammar_for(path).is_some()
    }

    fn parse(&self, path: &str, source: &str) -> Option<Tree> {
        let grammar = self.grammar_for(Path::new(path))?;
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&grammar.language) {
            tracing::error!("Failed to set {} language for {}: {}", grammar.name, path, e);
            return None;
        }
        parser.parse(source, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_by_extension() {
        let parser = TreeSitterParser::new();
        assert!(parser.supports(Path::new("src/main.rs")));
        assert!(parser.supports(Path::new("app/views.py")));
        assert!(parser.supports(Path::new("web/index.mjs")));
        assert!(!parser.supports(Path::new("README.md")));
        assert!(!parser.supports(Path::new("Makefile")));
        assert_eq!(parser.language_name(Path::new("cmd/main.go")), Some("Go"));
    }

    #[test]
    fn test_only_restricts_grammars() {
        let parser = TreeSitterParser::only(&["rs"]);
        assert!(parser.supports(Path::new("lib.rs")));
        assert!(!parser.supports(Path::new("lib.py")));
    }

    #[test]
    fn test_parse_rust() {
        let parser = TreeSitterParser::new();
        let tree = parser.parse("lib.rs", "fn main() { helper(); }").unwrap();
        assert_eq!(tree.root_node().kind(), "source_file");
        assert!(!tree.root_node().has_error());
    }
}
