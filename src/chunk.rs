//! Code chunks - the unit shared by the call graph and the embedding index
//!
//! Chunks are produced by an external extractor (one per function, method,
//! initializer, ...) and arrive here already carrying their body text and the
//! raw call expressions found in it.

use serde::{Deserialize, Serialize};

/// A named, indexable piece of code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeChunk {
    /// Stable identifier, unique across the index
    pub id: String,
    /// Owning file, relative to the source root
    pub file: String,
    /// Symbol name (just the identifier)
    pub name: String,
    /// Enclosing type, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Starting line number (1-indexed)
    #[serde(default)]
    pub start_line: u32,
    /// Ending line number (1-indexed, inclusive)
    #[serde(default)]
    pub end_line: u32,
    /// Source text of the chunk
    #[serde(default)]
    pub body: String,
    /// Raw call expressions, e.g. `self.load()` or `Cache.shared.get()`
    #[serde(default)]
    pub calls: Vec<String>,
}

impl CodeChunk {
    pub fn new(
        id: impl Into<String>,
        file: impl Into<String>,
        name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file: file.into(),
            name: name.into(),
            parent: None,
            start_line: 0,
            end_line: 0,
            body: body.into(),
            calls: Vec::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_lines(mut self, start: u32, end: u32) -> Self {
        self.start_line = start;
        self.end_line = end;
        self
    }

    pub fn with_calls<I, S>(mut self, calls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.calls = calls.into_iter().map(Into::into).collect();
        self
    }

    /// `Parent.name` for members, plain `name` otherwise
    pub fn symbol(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{}.{}", parent, self.name),
            None => self.name.clone(),
        }
    }

    pub fn meta(&self) -> ChunkMeta {
        ChunkMeta {
            id: self.id.clone(),
            file: self.file.clone(),
            symbol: self.symbol(),
            start_line: self.start_line,
            end_line: self.end_line,
        }
    }
}

/// The parts of a chunk worth keeping next to a vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub id: String,
    pub file: String,
    pub symbol: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// Read a chunk list produced by an external extractor.
pub fn load_chunks(path: &std::path::Path) -> crate::Result<Vec<CodeChunk>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_uses_parent() {
        let free = CodeChunk::new("1", "src/a.rs", "helper", "");
        let member = CodeChunk::new("2", "src/a.rs", "load", "").with_parent("Cache");
        assert_eq!(free.symbol(), "helper");
        assert_eq!(member.symbol(), "Cache.load");
        assert_eq!(member.meta().symbol, "Cache.load");
    }

    #[test]
    fn test_deserialize_minimal_chunk() {
        let chunk: CodeChunk = serde_json::from_str(
            r#"{"id": "c1", "file": "src/a.rs", "name": "run", "calls": ["helper()"]}"#,
        )
        .unwrap();
        assert_eq!(chunk.parent, None);
        assert_eq!(chunk.calls, vec!["helper()"]);
        assert!(chunk.body.is_empty());
    }

    #[test]
    fn test_load_chunks_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks.json");
        let chunks = vec![
            CodeChunk::new("a", "src/a.rs", "a", "fn a() {}").with_lines(1, 1),
            CodeChunk::new("b", "src/b.rs", "b", "fn b() {}").with_parent("B"),
        ];
        std::fs::write(&path, serde_json::to_string(&chunks).unwrap()).unwrap();

        assert_eq!(load_chunks(&path).unwrap(), chunks);
    }
}
