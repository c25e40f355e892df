//! Database schema definitions

/// SQL to create the embeddings table.
///
/// A row is only valid for the file content it was computed from, so the
/// owning file's fingerprint is part of the key.
pub const CREATE_EMBEDDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT NOT NULL,
    fingerprint TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    vector BLOB NOT NULL,
    PRIMARY KEY (chunk_id, fingerprint)
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_embeddings_chunk ON embeddings(chunk_id)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_EMBEDDINGS_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
