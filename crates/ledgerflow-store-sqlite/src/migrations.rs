//! Schema migrations, applied in order at connect time.

/// Ordered list of (name, sql) migrations. Names are recorded in
/// `_migrations` so each script runs exactly once per database file.
pub(crate) fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![(
        "20250301000000_initial_schema",
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            flow_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            status TEXT NOT NULL,
            blob TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (flow_id, seq)
        );

        CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON checkpoints(status);

        CREATE TABLE IF NOT EXISTS flow_leases (
            flow_id TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );
        "#,
    )]
}
