use std::sync::{Arc, OnceLock};
use tracing::error;

use super::{SchemaRegistry, SchemaVersion};

/// Versions whose dictionaries ship embedded in the crate.
pub const BUILTIN_VERSIONS: [&str; 2] = ["2.5", "2.6"];

const TABLES: [(&str, &str, &str); 2] = [
    (
        "2.5",
        include_str!("data/v2_5/segments.json"),
        include_str!("data/v2_5/datatypes.json"),
    ),
    (
        "2.6",
        include_str!("data/v2_6/segments.json"),
        include_str!("data/v2_6/datatypes.json"),
    ),
];

static REGISTRY: OnceLock<Arc<SchemaRegistry>> = OnceLock::new();

pub(super) fn registry() -> Arc<SchemaRegistry> {
    Arc::clone(REGISTRY.get_or_init(|| {
        let mut registry = SchemaRegistry::new();
        for (version, segments, datatypes) in TABLES {
            match SchemaVersion::from_json(version, segments, datatypes) {
                Ok(schema) => {
                    registry.register(schema);
                }
                // Leaving the version out surfaces later as UnknownVersion.
                Err(e) => error!(version, "Embedded HL7 schema failed to load: {}", e),
            }
        }
        Arc::new(registry)
    }))
}
