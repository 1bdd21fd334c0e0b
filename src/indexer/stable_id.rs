use crate::model::{EntityType, OperationKind, RelationshipKind};
use blake3::Hasher;

/// Hash `parts` into a `{prefix}_{16_hex_chars}` identifier.
///
/// Parts are separated by a null byte so `("ab", "c")` and `("a", "bc")` differ.
/// Nothing positional (line numbers, byte offsets) should be passed in: a fact
/// must keep its id when blank lines are added above it, so that a re-scan
/// upserts instead of duplicating.
fn stable_id(prefix: &str, parts: &[&str]) -> String {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\x00");
    }
    let hash = hasher.finalize();
    format!("{prefix}_{}", &hash.to_hex()[..16])
}

pub fn code_type_id(repository: &str, file_path: &str, qualified_name: &str) -> String {
    stable_id("type", &[repository, file_path, qualified_name])
}

pub fn collection_mapping_id(repository: &str, code_type_id: &str, collection: &str) -> String {
    stable_id("map", &[repository, code_type_id, collection])
}

/// `ordinal` is the position of the operation among operations of the same
/// kind inside the same enclosing member.
pub fn query_operation_id(
    repository: &str,
    file_path: &str,
    symbol: &str,
    kind: OperationKind,
    ordinal: usize,
) -> String {
    let ordinal = ordinal.to_string();
    stable_id(
        "op",
        &[repository, file_path, symbol, kind.as_str(), &ordinal],
    )
}

pub fn relationship_id(source_type_id: &str, target_type_id: &str, kind: RelationshipKind) -> String {
    stable_id("rel", &[source_type_id, target_type_id, kind.as_str()])
}

pub fn observed_schema_id(repository: &str, collection: &str) -> String {
    stable_id("schema", &[repository, collection])
}

pub fn drift_signal_id(code_type_id: &str, field: &str, kind: &str) -> String {
    stable_id("drift", &[code_type_id, field, kind])
}

pub fn kb_entry_id(entity_type: EntityType, entity_id: &str) -> String {
    stable_id("kb", &[entity_type.as_str(), entity_id])
}
