//! Collection name resolution.
//!
//! A hint is first classified (literal, constant, configuration key, nothing
//! usable) and the class is then mapped through a fixed decision table to a
//! `(name, method, confidence)` tuple. The table is the only place the
//! confidence constants live.

use crate::error::{Error, Result};
use crate::indexer::extract::{ConstantInput, HintSite};
use crate::indexer::stable_id::collection_mapping_id;
use crate::model::{CodeType, CollectionHint, CollectionMapping, ProvenanceStamp, ResolutionMethod};
use std::collections::HashMap;

pub const LITERAL_CONFIDENCE: f64 = 1.0;
pub const CONSTANT_CONFIDENCE: f64 = 0.8;
pub const CONFIG_CONFIDENCE: f64 = 0.7;
pub const INFERRED_CONFIDENCE: f64 = 0.6;
pub const FALLBACK_CONFIDENCE: f64 = 0.3;
pub const FALLBACK_COLLECTION: &str = "documents";

/// Scan-wide table of named string constants.
#[derive(Debug, Default, Clone)]
pub struct ConstantTable {
    by_qualname: HashMap<String, String>,
    by_name: HashMap<String, Vec<String>>,
}

impl ConstantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, qualname: &str, name: &str, value: &str) {
        self.by_qualname
            .insert(qualname.to_string(), value.to_string());
        self.by_name
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    pub fn extend<'a>(&mut self, constants: impl IntoIterator<Item = &'a ConstantInput>) {
        for constant in constants {
            self.insert(&constant.qualname, &constant.name, &constant.value);
        }
    }

    pub fn len(&self) -> usize {
        self.by_qualname.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_qualname.is_empty()
    }

    /// Full dotted name first, then a dotted suffix, then the bare name. An
    /// ambiguous match (same name, different values) resolves to nothing.
    pub fn lookup(&self, identifier: &str) -> Option<&str> {
        if let Some(value) = self.by_qualname.get(identifier) {
            return Some(value.as_str());
        }
        let suffix = format!(".{identifier}");
        let by_suffix: Vec<&String> = self
            .by_qualname
            .iter()
            .filter(|(qualname, _)| qualname.ends_with(&suffix))
            .map(|(_, value)| value)
            .collect();
        if let Some(value) = unanimous(&by_suffix) {
            return Some(value);
        }
        let last = identifier.rsplit('.').next().unwrap_or(identifier);
        let by_name: Vec<&String> = self.by_name.get(last)?.iter().collect();
        unanimous(&by_name)
    }
}

fn unanimous<'a>(values: &[&'a String]) -> Option<&'a str> {
    let first = values.first()?;
    if values.iter().all(|value| value == first) {
        Some(first.as_str())
    } else {
        None
    }
}

/// Hint after classification, before the decision table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HintClass {
    Literal(String),
    Constant { identifier: String, value: String },
    Config(String),
    /// An identifier that is neither a known constant nor a configuration key.
    Unresolved(String),
    Absent,
}

pub fn classify_hint(hint: Option<&CollectionHint>, constants: &ConstantTable) -> HintClass {
    match hint {
        None => HintClass::Absent,
        Some(CollectionHint::Literal(value)) => HintClass::Literal(value.clone()),
        Some(CollectionHint::ConfigKey(key)) => HintClass::Config(key.clone()),
        Some(CollectionHint::Identifier(identifier)) => {
            if let Some(value) = constants.lookup(identifier) {
                return HintClass::Constant {
                    identifier: identifier.clone(),
                    value: value.to_string(),
                };
            }
            if identifier.contains(':') || is_settings_access(identifier) {
                return HintClass::Config(identifier.clone());
            }
            HintClass::Unresolved(identifier.clone())
        }
    }
}

/// `settings.Value.UsersCollectionName`, `_options.Orders`, `config.Users`.
fn is_settings_access(identifier: &str) -> bool {
    let segments: Vec<&str> = identifier.split('.').collect();
    if segments.len() < 2 {
        return false;
    }
    segments[..segments.len() - 1].iter().any(|segment| {
        let lower = segment.to_ascii_lowercase();
        lower.contains("settings") || lower.contains("options") || lower.contains("config")
    })
}

/// Outcome of the decision table.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub collection_name: String,
    pub method: ResolutionMethod,
    pub confidence: f64,
    pub context: Option<String>,
}

/// Lowercased type name, pluralized by appending `s` (`Category` keeps the
/// consonant-`y` -> `ies` form). `None` for an empty name.
pub fn infer_collection_name(type_name: &str) -> Option<String> {
    let name = type_name.trim();
    if name.is_empty() {
        return None;
    }
    let lower = name.to_lowercase();
    let mut chars = lower.chars().rev();
    if let (Some('y'), Some(before)) = (chars.next(), chars.next()) {
        if !matches!(before, 'a' | 'e' | 'i' | 'o' | 'u') {
            return Some(format!("{}ies", &lower[..lower.len() - 1]));
        }
    }
    Some(format!("{lower}s"))
}

pub fn decide(class: &HintClass, type_name: &str) -> Resolution {
    match class {
        HintClass::Literal(value) => Resolution {
            collection_name: value.clone(),
            method: ResolutionMethod::Literal,
            confidence: LITERAL_CONFIDENCE,
            context: Some(format!("literal \"{value}\"")),
        },
        HintClass::Constant { identifier, value } => Resolution {
            collection_name: value.clone(),
            method: ResolutionMethod::Constant,
            confidence: CONSTANT_CONFIDENCE,
            context: Some(format!("constant {identifier} = \"{value}\"")),
        },
        HintClass::Config(key) => Resolution {
            collection_name: key.clone(),
            method: ResolutionMethod::Config,
            confidence: CONFIG_CONFIDENCE,
            context: Some(format!("configuration key {key}, value unknown statically")),
        },
        HintClass::Unresolved(_) | HintClass::Absent => {
            let note = match class {
                HintClass::Unresolved(identifier) => {
                    Some(format!("identifier {identifier} did not resolve"))
                }
                _ => None,
            };
            match infer_collection_name(type_name) {
                Some(name) => Resolution {
                    collection_name: name,
                    method: ResolutionMethod::Inferred,
                    confidence: INFERRED_CONFIDENCE,
                    context: Some(match note {
                        Some(note) => format!("{note}; inferred from type name {type_name}"),
                        None => format!("inferred from type name {type_name}"),
                    }),
                },
                None => Resolution {
                    collection_name: FALLBACK_COLLECTION.to_string(),
                    method: ResolutionMethod::Inferred,
                    confidence: FALLBACK_CONFIDENCE,
                    context: Some("no type name; generic fallback".to_string()),
                },
            }
        }
    }
}

pub struct CollectionResolver {
    constants: ConstantTable,
    stamp: ProvenanceStamp,
}

impl CollectionResolver {
    pub fn new(constants: ConstantTable, stamp: ProvenanceStamp) -> Self {
        Self { constants, stamp }
    }

    pub fn constants(&self) -> &ConstantTable {
        &self.constants
    }

    /// Pure name resolution for a hint and a type name.
    pub fn resolve_name(&self, hint: Option<&CollectionHint>, type_name: &str) -> Resolution {
        decide(&classify_hint(hint, &self.constants), type_name)
    }

    /// Exactly one mapping for `code_type`; a missing type is the only error.
    pub fn resolve(
        &self,
        code_type: Option<&CodeType>,
        hint: Option<&CollectionHint>,
    ) -> Result<CollectionMapping> {
        let code_type =
            code_type.ok_or_else(|| Error::invalid_argument("collection resolver needs a code type"))?;
        let resolution = self.resolve_name(hint, &code_type.name);
        let mut alternatives = Vec::new();
        if let Some(default) = infer_collection_name(&code_type.name) {
            if default != resolution.collection_name {
                alternatives.push(default);
            }
        }
        Ok(self.mapping(code_type, resolution, true, alternatives, None))
    }

    /// One mapping per distinct resolved name for every type. The strongest
    /// candidate is primary (ties: first site in path/line order); a type
    /// without hint sites gets its inferred mapping.
    pub fn reconcile(&self, types: &[CodeType], sites: &[HintSite]) -> Vec<CollectionMapping> {
        let mut ordered: Vec<&HintSite> = sites.iter().collect();
        ordered.sort_by(|a, b| {
            (&a.span.file_path, a.span.start_line).cmp(&(&b.span.file_path, b.span.start_line))
        });
        let mut by_type: HashMap<&str, Vec<&HintSite>> = HashMap::new();
        for site in ordered {
            by_type
                .entry(site.document_type.as_str())
                .or_default()
                .push(site);
        }

        let mut mappings = Vec::new();
        for code_type in types {
            let mut candidates: Vec<(Resolution, Option<&HintSite>)> = Vec::new();
            for site in by_type.get(code_type.name.as_str()).into_iter().flatten() {
                let resolution = self.resolve_name(Some(&site.hint), &code_type.name);
                match candidates
                    .iter_mut()
                    .find(|(existing, _)| existing.collection_name == resolution.collection_name)
                {
                    Some(existing) => {
                        if resolution.confidence > existing.0.confidence {
                            *existing = (resolution, Some(*site));
                        }
                    }
                    None => candidates.push((resolution, Some(*site))),
                }
            }
            if candidates.is_empty() {
                candidates.push((self.resolve_name(None, &code_type.name), None));
            }

            let primary_index = candidates
                .iter()
                .enumerate()
                .fold(0, |best, (idx, (resolution, _))| {
                    if resolution.confidence > candidates[best].0.confidence {
                        idx
                    } else {
                        best
                    }
                });
            let mut names: Vec<String> = candidates
                .iter()
                .map(|(resolution, _)| resolution.collection_name.clone())
                .collect();
            if let Some(default) = infer_collection_name(&code_type.name) {
                if !names.contains(&default) {
                    names.push(default);
                }
            }

            for (idx, (resolution, site)) in candidates.into_iter().enumerate() {
                let alternatives = names
                    .iter()
                    .filter(|name| **name != resolution.collection_name)
                    .cloned()
                    .collect();
                mappings.push(self.mapping(
                    code_type,
                    resolution,
                    idx == primary_index,
                    alternatives,
                    site,
                ));
            }
        }
        mappings
    }

    fn mapping(
        &self,
        code_type: &CodeType,
        resolution: Resolution,
        is_primary: bool,
        alternatives: Vec<String>,
        site: Option<&HintSite>,
    ) -> CollectionMapping {
        let provenance = match site {
            Some(site) => self.stamp.stamp(&site.span),
            None => code_type.provenance.clone(),
        };
        let context = match (resolution.context, site) {
            (Some(context), Some(site)) => Some(format!(
                "{context} at {}:{} ({})",
                site.span.file_path, site.span.start_line, site.context
            )),
            (context, _) => context,
        };
        CollectionMapping {
            id: collection_mapping_id(
                &self.stamp.repository,
                &code_type.id,
                &resolution.collection_name,
            ),
            code_type_id: code_type.id.clone(),
            collection_name: resolution.collection_name,
            method: resolution.method,
            confidence: resolution.confidence,
            context,
            is_primary,
            alternatives,
            provenance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ConstantTable {
        let mut constants = ConstantTable::new();
        constants.insert("Shop.Collections.Users", "Users", "users");
        constants.insert("Shop.Collections.Orders", "Orders", "orders");
        constants.insert("Billing.Names.Orders", "Orders", "billing_orders");
        constants
    }

    #[test]
    fn constant_lookup_prefers_full_name() {
        let constants = table();
        assert_eq!(constants.lookup("Shop.Collections.Users"), Some("users"));
        assert_eq!(constants.lookup("Collections.Users"), Some("users"));
        assert_eq!(constants.lookup("Users"), Some("users"));
        assert_eq!(constants.lookup("Collections.Orders"), Some("orders"));
        assert_eq!(constants.lookup("Orders"), None, "ambiguous bare name");
    }

    #[test]
    fn classification_follows_ladder() {
        let constants = table();
        assert_eq!(
            classify_hint(Some(&CollectionHint::Literal("users".into())), &constants),
            HintClass::Literal("users".into())
        );
        assert!(matches!(
            classify_hint(Some(&CollectionHint::Identifier("Collections.Users".into())), &constants),
            HintClass::Constant { .. }
        ));
        assert_eq!(
            classify_hint(Some(&CollectionHint::Identifier("Mongo:Users".into())), &constants),
            HintClass::Config("Mongo:Users".into())
        );
        assert_eq!(
            classify_hint(
                Some(&CollectionHint::Identifier("_settings.Value.UsersCollection".into())),
                &constants
            ),
            HintClass::Config("_settings.Value.UsersCollection".into())
        );
        assert_eq!(
            classify_hint(Some(&CollectionHint::Identifier("name".into())), &constants),
            HintClass::Unresolved("name".into())
        );
        assert_eq!(classify_hint(None, &constants), HintClass::Absent);
    }

    #[test]
    fn decision_table_constants() {
        let literal = decide(&HintClass::Literal("people".into()), "User");
        assert_eq!(
            (literal.collection_name.as_str(), literal.method, literal.confidence),
            ("people", ResolutionMethod::Literal, 1.0)
        );
        let constant = decide(
            &HintClass::Constant {
                identifier: "C.Users".into(),
                value: "users".into(),
            },
            "User",
        );
        assert_eq!(constant.confidence, 0.8);
        let config = decide(&HintClass::Config("Mongo:Users".into()), "User");
        assert_eq!(config.collection_name, "Mongo:Users");
        assert_eq!(config.confidence, 0.7);
        let inferred = decide(&HintClass::Absent, "User");
        assert_eq!(inferred.collection_name, "users");
        assert_eq!(inferred.confidence, 0.6);
        let unresolved = decide(&HintClass::Unresolved("name".into()), "Order");
        assert_eq!(unresolved.method, ResolutionMethod::Inferred);
        assert_eq!(unresolved.collection_name, "orders");
        let fallback = decide(&HintClass::Absent, "");
        assert_eq!(fallback.collection_name, "documents");
        assert_eq!(fallback.confidence, 0.3);
    }

    #[test]
    fn pluralization_is_simple() {
        assert_eq!(infer_collection_name("User").as_deref(), Some("users"));
        assert_eq!(infer_collection_name("Category").as_deref(), Some("categories"));
        assert_eq!(infer_collection_name("Day").as_deref(), Some("days"));
        assert_eq!(infer_collection_name("Person").as_deref(), Some("persons"));
        assert_eq!(infer_collection_name("Address").as_deref(), Some("addresss"));
        assert_eq!(infer_collection_name("  "), None);
    }
}
