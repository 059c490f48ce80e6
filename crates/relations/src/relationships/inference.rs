//! Naming conventions used to derive relation keys
//!
//! Foreign keys, discriminator columns, through-model names and embedded
//! property names are all derived here from model names, so the same
//! conventions apply wherever a relation is declared.

use serde::{Deserialize, Serialize};

use super::metadata::{CollectSource, RelationDefinition, RelationType};

/// Foreign key naming conventions
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ForeignKeyConvention {
    /// `userId` (default)
    #[default]
    CamelCase,
    /// `user_id`
    Underscore,
    /// Custom pattern, `{model}` is replaced with the lower-camel model name
    Custom(String),
}

impl ForeignKeyConvention {
    /// Foreign key pointing at `model` under this convention
    pub fn foreign_key_for(&self, model: &str) -> String {
        match self {
            ForeignKeyConvention::CamelCase => format!("{}Id", camelize_lower(model)),
            ForeignKeyConvention::Underscore => format!("{}_id", to_snake_case(model)),
            ForeignKeyConvention::Custom(pattern) => pattern.replace("{model}", &camelize_lower(model)),
        }
    }

    /// Foreign key property for a named relation (`author` → `authorId`)
    pub fn relation_key(&self, relation: &str) -> String {
        match self {
            ForeignKeyConvention::Underscore => format!("{}_id", to_snake_case(relation)),
            _ => format!("{}Id", relation),
        }
    }

    /// Discriminator property for a polymorphic base name
    pub fn discriminator_for(&self, base: &str) -> String {
        match self {
            ForeignKeyConvention::Underscore => format!("{}_type", to_snake_case(base)),
            _ => format!("{}Type", base),
        }
    }
}

/// Lower-case the first character: `AssemblyPart` → `assemblyPart`
pub fn camelize_lower(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Convert `AssemblyPart` (or `assemblyPart`) to `assembly_part`
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Basic English pluralization
pub fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return String::new();
    }

    let lower = word.to_lowercase();
    if lower.ends_with('y') && !ends_with_vowel_before_y(&lower) {
        format!("{}ies", &word[..word.len() - 1])
    } else if lower.ends_with('s')
        || lower.ends_with("sh")
        || lower.ends_with("ch")
        || lower.ends_with('x')
        || lower.ends_with('z')
    {
        format!("{}es", word)
    } else {
        format!("{}s", word)
    }
}

fn ends_with_vowel_before_y(word: &str) -> bool {
    let mut rev = word.chars().rev();
    rev.next();
    matches!(rev.next(), Some('a' | 'e' | 'i' | 'o' | 'u'))
}

/// Default property holding an embedsOne document: `Address` → `address`
pub fn embeds_one_property(model_to: &str) -> String {
    camelize_lower(model_to)
}

/// Default property holding embedsMany documents: `Address` → `addresses`
pub fn embeds_many_property(model_to: &str) -> String {
    camelize_lower(&pluralize(model_to))
}

/// Default property holding referenced ids: `Account` → `accountIds`
pub fn references_many_property(model_to: &str) -> String {
    format!("{}Ids", camelize_lower(model_to))
}

/// Candidate names for an implicit hasAndBelongsToMany join model, in lookup order
pub fn join_model_candidates(model_from: &str, model_to: &str) -> [String; 2] {
    [
        format!("{}{}", model_from, model_to),
        format!("{}{}", model_to, model_from),
    ]
}

/// Outcome of resolving the collect relation of a through relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectResolution {
    /// belongsTo relation on the through model leading to the target
    pub collect: String,
    /// Property on the through model holding the target key
    pub key_through: String,
    pub source: CollectSource,
}

/// Pick the belongsTo relation on the through model that leads to the target.
///
/// A belongsTo whose key matches `key_through` wins over one that merely
/// targets `model_to`. Within each pass the first declared relation wins.
pub fn resolve_collect<'a, I>(
    through_relations: I,
    model_to: &str,
    key_through: &str,
    explicit_key_through: bool,
) -> CollectResolution
where
    I: IntoIterator<Item = &'a RelationDefinition>,
{
    let belongs_to: Vec<&RelationDefinition> = through_relations
        .into_iter()
        .filter(|rel| rel.kind == RelationType::BelongsTo)
        .collect();

    if explicit_key_through {
        if let Some(rel) = belongs_to.iter().find(|rel| rel.key_from == key_through) {
            return CollectResolution {
                collect: rel.name.clone(),
                key_through: key_through.to_string(),
                source: CollectSource::ExplicitKeyThrough,
            };
        }
    } else {
        if let Some(rel) = belongs_to.iter().find(|rel| rel.key_from == key_through) {
            return CollectResolution {
                collect: rel.name.clone(),
                key_through: rel.key_from.clone(),
                source: CollectSource::MatchedForeignKey,
            };
        }
        if let Some(rel) = belongs_to.iter().find(|rel| rel.model_to.as_deref() == Some(model_to)) {
            return CollectResolution {
                collect: rel.name.clone(),
                key_through: rel.key_from.clone(),
                source: CollectSource::MatchedTargetModel,
            };
        }
    }

    CollectResolution {
        collect: camelize_lower(model_to),
        key_through: key_through.to_string(),
        source: CollectSource::Fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relationships::metadata::RelationOptions;

    fn belongs_to(name: &str, model_to: &str, key_from: &str) -> RelationDefinition {
        RelationDefinition {
            name: name.to_string(),
            kind: RelationType::BelongsTo,
            model_from: "AssemblyPart".to_string(),
            model_to: Some(model_to.to_string()),
            key_from: key_from.to_string(),
            key_to: "id".to_string(),
            multiple: false,
            polymorphic: None,
            through: None,
            scope: None,
            properties: None,
            options: RelationOptions::default(),
        }
    }

    #[test]
    fn test_foreign_key_conventions() {
        assert_eq!(ForeignKeyConvention::CamelCase.foreign_key_for("User"), "userId");
        assert_eq!(ForeignKeyConvention::CamelCase.foreign_key_for("AssemblyPart"), "assemblyPartId");
        assert_eq!(ForeignKeyConvention::Underscore.foreign_key_for("AssemblyPart"), "assembly_part_id");
        assert_eq!(
            ForeignKeyConvention::Custom("{model}Ref".to_string()).foreign_key_for("User"),
            "userRef"
        );
    }

    #[test]
    fn test_relation_and_discriminator_keys() {
        let camel = ForeignKeyConvention::CamelCase;
        assert_eq!(camel.relation_key("author"), "authorId");
        assert_eq!(camel.discriminator_for("imageable"), "imageableType");

        let snake = ForeignKeyConvention::Underscore;
        assert_eq!(snake.relation_key("author"), "author_id");
        assert_eq!(snake.discriminator_for("imageable"), "imageable_type");
    }

    #[test]
    fn test_pluralize() {
        assert_eq!(pluralize("Post"), "Posts");
        assert_eq!(pluralize("Category"), "Categories");
        assert_eq!(pluralize("Day"), "Days");
        assert_eq!(pluralize("Address"), "Addresses");
        assert_eq!(pluralize("Box"), "Boxes");
        assert_eq!(pluralize("Branch"), "Branches");
    }

    #[test]
    fn test_embedded_property_defaults() {
        assert_eq!(embeds_one_property("Address"), "address");
        assert_eq!(embeds_many_property("Address"), "addresses");
        assert_eq!(embeds_many_property("EmailAddress"), "emailAddresses");
        assert_eq!(references_many_property("Account"), "accountIds");
    }

    #[test]
    fn test_join_model_candidates() {
        let [first, second] = join_model_candidates("Assembly", "Part");
        assert_eq!(first, "AssemblyPart");
        assert_eq!(second, "PartAssembly");
    }

    #[test]
    fn test_collect_prefers_matching_foreign_key() {
        let rels = vec![
            belongs_to("primaryPart", "Part", "primaryPartId"),
            belongs_to("part", "Part", "partId"),
        ];
        let resolved = resolve_collect(&rels, "Part", "partId", false);
        // an earlier belongsTo targeting Part does not shadow the key match
        assert_eq!(resolved.collect, "part");
        assert_eq!(resolved.key_through, "partId");
        assert_eq!(resolved.source, CollectSource::MatchedForeignKey);
    }

    #[test]
    fn test_collect_target_model_match_in_declaration_order() {
        let rels = vec![
            belongs_to("assembly", "Assembly", "assemblyId"),
            belongs_to("primaryPart", "Part", "primaryPartId"),
            belongs_to("spare", "Part", "spareId"),
        ];
        let resolved = resolve_collect(&rels, "Part", "partId", false);
        assert_eq!(resolved.collect, "primaryPart");
        assert_eq!(resolved.key_through, "primaryPartId");
        assert_eq!(resolved.source, CollectSource::MatchedTargetModel);
    }

    #[test]
    fn test_collect_foreign_key_match_before_later_model_match() {
        let rels = vec![
            belongs_to("part", "Part", "partId"),
            belongs_to("spare", "Part", "spareId"),
        ];
        let resolved = resolve_collect(&rels, "Part", "partId", false);
        assert_eq!(resolved.collect, "part");
        assert_eq!(resolved.source, CollectSource::MatchedForeignKey);
    }

    #[test]
    fn test_collect_explicit_key_through() {
        let rels = vec![
            belongs_to("part", "Part", "partId"),
            belongs_to("spare", "Part", "spareId"),
        ];
        let resolved = resolve_collect(&rels, "Part", "spareId", true);
        assert_eq!(resolved.collect, "spare");
        assert_eq!(resolved.key_through, "spareId");
        assert_eq!(resolved.source, CollectSource::ExplicitKeyThrough);
    }

    #[test]
    fn test_collect_fallback() {
        let rels = vec![belongs_to("assembly", "Assembly", "assemblyId")];
        let resolved = resolve_collect(&rels, "SparePart", "sparePartId", false);
        assert_eq!(resolved.collect, "sparePart");
        assert_eq!(resolved.key_through, "sparePartId");
        assert_eq!(resolved.source, CollectSource::Fallback);
    }
}
