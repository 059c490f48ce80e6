use std::sync::Arc;

use elif_relations::{
    CollectSource, DataSource, MemoryConnector, ModelDefinition, ModelError, RelationParams, RelationStatus,
    RelationType,
};
use serde_json::json;

fn source() -> DataSource {
    DataSource::new(Arc::new(MemoryConnector::new()))
}

#[test]
fn test_relation_waits_for_target_model() {
    let source = source();
    source.define_model(ModelDefinition::new("User")).unwrap();

    let status = source
        .define_relation("User", "posts", RelationParams::has_many("Post"))
        .unwrap();
    assert!(matches!(status, RelationStatus::Pending(ref missing) if missing == "Post"));
    assert!(matches!(source.relation("User", "posts"), Err(ModelError::Relationship(_))));

    source.define_model(ModelDefinition::new("Post")).unwrap();
    let posts = source.relation("User", "posts").unwrap().unwrap();
    assert_eq!(posts.key_to, "userId");
    assert!(source.model("Post").unwrap().unwrap().has_property("userId"));
}

#[test]
fn test_invalid_declarations_fail_immediately() {
    let source = source();
    source.define_model(ModelDefinition::new("User")).unwrap();

    let unknown = source.define_relation_value("User", "posts", &json!({ "type": "hasSome", "model": "Post" }));
    assert!(matches!(unknown, Err(ModelError::Configuration(_))));

    let untyped = source.define_relation_value("User", "posts", &json!({ "model": "Post" }));
    assert!(matches!(untyped, Err(ModelError::Configuration(_))));

    assert!(source.relation("User", "posts").unwrap().is_none());
}

#[test]
fn test_define_model_from_json() {
    let source = source();
    source
        .define_model_value("Post", &json!({ "properties": { "title": "string" } }))
        .unwrap();
    source
        .define_model_value(
            "User",
            &json!({
                "properties": { "email": { "type": "string", "id": true } },
                "relations": {
                    "posts": { "type": "hasMany", "model": "Post", "foreignKey": "authorEmail" },
                    "favorite": { "type": "belongsTo", "model": "Post" }
                }
            }),
        )
        .unwrap();

    let user = source.model("User").unwrap().unwrap();
    assert_eq!(user.id_property, "email");
    assert!(user.has_property("favoriteId"));

    let posts = source.relation("User", "posts").unwrap().unwrap();
    assert_eq!((posts.key_from.as_str(), posts.key_to.as_str()), ("email", "authorEmail"));

    let stats = source.stats().unwrap();
    assert_eq!(stats.total_relations, 2);
    assert_eq!(stats.pending_relations, 0);
}

#[test]
fn test_through_collect_prefers_declaration_order() {
    let source = source();
    for model in ["Physician", "Patient", "Appointment"] {
        source.define_model(ModelDefinition::new(model)).unwrap();
    }
    source
        .define_relation("Appointment", "referrer", RelationParams::belongs_to("Patient"))
        .unwrap();
    source
        .define_relation("Appointment", "attendee", RelationParams::belongs_to("Patient"))
        .unwrap();
    source
        .define_relation(
            "Physician",
            "patients",
            RelationParams::has_many("Patient").through("Appointment"),
        )
        .unwrap();

    let patients = source.relation("Physician", "patients").unwrap().unwrap();
    assert_eq!(patients.kind, RelationType::HasManyThrough);
    let through = patients.through.as_ref().unwrap();
    assert_eq!(through.collect, "referrer");
    assert_eq!(through.key_through, "referrerId");
    assert_eq!(through.collect_source, CollectSource::MatchedTargetModel);

    source
        .define_relation(
            "Physician",
            "attendees",
            RelationParams::has_many("Patient").through("Appointment").key_through("attendeeId"),
        )
        .unwrap();
    let attendees = source.relation("Physician", "attendees").unwrap().unwrap();
    let through = attendees.through.as_ref().unwrap();
    assert_eq!(through.collect, "attendee");
    assert_eq!(through.collect_source, CollectSource::ExplicitKeyThrough);
}

#[test]
fn test_through_collect_prefers_matching_foreign_key() {
    let source = source();
    for model in ["Assembly", "Part", "AssemblyPart"] {
        source.define_model(ModelDefinition::new(model)).unwrap();
    }
    source
        .define_relation("AssemblyPart", "replacement", RelationParams::belongs_to("Part"))
        .unwrap();
    source
        .define_relation("AssemblyPart", "part", RelationParams::belongs_to("Part"))
        .unwrap();
    source
        .define_relation(
            "Assembly",
            "parts",
            RelationParams::has_many("Part").through("AssemblyPart"),
        )
        .unwrap();

    let parts = source.relation("Assembly", "parts").unwrap().unwrap();
    let through = parts.through.as_ref().unwrap();
    assert_eq!(through.collect, "part");
    assert_eq!(through.key_through, "partId");
    assert_eq!(through.collect_source, CollectSource::MatchedForeignKey);
}

#[test]
fn test_late_belongs_to_rekeys_through_model() {
    let source = source();
    for model in ["Assembly", "Part", "AssemblyPart"] {
        source.define_model(ModelDefinition::new(model)).unwrap();
    }
    source
        .define_relation(
            "Assembly",
            "parts",
            RelationParams::has_many("Part").through("AssemblyPart"),
        )
        .unwrap();
    let through = source.relation("Assembly", "parts").unwrap().unwrap().through.clone().unwrap();
    assert_eq!(through.collect_source, CollectSource::Fallback);

    source
        .define_relation("AssemblyPart", "spare", RelationParams::belongs_to("Part"))
        .unwrap();

    let through = source.relation("Assembly", "parts").unwrap().unwrap().through.clone().unwrap();
    assert_eq!((through.collect.as_str(), through.key_through.as_str()), ("spare", "spareId"));
    let join = source.model("AssemblyPart").unwrap().unwrap();
    assert!(join.has_property("spareId"));
    assert!(!join.has_property("partId"));
}
