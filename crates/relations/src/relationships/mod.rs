//! Relationships Module - relation metadata, include resolution and accessors

pub mod identity_map;
pub mod cache;
pub mod scope;
pub mod include;
pub mod eager_loading;
pub mod accessor;
pub mod embedded;

// Relation metadata and the model registry
pub mod metadata;
pub mod inference;
pub mod registry;

// Re-export main types
pub use accessor::RelationAccessor;
pub use cache::{RelationCache, RelationValue};
pub use eager_loading::IncludeResolver;
pub use identity_map::{build_one_to_many, build_one_to_one, join, FieldSource, IdentityKey, IdentityMap};
pub use include::{IncludeNode, IncludeSpec};
pub use scope::{Properties, PropertiesFn, Scope, ScopeComposer, ScopeFn};

// Re-export metadata system types
pub use inference::{CollectResolution, ForeignKeyConvention};
pub use metadata::{
    CollectSource, PolymorphicConfig, PolymorphicParams, RelationDefinition, RelationOptions, RelationParams,
    RelationType, ThroughConfig,
};
pub use registry::{ModelDefinition, ModelId, ModelRegistry, PropertyType, RegistryStats, RelationStatus};
