#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("relation field '{entity}.{field}' targets unknown service '{service}'")]
    UnresolvedRelationTarget {
        entity: &'static str,
        field: String,
        service: String,
    },
    #[error("invalid aggregation type [{value}] in model [{entity}]")]
    InvalidAggregationType { entity: &'static str, value: String },
    #[error("invalid aggregation field [{field}] in model [{entity}]")]
    InvalidAggregationField { entity: &'static str, field: String },
    #[error("criteria field [{field}] is not a column of model [{entity}]")]
    InvalidCriteriaField { entity: &'static str, field: String },
    #[error("invalid value for criteria field [{field}] in model [{entity}]: {reason}")]
    InvalidCriteriaValue {
        entity: &'static str,
        field: String,
        reason: String,
    },
    #[error("invalid relation '{entity}.{field}': {reason}")]
    InvalidRelation {
        entity: &'static str,
        field: String,
        reason: String,
    },
    #[error("relations of '{0}' are not loaded yet")]
    RelationsNotLoaded(&'static str),
    #[error("relations of '{0}' are already loaded")]
    RelationsAlreadyLoaded(&'static str),
    #[error("service '{0}' already registered")]
    DuplicateService(String),
    #[error("service '{0}' not found")]
    ServiceNotFound(String),
    #[error("'{entity}' has no relation field '{field}'")]
    UnknownRelationField { entity: &'static str, field: String },
    #[error("relation field '{field}' cannot hold {found}")]
    RelationTypeMismatch { field: String, found: &'static str },
    #[error("cannot convert {value} into {target}")]
    ValueConversion { value: String, target: &'static str },
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("repository error: {0}")]
    Repository(String),
}
