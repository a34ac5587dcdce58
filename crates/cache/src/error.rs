use weft_core::Type;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("resource type {0} is not registered with the cache")]
    TypeNotRegistered(Type),
    #[error("index {index:?} not found for type {ty}")]
    IndexNotFound { ty: Type, index: String },
    #[error("index {index:?} already registered for type {ty}")]
    IndexExists { ty: Type, index: String },
    #[error("index {index:?}: extracting keys: {source}")]
    Extract {
        index: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("index {index:?}: bad query arguments: {message}")]
    QueryArgs { index: String, message: String },
    #[error("query {0:?} not registered")]
    QueryNotFound(String),
    #[error("query {name:?} failed: {source}")]
    Query {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

impl CacheError {
    fn index_name(&self) -> String {
        match self {
            CacheError::IndexNotFound { index, .. }
            | CacheError::IndexExists { index, .. }
            | CacheError::Extract { index, .. }
            | CacheError::QueryArgs { index, .. } => index.clone(),
            CacheError::QueryNotFound(name) | CacheError::Query { name, .. } => name.clone(),
            CacheError::TypeNotRegistered(_) => String::new(),
        }
    }
}

impl From<CacheError> for weft_core::Error {
    fn from(e: CacheError) -> Self {
        weft_core::Error::Index { index: e.index_name(), message: e.to_string() }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
