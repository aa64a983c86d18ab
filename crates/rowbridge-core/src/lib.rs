pub mod coercion;
pub mod config;
pub mod error;
pub mod executor;
pub mod model;
pub mod port;
pub mod store;
pub mod table;
pub mod template;
pub mod transform;
pub mod validation;

pub use coercion::{coerce, conform, CoercionError, LogicalType};
pub use config::EngineSettings;
pub use error::{ExecutionError, PortError, StoreError, TransformError};
pub use executor::MappingExecutor;
pub use model::{
    ExecutionRecord, FieldMapping, MappingDefinition, MappingOutcome, MappingResult,
    ValidationResult,
};
pub use port::{BulkLoad, Engine, LoadAtomicity, MemoryPort, RelationalPort};
pub use store::{MappingStore, MemoryMappingStore};
pub use table::{names_match, Column, TabularResult, Value};
pub use template::{parse_manifest, MappingManifest, MappingTemplate};
pub use transform::{transform_field, transform_table, Transformation};
pub use validation::MappingValidator;
