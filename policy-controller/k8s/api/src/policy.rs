pub mod definition;

pub use self::definition::{
    Destination, LogSpec, PolicyDefinition, PolicyDefinitionSpec, DEFAULT_NAMESPACE,
};
