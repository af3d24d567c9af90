use uuid::Uuid;

/// Mints globally unique identifiers (used for retry bucket ids).
pub trait UniqueIdentifierGenerator: Send + Sync {
    fn generate(&self) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl UniqueIdentifierGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}
