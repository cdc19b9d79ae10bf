//! Opaque persistence seam for operation history.
//!
//! The engine calls the repository best-effort: write failures are
//! logged and swallowed, the in-memory operation stays authoritative.

use anyhow::Error;
use async_trait::async_trait;

use qsl_api_types::Operation;

#[async_trait]
pub trait OperationRepository: Send + Sync {
    async fn add(&self, operation: &Operation) -> Result<(), Error>;

    async fn update_or_add(&self, operation: &Operation) -> Result<(), Error>;
}

/// Discards operation history (used when no external store is wired up).
pub struct NullRepository;

#[async_trait]
impl OperationRepository for NullRepository {
    async fn add(&self, _operation: &Operation) -> Result<(), Error> {
        Ok(())
    }

    async fn update_or_add(&self, _operation: &Operation) -> Result<(), Error> {
        Ok(())
    }
}
