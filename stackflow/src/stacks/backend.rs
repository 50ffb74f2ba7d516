//! Provisioning backend interface.

use super::spec::ResourceGroupSpec;
use crate::core::ResourceStatus;
use crate::errors::StackflowError;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Infrastructure provider the reconciler drives.
///
/// Calls that fail for throttling or network reasons should return
/// [`StackflowError::TransientBackend`] so the reconciler retries them.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StackBackend: Send + Sync {
    /// Reports the current status of a group.
    async fn describe_status(&self, group_id: &str) -> Result<ResourceStatus, StackflowError>;

    /// Starts creating or updating a group with resolved import values.
    ///
    /// Returns once the request is accepted; completion is observed through
    /// [`StackBackend::describe_status`].
    async fn deploy(
        &self,
        spec: &ResourceGroupSpec,
        imports: &BTreeMap<String, String>,
    ) -> Result<(), StackflowError>;

    /// Starts deleting a group.
    async fn delete(&self, group_id: &str) -> Result<(), StackflowError>;

    /// Returns backend outputs keyed by `<logicalId>.<attribute>`.
    async fn outputs(&self, group_id: &str) -> Result<BTreeMap<String, String>, StackflowError>;

    /// Fingerprint of the declaration last accepted by [`StackBackend::deploy`],
    /// or `None` if the group is absent or the backend does not track it.
    async fn deployed_fingerprint(&self, group_id: &str) -> Result<Option<String>, StackflowError>;
}
