//! Remote executable shims for actions and targets
//!
//! Actions and targets share one request/response shape on the wire. The client runs
//! on workflow DON nodes, the server on the capability DON node hosting the capability.

mod client;
mod server;

pub use client::ExecutableClient;
pub use server::{request_hash, ExecutableServer};

/// Message ID of an execution request: `workflow_id/execution_id/reference_id`
pub fn execution_message_id(
    metadata: &capmesh_capabilities::RequestMetadata,
) -> Result<String, capmesh_capabilities::CapabilityError> {
    if metadata.workflow_execution_id.is_empty() {
        return Err(capmesh_capabilities::CapabilityError::Execution(
            "workflow execution ID is required".to_string(),
        ));
    }
    Ok(format!(
        "{}/{}/{}",
        metadata.workflow_id, metadata.workflow_execution_id, metadata.reference_id
    ))
}
