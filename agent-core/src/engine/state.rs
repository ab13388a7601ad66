//! Engine state. Holds the last fully-reconciled descriptor so unchanged
//! metadata events short-circuit without touching the system.
use metadata::NetworkDescriptor;

/// "Last good" descriptor snapshot. Owned by the single reconciliation
/// task; written only after a setup that reported overall success.
#[derive(Debug, Default)]
pub struct AppliedState {
    applied: Option<NetworkDescriptor>,
}

impl AppliedState {
    /// structural equality against the last applied descriptor
    pub fn matches(&self, descriptor: &NetworkDescriptor) -> bool {
        self.applied.as_ref() == Some(descriptor)
    }

    /// record a fully-reconciled descriptor
    pub fn record(&mut self, descriptor: NetworkDescriptor) {
        self.applied = Some(descriptor);
    }

    /// has any descriptor been applied yet
    pub fn is_applied(&self) -> bool {
        self.applied.is_some()
    }
}
