//! Resource group declarations and the reconciler that provisions them.
//!
//! A [`StackPlan`] validates declared [`ResourceGroupSpec`]s against each
//! other and orders them. The [`Reconciler`] walks that order and drives each
//! group to HEALTHY through a [`StackBackend`], publishing exports for the
//! groups that come after.

mod backend;
mod local;
mod plan;
mod reconciler;
mod spec;

pub use backend::StackBackend;
pub use local::{synthesize_outputs, LocalStackBackend};
pub use plan::StackPlan;
pub use reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
pub use spec::{ExportDecl, ResourceDeclaration, ResourceGroupSpec, StackTier};
